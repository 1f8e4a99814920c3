//! Prioritized experience replay over batched records of named arrays
//!
//! The central type is [`memory::PrioritizedReplayBuffer`], which stores the rows of
//! [`TensorDict`] records, samples them proportionally to a priority signal and attaches
//! importance-sampling weights. [`env`] and [`policy`] hold the glue producing such records from
//! an environment with a masked policy.

/// Implementations of strategies for time-varying hyperparameters
pub mod decay;

/// Data structures
pub mod ds;

/// Environments and observation transforms
pub mod env;

pub mod error;

/// Experience replay
pub mod memory;

/// Policies acting on records
pub mod policy;

/// Batched records of named arrays
pub mod tensordict;

pub use error::{Error, Result};
pub use tensordict::{Field, TensorDict};
