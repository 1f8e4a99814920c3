//! Environments producing [`TensorDict`] records
//!
//! Records exchanged with an environment follow a fixed key layout. [`Environment::reset`] returns
//! a record holding [`OBSERVATION_KEY`], a policy writes [`ACTION_KEY`] into it, and
//! [`Environment::step`] answers with [`NEXT_OBSERVATION_KEY`], [`REWARD_KEY`] and [`DONE_KEY`].
//! Multi-agent environments put the agents on the leading batch axis.

mod transform;

pub use transform::{ObservationNorm, Transform, TransformedEnv};

use log::debug;

use crate::{
    error::{Error, Result},
    policy::Policy,
    tensordict::{Field, TensorDict},
};

pub const OBSERVATION_KEY: &str = "observation";
pub const AVAILABLE_ACTIONS_KEY: &str = "available_actions";
pub const ACTION_KEY: &str = "action";
pub const NEXT_OBSERVATION_KEY: &str = "next_observation";
pub const REWARD_KEY: &str = "reward";
pub const DONE_KEY: &str = "done";

/// A discrete-time environment exchanging [`TensorDict`] records with a policy
pub trait Environment {
    /// Reset the environment to an initial state
    ///
    /// **Returns** a record holding the first observation
    fn reset(&mut self) -> Result<TensorDict>;

    /// Apply the actions stored in `td` under [`ACTION_KEY`]
    ///
    /// **Returns** a record with the same batch shape holding the next observation, the reward
    /// and the termination flag
    fn step(&mut self, td: &TensorDict) -> Result<TensorDict>;

    /// Boolean field of shape `[..batch, n_actions]` marking the actions legal in the current state
    fn action_mask(&self) -> Field;
}

/// Whether any element of a termination field is set
fn is_done(done: &Field) -> bool {
    match done {
        Field::Bool(a) => a.iter().any(|&d| d),
        Field::Int(a) => a.iter().any(|&d| d != 0),
        Field::Float(a) => a.iter().any(|&d| d != 0.0),
    }
}

/// Run `policy` in `env` for at most `max_steps` steps, starting from a reset
///
/// Before every step the current action mask is stored under [`AVAILABLE_ACTIONS_KEY`]. The
/// records of all steps, each merged with the environment's answer, are stacked into one record
/// with batch shape `[steps, ..batch]`. The rollout ends early once any element of [`DONE_KEY`]
/// is set.
pub fn rollout<E, P>(env: &mut E, policy: &mut P, max_steps: usize) -> Result<TensorDict>
where
    E: Environment + ?Sized,
    P: Policy + ?Sized,
{
    if max_steps == 0 {
        return Err(Error::InvalidConfig(String::from(
            "a rollout needs at least one step",
        )));
    }

    let mut td = env.reset()?;
    let mut steps = Vec::new();
    loop {
        td.set(AVAILABLE_ACTIONS_KEY, env.action_mask())?;
        policy.act(&mut td)?;
        td.update(env.step(&td)?)?;

        let done = td.get(DONE_KEY).map_or(false, is_done);
        let next = td.try_get(NEXT_OBSERVATION_KEY)?.clone();
        let batch_size = td.batch_size().to_vec();
        steps.push(td);

        if done || steps.len() == max_steps {
            break;
        }
        td = TensorDict::new(batch_size).with(OBSERVATION_KEY, next)?;
    }

    debug!("rollout finished after {} steps", steps.len());
    TensorDict::stack(&steps)
}
