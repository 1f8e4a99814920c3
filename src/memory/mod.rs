mod collate;
mod config;
mod prioritized;

pub use collate::{Collate, CollateKind, Concat, Stack};
pub use config::{BetaAnnealing, PrioritizedReplayBufferConfig, WeightNormalizer, DEFAULT_PRIORITY_KEY};
pub use prioritized::{PrioritizedReplayBuffer, INDEX_KEY, WEIGHT_KEY};
