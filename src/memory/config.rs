use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};

use super::CollateKind;
use crate::error::{Error, Result};

/// Field name read by `extend` and `update_priority` unless configured otherwise
pub const DEFAULT_PRIORITY_KEY: &str = "td_error";

/// How importance-sampling weights are scaled into `(0, 1]`
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Default)]
pub enum WeightNormalizer {
    /// Divide by the weight of the lowest-priority occupied slot, the largest weight any draw can get
    #[default]
    All,

    /// Divide by the largest weight within the sampled batch
    Batch,
}

/// Linear schedule of the importance-sampling exponent
///
/// β moves from the configured `beta` to `beta_final` over `n_updates` calls to `update_priority`.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct BetaAnnealing {
    pub beta_final: f32,
    pub n_updates: usize,
}

/// Configuration of a [`PrioritizedReplayBuffer`](super::PrioritizedReplayBuffer)
///
/// ```
/// use tensordict_rl::memory::{PrioritizedReplayBufferConfig, WeightNormalizer};
///
/// let config = PrioritizedReplayBufferConfig::default()
///     .capacity(5)
///     .alpha(0.7)
///     .beta(0.9)
///     .priority_key("pk")
///     .normalize(WeightNormalizer::Batch)
///     .seed(Some(0));
/// assert_eq!(config.capacity, 5);
/// ```
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
#[serde(default)]
pub struct PrioritizedReplayBufferConfig {
    /// Maximum number of rows held before the oldest are overwritten
    pub capacity: usize,

    /// Priority exponent; 0 gives uniform sampling
    pub alpha: f32,

    /// Importance-sampling exponent
    pub beta: f32,

    /// Optional schedule moving `beta` over the course of training
    pub beta_annealing: Option<BetaAnnealing>,

    /// Name of the field carrying priorities on insertion and update
    pub priority_key: String,

    /// Added to every priority before exponentiation so no stored row becomes unreachable
    pub eps: f32,

    pub normalize: WeightNormalizer,

    /// Built-in collation used by `sample`; replaced by `with_collate`
    pub collate: CollateKind,

    /// Seed of the sampling RNG, entropy-seeded when `None`
    pub seed: Option<u64>,
}

impl Default for PrioritizedReplayBufferConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            alpha: 0.6,
            beta: 0.4,
            beta_annealing: None,
            priority_key: DEFAULT_PRIORITY_KEY.to_string(),
            eps: 1e-8,
            normalize: WeightNormalizer::All,
            collate: CollateKind::Stack,
            seed: None,
        }
    }
}

impl PrioritizedReplayBufferConfig {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }

    pub fn beta_annealing(mut self, beta_final: f32, n_updates: usize) -> Self {
        self.beta_annealing = Some(BetaAnnealing {
            beta_final,
            n_updates,
        });
        self
    }

    pub fn priority_key(mut self, key: impl Into<String>) -> Self {
        self.priority_key = key.into();
        self
    }

    pub fn eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    pub fn normalize(mut self, normalize: WeightNormalizer) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn collate(mut self, collate: CollateKind) -> Self {
        self.collate = collate;
        self
    }

    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::Capacity(self.capacity));
        }
        for (name, value) in [("alpha", self.alpha), ("beta", self.beta), ("eps", self.eps)] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(Error::InvalidConfig(format!(
                    "`{name}` must be finite and non-negative, got {value}"
                )));
            }
        }
        if self.priority_key.is_empty() {
            return Err(Error::InvalidConfig(String::from(
                "`priority_key` must not be empty",
            )));
        }
        Ok(())
    }

    /// Loads the configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let config = serde_yaml::from_reader(rdr)?;
        Ok(config)
    }

    /// Saves the configuration to a YAML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}
