use burn::{
    backend::{ndarray::NdArrayDevice, NdArray},
    nn::LinearConfig,
};
use env::{Gather, NUM_ACTIONS, OBSERVATION_SIZE};
use log::info;
use once_cell::sync::Lazy;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tensordict_rl::{
    env::{rollout, ObservationNorm, TransformedEnv, REWARD_KEY},
    memory::{PrioritizedReplayBuffer, PrioritizedReplayBufferConfig, WEIGHT_KEY},
    policy::{ActionSelection, MaskedLogitPolicy, LOGITS_KEY},
    Error, Field, Result,
};

mod env;

type Backend = NdArray;

static DEVICE: Lazy<NdArrayDevice> = Lazy::new(NdArrayDevice::default);

const NUM_AGENTS: usize = 3;
const NUM_EPISODES: usize = 32;
const MAX_STEPS: usize = 16;
const BATCH_SIZE: usize = 8;

fn main() -> Result<()> {
    env_logger::init();

    let mut env = TransformedEnv::new(
        Gather::new(NUM_AGENTS, 8, MAX_STEPS, 0),
        ObservationNorm::new(0.5, 0.25, true)?,
    );
    let model = LinearConfig::new(OBSERVATION_SIZE, NUM_ACTIONS).init::<Backend>(&*DEVICE);
    let mut policy =
        MaskedLogitPolicy::<Backend, _>::new(model, &*DEVICE, ActionSelection::Sample).seed(0);

    let config = PrioritizedReplayBufferConfig::default()
        .capacity(256)
        .beta_annealing(1.0, NUM_EPISODES)
        .seed(Some(0));
    let buffer = PrioritizedReplayBuffer::new(&config)?;

    let mut rng = StdRng::seed_from_u64(0);
    let noise = Normal::new(0.0f32, 0.1).map_err(|e| Error::InvalidConfig(e.to_string()))?;

    for episode in 0..NUM_EPISODES {
        // one row per step, each holding every agent
        let trajectory = rollout(&mut env, &mut policy, MAX_STEPS)?.exclude(&[LOGITS_KEY]);
        buffer.extend(&trajectory)?;

        if buffer.len() < BATCH_SIZE {
            continue;
        }
        let mut batch = buffer.sample_with_weights(BATCH_SIZE)?;

        // stand-in for a learner's temporal difference error
        let reward = batch
            .try_get(REWARD_KEY)?
            .as_float()
            .ok_or_else(|| Error::Shape(String::from("rewards must be floats")))?;
        let td_error = reward.mapv(|r| r + noise.sample(&mut rng));
        batch.set(config.priority_key.as_str(), Field::Float(td_error))?;
        buffer.update_priority(&batch)?;

        let mean_weight = batch
            .try_get(WEIGHT_KEY)?
            .as_float()
            .and_then(|w| w.mean())
            .unwrap_or(0.0);
        info!(
            "episode {episode}: {} steps, {} rows stored, beta {:.3}, mean weight {mean_weight:.3}",
            trajectory.len(),
            buffer.len(),
            buffer.beta(),
        );
    }

    Ok(())
}
