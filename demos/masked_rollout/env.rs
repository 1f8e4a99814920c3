use ndarray::{Array1, Array2};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tensordict_rl::{
    env::{Environment, ACTION_KEY, DONE_KEY, NEXT_OBSERVATION_KEY, OBSERVATION_KEY, REWARD_KEY},
    Error, Field, Result, TensorDict,
};

pub const OBSERVATION_SIZE: usize = 3;
pub const NUM_ACTIONS: usize = 3;

/// Agents on a bounded line, each walking towards its own target cell
///
/// Actions are 0 (stay), 1 (left) and 2 (right). Moving off the line is masked out. Every agent
/// is rewarded with its negative distance to the target, and the episode ends once every agent
/// has arrived or `max_steps` have passed.
pub struct Gather {
    positions: Vec<usize>,
    targets: Vec<usize>,
    size: usize,
    max_steps: usize,
    t: usize,
    rng: StdRng,
}

impl Gather {
    pub fn new(agents: usize, size: usize, max_steps: usize, seed: u64) -> Self {
        Self {
            positions: vec![0; agents],
            targets: vec![0; agents],
            size,
            max_steps,
            t: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn observation(&self) -> Field {
        let size = self.size as f32;
        Array2::from_shape_fn((self.positions.len(), OBSERVATION_SIZE), |(i, j)| match j {
            0 => self.positions[i] as f32 / size,
            1 => self.targets[i] as f32 / size,
            _ => 1.0,
        })
        .into()
    }
}

impl Environment for Gather {
    fn reset(&mut self) -> Result<TensorDict> {
        let size = self.size;
        for (pos, target) in self.positions.iter_mut().zip(self.targets.iter_mut()) {
            *pos = self.rng.gen_range(0..size);
            *target = self.rng.gen_range(0..size);
        }
        self.t = 0;
        TensorDict::new([self.positions.len()]).with(OBSERVATION_KEY, self.observation())
    }

    fn step(&mut self, td: &TensorDict) -> Result<TensorDict> {
        let actions = td
            .try_get(ACTION_KEY)?
            .as_int()
            .ok_or_else(|| Error::Shape(String::from("actions must be integers")))?;
        for (pos, &action) in self.positions.iter_mut().zip(actions.iter()) {
            match action {
                1 if *pos > 0 => *pos -= 1,
                2 if *pos + 1 < self.size => *pos += 1,
                _ => {}
            }
        }
        self.t += 1;

        let distances = self
            .positions
            .iter()
            .zip(&self.targets)
            .map(|(&p, &t)| p.abs_diff(t) as f32)
            .collect::<Array1<_>>();
        let finished = self.t >= self.max_steps || distances.iter().all(|&d| d == 0.0);

        TensorDict::new([self.positions.len()])
            .with(NEXT_OBSERVATION_KEY, self.observation())?
            .with(REWARD_KEY, distances.mapv(|d| -d))?
            .with(DONE_KEY, Array1::from_elem(self.positions.len(), finished))
    }

    fn action_mask(&self) -> Field {
        Array2::from_shape_fn((self.positions.len(), NUM_ACTIONS), |(i, a)| match a {
            1 => self.positions[i] > 0,
            2 => self.positions[i] + 1 < self.size,
            _ => true,
        })
        .into()
    }
}
