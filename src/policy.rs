use burn::{
    nn,
    tensor::{activation::softmax, backend::Backend, Bool, Data, Shape, Tensor},
};
use log::trace;
use ndarray::Axis;
use rand::{
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
    SeedableRng,
};

use crate::{
    env::{ACTION_KEY, AVAILABLE_ACTIONS_KEY, OBSERVATION_KEY},
    error::{Error, Result},
    tensordict::{Field, TensorDict},
};

/// Field holding the masked logits computed by [`MaskedLogitPolicy`]
pub const LOGITS_KEY: &str = "logits";

/// Writes actions into a record holding an observation
pub trait Policy {
    fn act(&mut self, td: &mut TensorDict) -> Result<()>;
}

/// A burn model mapping a batch of observations to one logit per action
///
/// ### Generics
/// - `B`: A burn backend
pub trait LogitModel<B: Backend> {
    /// Forward pass from observations of shape `[batch, features]` to logits of shape `[batch, actions]`
    fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2>;
}

impl<B: Backend> LogitModel<B> for nn::Linear<B> {
    fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        nn::Linear::forward(self, input)
    }
}

/// How [`MaskedLogitPolicy`] turns masked logits into actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionSelection {
    /// Highest logit among the available actions
    #[default]
    Greedy,
    /// Draw from the softmax over the available actions
    Sample,
}

/// Set the logits of unavailable actions to negative infinity
///
/// `available` is a boolean field of the same `[batch, actions]` shape as `logits`. A row without
/// any available action is an error.
pub fn mask_logits<B: Backend>(logits: Tensor<B, 2>, available: &Field) -> Result<Tensor<B, 2>> {
    let mask = available
        .as_bool()
        .ok_or_else(|| Error::Shape(format!("`{AVAILABLE_ACTIONS_KEY}` must be boolean")))?;
    let dims = logits.dims();
    if mask.shape() != dims {
        return Err(Error::Shape(format!(
            "mask of shape {:?} for logits of shape {dims:?}",
            mask.shape()
        )));
    }
    if let Some(row) = mask.axis_iter(Axis(0)).position(|row| !row.iter().any(|&m| m)) {
        return Err(Error::NoAvailableAction(row));
    }

    let unavailable = mask.iter().map(|&m| !m).collect::<Vec<_>>();
    let unavailable =
        Tensor::<B, 2, Bool>::from_bool(Data::new(unavailable, Shape::new(dims)), &logits.device());
    Ok(logits.mask_fill(unavailable, f32::NEG_INFINITY))
}

/// A policy choosing among the available actions of every row from the logits of a [`LogitModel`]
///
/// Reads [`OBSERVATION_KEY`] of shape `[batch, features]` and [`AVAILABLE_ACTIONS_KEY`] of shape
/// `[batch, actions]`, and writes [`LOGITS_KEY`] and [`ACTION_KEY`]. Masked actions are never
/// chosen.
pub struct MaskedLogitPolicy<B: Backend, M> {
    model: M,
    device: &'static B::Device,
    selection: ActionSelection,
    rng: StdRng,
}

impl<B: Backend, M: LogitModel<B>> MaskedLogitPolicy<B, M> {
    /// Initialize a new `MaskedLogitPolicy`
    ///
    /// ### Arguments
    /// - `model` The logit model
    /// - `device` A static reference to the device used for the `model`
    /// - `selection` Greedy or sampled action selection
    pub fn new(model: M, device: &'static B::Device, selection: ActionSelection) -> Self {
        Self {
            model,
            device,
            selection,
            rng: StdRng::from_entropy(),
        }
    }

    /// Seed the RNG used by [`ActionSelection::Sample`]
    pub fn seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    fn sample(&mut self, logits: Tensor<B, 2>) -> Result<Vec<i64>> {
        let [_, n_actions] = logits.dims();
        let probs = softmax(logits, 1).into_data().convert::<f32>().value;
        probs
            .chunks(n_actions)
            .enumerate()
            .map(|(row, p)| {
                let dist = WeightedIndex::new(p).map_err(|_| Error::NoAvailableAction(row))?;
                Ok(dist.sample(&mut self.rng) as i64)
            })
            .collect()
    }
}

impl<B: Backend, M: LogitModel<B>> Policy for MaskedLogitPolicy<B, M> {
    fn act(&mut self, td: &mut TensorDict) -> Result<()> {
        let obs = td.to_tensor::<B, 2>(OBSERVATION_KEY, self.device)?;
        let logits = self.model.forward(obs);
        let logits = mask_logits(logits, td.try_get(AVAILABLE_ACTIONS_KEY)?)?;
        let [n, _] = logits.dims();

        let actions = match self.selection {
            ActionSelection::Greedy => {
                let actions = logits.clone().argmax(1).reshape([n]);
                actions.into_data().convert::<i64>().value
            }
            ActionSelection::Sample => self.sample(logits.clone())?,
        };
        trace!("selected actions {actions:?}");

        td.set_tensor(LOGITS_KEY, logits)?;
        td.set(ACTION_KEY, Field::int(&[n], actions)?)
    }
}
