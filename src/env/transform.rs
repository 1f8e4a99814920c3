use ndarray::{Array1, Axis};

use super::{Environment, NEXT_OBSERVATION_KEY, OBSERVATION_KEY};
use crate::{
    error::{Error, Result},
    tensordict::{Field, TensorDict},
};

/// An in-place rewrite of the records an environment emits
pub trait Transform {
    fn apply(&self, td: &mut TensorDict) -> Result<()>;
}

/// Affine normalization of observation fields
///
/// With `standard_normal` set, observations become `(obs - loc) / scale`, otherwise
/// `obs * scale + loc`. `loc` and `scale` hold either one value for every feature or one value per
/// entry of the last axis.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationNorm {
    loc: Array1<f32>,
    scale: Array1<f32>,
    standard_normal: bool,
    keys: Vec<String>,
}

impl ObservationNorm {
    /// Normalization with scalar `loc` and `scale` applied to [`OBSERVATION_KEY`] and
    /// [`NEXT_OBSERVATION_KEY`]
    pub fn new(loc: f32, scale: f32, standard_normal: bool) -> Result<Self> {
        Self::per_feature(Array1::from_elem(1, loc), Array1::from_elem(1, scale), standard_normal)
    }

    pub fn per_feature(loc: Array1<f32>, scale: Array1<f32>, standard_normal: bool) -> Result<Self> {
        if loc.len() != scale.len() || loc.is_empty() {
            return Err(Error::Shape(format!(
                "`loc` and `scale` must have the same non-zero length, got {} and {}",
                loc.len(),
                scale.len()
            )));
        }
        if scale.iter().any(|&s| s == 0.0 || !s.is_finite()) {
            return Err(Error::InvalidConfig(String::from(
                "`scale` must be finite and non-zero",
            )));
        }
        Ok(Self {
            loc,
            scale,
            standard_normal,
            keys: vec![OBSERVATION_KEY.to_string(), NEXT_OBSERVATION_KEY.to_string()],
        })
    }

    /// Standardizing normalization from the per-feature mean and standard deviation of
    /// `observations`, reduced over every axis but the last
    ///
    /// Features with zero variance keep a scale of 1.
    pub fn from_stats(observations: &Field) -> Result<Self> {
        let obs = observations
            .as_float()
            .ok_or_else(|| Error::Shape(String::from("observations must be floats")))?;
        if obs.ndim() < 2 {
            return Err(Error::Shape(String::from(
                "statistics need a batch axis and a feature axis",
            )));
        }
        let features = obs.shape()[obs.ndim() - 1];
        let rows = obs.to_shape((obs.len() / features.max(1), features))?;
        let loc = rows
            .mean_axis(Axis(0))
            .ok_or_else(|| Error::Shape(String::from("no observations to compute statistics from")))?;
        let scale = rows
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > 0.0 { s } else { 1.0 });
        Self::per_feature(loc, scale, true)
    }

    /// Replace the fields the normalization applies to
    pub fn keys(mut self, keys: &[&str]) -> Self {
        self.keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    fn normalize(&self, field: &mut Field) -> Result<()> {
        let a = field
            .as_float_mut()
            .ok_or_else(|| Error::Shape(String::from("only float fields can be normalized")))?;
        let features = a.shape().last().copied().unwrap_or(1);
        let n = self.loc.len();
        if n != 1 && n != features {
            return Err(Error::Shape(format!(
                "{n} normalization parameters for {features} features"
            )));
        }

        let last = Axis(a.ndim().saturating_sub(1));
        let (loc, scale) = (&self.loc, &self.scale);
        let standard_normal = self.standard_normal;
        if a.ndim() == 0 {
            a.mapv_inplace(|x| affine(x, loc[0], scale[0], standard_normal));
            return Ok(());
        }
        for mut lane in a.lanes_mut(last) {
            for (j, x) in lane.iter_mut().enumerate() {
                let k = if n == 1 { 0 } else { j };
                *x = affine(*x, loc[k], scale[k], standard_normal);
            }
        }
        Ok(())
    }
}

fn affine(x: f32, loc: f32, scale: f32, standard_normal: bool) -> f32 {
    if standard_normal {
        (x - loc) / scale
    } else {
        x * scale + loc
    }
}

impl Transform for ObservationNorm {
    fn apply(&self, td: &mut TensorDict) -> Result<()> {
        for key in &self.keys {
            if let Some(field) = td.get_mut(key) {
                self.normalize(field)?;
            }
        }
        Ok(())
    }
}

/// An environment whose emitted records pass through a [`Transform`]
pub struct TransformedEnv<E, T> {
    env: E,
    transform: T,
}

impl<E: Environment, T: Transform> TransformedEnv<E, T> {
    pub fn new(env: E, transform: T) -> Self {
        Self { env, transform }
    }

    pub fn inner(&self) -> &E {
        &self.env
    }

    pub fn into_inner(self) -> E {
        self.env
    }
}

impl<E: Environment, T: Transform> Environment for TransformedEnv<E, T> {
    fn reset(&mut self) -> Result<TensorDict> {
        let mut td = self.env.reset()?;
        self.transform.apply(&mut td)?;
        Ok(td)
    }

    fn step(&mut self, td: &TensorDict) -> Result<TensorDict> {
        let mut next = self.env.step(td)?;
        self.transform.apply(&mut next)?;
        Ok(next)
    }

    fn action_mask(&self) -> Field {
        self.env.action_mask()
    }
}
