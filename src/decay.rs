use crate::error::{Error, Result};

/// An implementation of a time-varying value
pub trait Decay {
    /// Calculate value at time `t`
    fn evaluate(&self, t: f32) -> f32;
}

fn validate(rate: f32, vi: f32, vf: f32) -> Result<()> {
    ((rate >= 0.0 && vi >= vf) || (rate < 0.0 && vi < vf))
        .then_some(())
        .ok_or_else(|| Error::InvalidConfig(String::from("`vi - vf` must have same sign as `rate`")))
}

/// A constant value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Constant {
    value: f32,
}

impl Constant {
    pub fn new(value: f32) -> Self {
        Self { value }
    }
}

impl Decay for Constant {
    fn evaluate(&self, _t: f32) -> f32 {
        self.value
    }
}

/// v(t) = v<sub>i</sub> - rt, clamped at v<sub>f</sub>
///
/// A negative rate moves the value upward, which is how the importance-sampling exponent
/// is annealed towards 1.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Linear {
    rate: f32,
    vi: f32,
    vf: f32,
}

impl Linear {
    pub fn new(rate: f32, vi: f32, vf: f32) -> Result<Self> {
        validate(rate, vi, vf)?;
        Ok(Self { rate, vi, vf })
    }

    /// Linear schedule moving from `vi` to `vf` over `steps` time units
    pub fn over(vi: f32, vf: f32, steps: usize) -> Result<Self> {
        if steps == 0 {
            return Err(Error::InvalidConfig(String::from(
                "linear schedule needs at least one step",
            )));
        }
        Self::new((vi - vf) / steps as f32, vi, vf)
    }
}

impl Decay for Linear {
    fn evaluate(&self, t: f32) -> f32 {
        let &Self { rate, vi, vf } = self;
        let v = vi - rate * t;
        if rate >= 0.0 {
            v.max(vf)
        } else {
            v.min(vf)
        }
    }
}
