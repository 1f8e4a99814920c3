use serde::{Deserialize, Serialize};

use crate::{error::Result, tensordict::TensorDict};

/// Strategy merging the rows gathered by a sample into one batch
///
/// Any `Fn(Vec<TensorDict>) -> Result<TensorDict>` closure is a valid strategy, which is how
/// callers reconcile rows with differing field sets.
pub trait Collate: Send + Sync {
    fn collate(&self, rows: Vec<TensorDict>) -> Result<TensorDict>;
}

/// Stacks rows along a new leading axis; rows must agree on fields and shapes
#[derive(Debug, Clone, Copy, Default)]
pub struct Stack;

impl Collate for Stack {
    fn collate(&self, rows: Vec<TensorDict>) -> Result<TensorDict> {
        TensorDict::stack(&rows)
    }
}

/// Concatenates rows along their own leading axis without adding one
///
/// Rows need at least one batch axis, e.g. trajectory rows of shape `[T]` become `[k * T]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Concat;

impl Collate for Concat {
    fn collate(&self, rows: Vec<TensorDict>) -> Result<TensorDict> {
        TensorDict::cat(&rows)
    }
}

impl<F> Collate for F
where
    F: Fn(Vec<TensorDict>) -> Result<TensorDict> + Send + Sync,
{
    fn collate(&self, rows: Vec<TensorDict>) -> Result<TensorDict> {
        self(rows)
    }
}

/// Serializable choice between the built-in collation strategies
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Default)]
pub enum CollateKind {
    #[default]
    Stack,
    Concat,
}

impl CollateKind {
    pub fn build(self) -> Box<dyn Collate> {
        match self {
            CollateKind::Stack => Box::new(Stack),
            CollateKind::Concat => Box::new(Concat),
        }
    }
}
