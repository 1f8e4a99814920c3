/// A binary tree data structure where each parent node is the minimum of its child nodes
///
/// Unwritten slots hold `f32::INFINITY` so the root reflects only occupied slots.
#[derive(Debug, Clone)]
pub struct MinTree {
    tree: Vec<f32>,
    leaves: usize,
}

impl MinTree {
    /// Initialize a new `MinTree` with a given capacity
    pub fn new(capacity: usize) -> Self {
        let leaves = capacity.max(1).next_power_of_two();
        Self {
            tree: vec![f32::INFINITY; 2 * leaves - 1],
            leaves,
        }
    }

    /// Update the value at a provided index
    pub fn update(&mut self, ix: usize, value: f32) {
        let mut ix = ix + self.leaves - 1;
        self.tree[ix] = value;

        while ix > 0 {
            ix = (ix - 1) / 2;
            self.tree[ix] = self.tree[2 * ix + 1].min(self.tree[2 * ix + 2]);
        }
    }

    /// Get the minimum of all values stored, `None` if nothing was stored yet
    pub fn min(&self) -> Option<f32> {
        let min = self.tree[0];
        min.is_finite().then_some(min)
    }
}
