/// A binary tree data structure where each parent node is the sum of its child nodes
///
/// Leaves are slot priorities. Slots that were never written hold zero and are
/// therefore never returned by [`find`](SumTree::find) while the root is positive.
#[derive(Debug, Clone)]
pub struct SumTree {
    tree: Vec<f32>,
    max: f32,
    capacity: usize,
    leaves: usize,
}

impl SumTree {
    /// Initialize a new `SumTree` with a given capacity
    pub fn new(capacity: usize) -> Self {
        let leaves = capacity.max(1).next_power_of_two();
        Self {
            tree: vec![0.0; 2 * leaves - 1],
            max: 0.0,
            capacity,
            leaves,
        }
    }

    /// Update the value at a provided index
    ///
    /// Parents are recomputed from their children so repeated updates do not accumulate drift.
    pub fn update(&mut self, ix: usize, value: f32) {
        debug_assert!(ix < self.capacity, "slot {ix} outside capacity {}", self.capacity);
        let mut ix = ix + self.leaves - 1;
        self.tree[ix] = value;

        while ix > 0 {
            ix = (ix - 1) / 2;
            self.tree[ix] = self.tree[2 * ix + 1] + self.tree[2 * ix + 2];
        }

        if value > self.max {
            self.max = value;
        }
    }

    /// Get the value stored at a provided index
    pub fn get(&self, ix: usize) -> f32 {
        self.tree[ix + self.leaves - 1]
    }

    /// Find the index `i` and value `v` whose cumulative interval `[sum(0..i), sum(0..=i))` contains `value`
    ///
    /// `value` is expected in `[0, sum())`. Subtrees with zero mass are never entered, so the
    /// returned slot always has a positive value as long as the tree is not empty.
    pub fn find(&self, value: f32) -> (usize, f32) {
        let mut ix = 0;
        let mut val = value;
        while ix < self.leaves - 1 {
            let left = 2 * ix + 1;
            let right = left + 1;
            ix = if val < self.tree[left] || self.tree[right] <= 0.0 {
                left
            } else {
                val -= self.tree[left];
                right
            }
        }

        let ix = ix - (self.leaves - 1);
        (ix, self.get(ix))
    }

    /// Get the sum of all values stored
    pub fn sum(&self) -> f32 {
        self.tree[0]
    }

    /// Get the max of all values ever stored
    pub fn max(&self) -> f32 {
        self.max
    }
}
