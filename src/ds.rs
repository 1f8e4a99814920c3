mod min_tree;
mod ring_buffer;
mod sum_tree;

pub use min_tree::MinTree;
pub use ring_buffer::RingBuffer;
pub use sum_tree::SumTree;
