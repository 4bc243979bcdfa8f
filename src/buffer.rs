//! Block Buffers
//!
//! The local share of the three benchmark matrices plus the scratch buffer
//! used as receive target during exchanges.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::layout::{BlockIndex, BlockLayout};

/// Values are drawn uniformly from this range
pub const VALUE_RANGE: std::ops::Range<f32> = -100.0..100.0;

/// Local block storage of one rank
#[derive(Debug, Clone)]
pub struct BlockBuffer {
    pub layout: BlockLayout,
    /// Matrix to transpose
    pub a: Vec<f32>,
    /// Addend
    pub b: Vec<f32>,
    /// Output of the transpose-and-add kernel
    pub result: Vec<f32>,
    /// Receive target of exchanges, rotated with `a` afterwards
    pub exchange: Vec<f32>,
}

impl BlockBuffer {
    /// Allocate zeroed buffers for `layout`
    pub fn new(layout: BlockLayout) -> Self {
        let len = layout.len();
        BlockBuffer {
            layout,
            a: vec![0.0; len],
            b: vec![0.0; len],
            result: vec![0.0; len],
            exchange: vec![0.0; len],
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.layout.num_blocks()
    }

    /// Refill A and B with pseudo random values and clear the result.
    ///
    /// The same seed always yields the same matrices.
    pub fn fill_random(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        for (a, b) in self.a.iter_mut().zip(self.b.iter_mut()) {
            *a = rng.gen_range(VALUE_RANGE);
            *b = rng.gen_range(VALUE_RANGE);
        }
        self.result.fill(0.0);
    }

    pub fn a_block(&self, index: BlockIndex) -> &[f32] {
        &self.a[self.layout.block_range(index)]
    }

    pub fn b_block(&self, index: BlockIndex) -> &[f32] {
        &self.b[self.layout.block_range(index)]
    }

    pub fn result_block(&self, index: BlockIndex) -> &[f32] {
        &self.result[self.layout.block_range(index)]
    }

    pub fn a_block_mut(&mut self, index: BlockIndex) -> &mut [f32] {
        let range = self.layout.block_range(index);
        &mut self.a[range]
    }

    /// Make the received data the new A; the old A becomes scratch
    pub fn swap_exchange(&mut self) {
        std::mem::swap(&mut self.a, &mut self.exchange);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_fill_is_reproducible() {
        let layout = BlockLayout::new(2, 2, 2);
        let mut first = BlockBuffer::new(layout);
        let mut second = BlockBuffer::new(layout);
        first.fill_random(3);
        second.fill_random(3);
        assert_eq!(first.a, second.a);
        assert_eq!(first.b, second.b);
        assert!(first.a.iter().all(|v| VALUE_RANGE.contains(v)));

        second.fill_random(4);
        assert_ne!(first.a, second.a);
    }

    #[test]
    fn test_swap_rotates_allocations() {
        let mut buffer = BlockBuffer::new(BlockLayout::list(1, 2));
        buffer.a.copy_from_slice(&[1.0, 2.0]);
        buffer.exchange.copy_from_slice(&[3.0, 4.0]);
        let a_ptr = buffer.a.as_ptr();

        buffer.swap_exchange();
        assert_eq!(buffer.a, vec![3.0, 4.0]);
        assert_eq!(buffer.exchange, vec![1.0, 2.0]);
        assert_eq!(buffer.exchange.as_ptr(), a_ptr);
    }

    #[test]
    fn test_block_access() {
        let mut buffer = BlockBuffer::new(BlockLayout::new(2, 1, 2));
        buffer.a_block_mut(BlockIndex::new(0, 1)).fill(7.0);
        assert_eq!(buffer.a, vec![0.0, 0.0, 0.0, 0.0, 7.0, 7.0, 7.0, 7.0]);
        assert_eq!(buffer.a_block(BlockIndex::new(0, 1)), &[7.0; 4]);
        assert_eq!(buffer.b_block(BlockIndex::new(0, 1)), &[0.0; 4]);
    }
}
