//! Block Layout
//!
//! All local matrices are flat `f32` buffers made of B x B blocks. Blocks are
//! ordered row-major over the local block grid and the values inside a block
//! are row-major. This module is the only place that turns a [`BlockIndex`]
//! into a position in such a buffer.

use std::ops::Range;

/// Coordinates of a block, local or global depending on context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct BlockIndex {
    pub row: usize,
    pub col: usize,
}

impl BlockIndex {
    pub fn new(row: usize, col: usize) -> Self {
        BlockIndex { row, col }
    }

    pub fn transposed(self) -> Self {
        BlockIndex {
            row: self.col,
            col: self.row,
        }
    }
}

/// Shape of a local block grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BlockLayout {
    /// Values per block side (B)
    pub block_size: usize,
    /// Local height in blocks
    pub rows: usize,
    /// Local width in blocks
    pub cols: usize,
}

impl BlockLayout {
    pub fn new(block_size: usize, rows: usize, cols: usize) -> Self {
        BlockLayout {
            block_size,
            rows,
            cols,
        }
    }

    /// A plain list of `count` blocks
    pub fn list(block_size: usize, count: usize) -> Self {
        BlockLayout::new(block_size, count, 1)
    }

    pub fn num_blocks(&self) -> usize {
        self.rows * self.cols
    }

    /// Values in one block (B * B)
    pub fn block_len(&self) -> usize {
        self.block_size * self.block_size
    }

    /// Values in the whole local buffer
    pub fn len(&self) -> usize {
        self.num_blocks() * self.block_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, index: BlockIndex) -> bool {
        index.row < self.rows && index.col < self.cols
    }

    /// Position of a block in row-major block order
    pub fn linear(&self, index: BlockIndex) -> usize {
        debug_assert!(self.contains(index), "{:?} outside {:?}", index, self);
        index.row * self.cols + index.col
    }

    pub fn index_of(&self, linear: usize) -> BlockIndex {
        BlockIndex {
            row: linear / self.cols,
            col: linear % self.cols,
        }
    }

    /// First value of a block
    pub fn block_offset(&self, index: BlockIndex) -> usize {
        self.linear(index) * self.block_len()
    }

    /// Value range of a block inside a flat buffer
    pub fn block_range(&self, index: BlockIndex) -> Range<usize> {
        self.range_of(self.linear(index))
    }

    /// Value range of the `linear`-th block
    pub fn range_of(&self, linear: usize) -> Range<usize> {
        let start = linear * self.block_len();
        start..start + self.block_len()
    }

    /// Offset of value (r, c) inside a block
    pub fn in_block(&self, r: usize, c: usize) -> usize {
        r * self.block_size + c
    }

    /// Local block positions, row by row
    pub fn row_major(&self) -> impl Iterator<Item = BlockIndex> + '_ {
        (0..self.rows).flat_map(move |row| (0..self.cols).map(move |col| BlockIndex { row, col }))
    }

    /// Local block positions, column by column
    pub fn col_major(&self) -> impl Iterator<Item = BlockIndex> + '_ {
        (0..self.cols).flat_map(move |col| (0..self.rows).map(move |row| BlockIndex { row, col }))
    }
}

/// Write the transpose of `src` into `dst`, both B x B row-major blocks
pub fn transpose_block(src: &[f32], dst: &mut [f32], block_size: usize) {
    for i in 0..block_size {
        for j in 0..block_size {
            dst[j * block_size + i] = src[i * block_size + j];
        }
    }
}
