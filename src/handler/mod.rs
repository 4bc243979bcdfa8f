//! Distribution Policies
//!
//! A policy decides which global blocks a rank holds, how they are laid out
//! locally and how A is redistributed so that every block meets its
//! transpose partner:
//!
//! - [`DiagonalHandler`] - mirrored rank pairs swap whole buffers
//! - [`GridHandler`] - block-cyclic P x Q distribution

pub mod diagonal;
pub mod grid;

pub use diagonal::{DiagonalHandler, DiagonalPairing};
pub use grid::GridHandler;

use log::debug;

use crate::buffer::BlockBuffer;
use crate::comm::{Communicator, EXCHANGE_TAG};
use crate::config::{PolicyKind, TransposeConfig};
use crate::error::{Result, TransposeError};
use crate::layout::{BlockIndex, BlockLayout};
use crate::schedule::ExchangeStats;

/// Block distribution and exchange strategy of one rank
pub trait DistributionPolicy: Send + std::fmt::Debug {
    fn kind(&self) -> PolicyKind;

    fn rank(&self) -> usize;

    /// Shape of the local buffers
    fn layout(&self) -> BlockLayout;

    /// Global block stored at local position `local`
    fn global_block(&self, local: BlockIndex) -> BlockIndex;

    /// Linear local block that holds the transpose partner of `local` after
    /// one [`exchange`](DistributionPolicy::exchange)
    fn exchanged_block(&self, local: BlockIndex) -> usize;

    /// Redistribute A so every local block position holds its transpose
    /// partner. Applying it twice restores the original A.
    fn exchange(&mut self, comm: &dyn Communicator, buffer: &mut BlockBuffer) -> Result<()>;

    /// Counters of the last scheduled exchange, if the policy runs a schedule
    fn exchange_stats(&self) -> Option<ExchangeStats> {
        None
    }

    /// Allocate the local buffers and fill them from the rank's seed
    fn generate(&self) -> BlockBuffer {
        let mut buffer = BlockBuffer::new(self.layout());
        self.regenerate(&mut buffer);
        buffer
    }

    fn regenerate(&self, buffer: &mut BlockBuffer) {
        buffer.fill_random(self.rank() as u64);
    }

    /// Fill A and B from a function of the global value coordinates
    fn generate_from(&self, pattern: &dyn Fn(usize, usize) -> (f32, f32)) -> BlockBuffer {
        let layout = self.layout();
        let bs = layout.block_size;
        let mut buffer = BlockBuffer::new(layout);
        for local in layout.row_major() {
            let global = self.global_block(local);
            let start = layout.block_offset(local);
            for i in 0..bs {
                for j in 0..bs {
                    let (a, b) = pattern(global.row * bs + i, global.col * bs + j);
                    let offset = start + layout.in_block(i, j);
                    buffer.a[offset] = a;
                    buffer.b[offset] = b;
                }
            }
        }
        buffer
    }

    /// Turn the exchanged A into the residual of `result - B` against the
    /// transposed partner blocks. A correct result leaves A all zero.
    fn reference_transpose(&self, buffer: &mut BlockBuffer) {
        let layout = buffer.layout;
        let bs = layout.block_size;
        for local in layout.row_major() {
            let own = layout.block_offset(local);
            let partner = layout.range_of(self.exchanged_block(local)).start;
            for i in 0..bs {
                for j in 0..bs {
                    let computed = buffer.result[own + layout.in_block(i, j)]
                        - buffer.b[own + layout.in_block(i, j)];
                    buffer.a[partner + layout.in_block(j, i)] -= computed;
                }
            }
        }
    }
}

/// Build the policy selected by `config` for `rank`
pub fn create_handler(
    config: &TransposeConfig,
    rank: usize,
    world_size: usize,
) -> Result<Box<dyn DistributionPolicy>> {
    config.validate(world_size)?;
    Ok(match config.policy {
        PolicyKind::Diagonal => Box::new(DiagonalHandler::new(
            rank,
            world_size,
            config.matrix_size_in_blocks,
            config.block_size,
            config.max_transfer_values,
        )?),
        PolicyKind::Grid => Box::new(GridHandler::new(
            rank,
            world_size,
            config.grid_width,
            config.matrix_size_in_blocks,
            config.block_size,
            config.max_transfer_values,
        )?),
    })
}

/// Swap the whole A buffer with `partner` in chunks of at most
/// `max_transfer_values` values. Exchanging with oneself is a no-op.
pub(crate) fn swap_with_partner(
    comm: &dyn Communicator,
    partner: usize,
    buffer: &mut BlockBuffer,
    max_transfer_values: usize,
) -> Result<()> {
    let rank = comm.rank();
    if partner == rank {
        return Ok(());
    }
    let len = buffer.a.len();
    let chunk = max_transfer_values.max(1);
    debug!(
        "rank {}: swapping {} values with rank {} in chunks of {}",
        rank, len, partner, chunk
    );
    for start in (0..len).step_by(chunk) {
        let end = start.saturating_add(chunk).min(len);
        let received = comm.send_recv(partner, &buffer.a[start..end], partner, EXCHANGE_TAG)?;
        if received.len() != end - start {
            return Err(TransposeError::comm(
                rank,
                format!(
                    "rank {} sent {} values, expected {}",
                    partner,
                    received.len(),
                    end - start
                ),
            ));
        }
        buffer.exchange[start..end].copy_from_slice(&received);
    }
    buffer.swap_exchange();
    Ok(())
}
