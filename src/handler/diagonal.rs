//! Diagonal distribution
//!
//! Diagonal blocks live on a few loopback ranks at the end of the world. The
//! remaining ranks form pairs: the lower half holds blocks of the upper
//! triangle, its partner holds the mirrored blocks in the same order, so an
//! exchange is one swap of the whole local buffer.
//!
//! ```text
//! . . 1 3
//! . . . 2
//! 1 . . .
//! 3 2 . .
//! ```

use log::{debug, info};

use super::{swap_with_partner, DistributionPolicy};
use crate::buffer::BlockBuffer;
use crate::comm::Communicator;
use crate::config::PolicyKind;
use crate::error::{Result, TransposeError};
use crate::layout::{BlockIndex, BlockLayout};
use crate::topology::share;

/// Which rank holds which blocks, and who pairs with whom
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagonalPairing {
    pub world_size: usize,
    pub width_in_blocks: usize,
    /// Ranks that only hold diagonal blocks and never communicate
    pub num_diagonal_ranks: usize,
}

impl DiagonalPairing {
    /// Derive the number of loopback ranks from the average share per rank
    pub fn new(world_size: usize, width_in_blocks: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(TransposeError::config("at least one rank is required"));
        }
        let avg_blocks_per_rank = width_in_blocks * width_in_blocks / world_size;
        let avg_diagonal_blocks = if avg_blocks_per_rank > 0 {
            width_in_blocks / avg_blocks_per_rank
        } else {
            width_in_blocks
        };
        Self::with_diagonal_ranks(world_size, width_in_blocks, avg_diagonal_blocks.max(1))
    }

    pub fn with_diagonal_ranks(
        world_size: usize,
        width_in_blocks: usize,
        num_diagonal_ranks: usize,
    ) -> Result<Self> {
        if num_diagonal_ranks == 0 || num_diagonal_ranks > world_size {
            return Err(TransposeError::config(format!(
                "{} diagonal ranks do not fit into a world of {} ranks",
                num_diagonal_ranks, world_size
            )));
        }
        if num_diagonal_ranks % 2 != world_size % 2 {
            return Err(TransposeError::config(format!(
                "matrix of {} blocks and {} ranks do not allow a fair distribution: \
                 {} diagonal ranks and the world size must have the same parity; \
                 increase or reduce the number of ranks by 1",
                width_in_blocks, world_size, num_diagonal_ranks
            )));
        }
        let paired = world_size - num_diagonal_ranks;
        if paired % 2 != 0 || (paired == 0 && width_in_blocks > 1) {
            return Err(TransposeError::config(format!(
                "cannot pair ranks for the lower and upper half of a matrix of {} blocks: \
                 {} ranks minus {} diagonal ranks must be even and non-zero; \
                 increase the number of ranks",
                width_in_blocks, world_size, num_diagonal_ranks
            )));
        }
        Ok(DiagonalPairing {
            world_size,
            width_in_blocks,
            num_diagonal_ranks,
        })
    }

    /// Number of ranks that take part in pairwise exchanges
    pub fn paired_ranks(&self) -> usize {
        self.world_size - self.num_diagonal_ranks
    }

    fn half(&self) -> usize {
        self.paired_ranks() / 2
    }

    pub fn is_diagonal(&self, rank: usize) -> bool {
        rank >= self.paired_ranks()
    }

    /// Partner of `rank`, `None` for loopback ranks
    pub fn pair_rank(&self, rank: usize) -> Option<usize> {
        if self.is_diagonal(rank) {
            return None;
        }
        let half = self.half();
        Some(if rank >= half { rank - half } else { rank + half })
    }

    /// Global blocks held by `rank`, in local order
    pub fn blocks_of(&self, rank: usize) -> Vec<BlockIndex> {
        let n = self.width_in_blocks;
        if self.is_diagonal(rank) {
            let d = rank - self.paired_ranks();
            let nd = self.num_diagonal_ranks;
            let start = d * (n / nd) + d.min(n % nd);
            return (start..start + share(n, nd, d))
                .map(|i| BlockIndex::new(i, i))
                .collect();
        }

        // both partners use the same index so they hold equally many blocks
        let half = self.half();
        let k = rank % half;
        let pairs = n * n.saturating_sub(1) / 2;
        let start = k * (pairs / half) + k.min(pairs % half);
        let upper = (0..n)
            .flat_map(|r| (r + 1..n).map(move |c| BlockIndex::new(r, c)))
            .skip(start)
            .take(share(pairs, half, k));
        if rank < half {
            upper.collect()
        } else {
            upper.map(BlockIndex::transposed).collect()
        }
    }
}

/// Distribution policy for [`PolicyKind::Diagonal`]
#[derive(Debug, Clone)]
pub struct DiagonalHandler {
    rank: usize,
    block_size: usize,
    pairing: DiagonalPairing,
    blocks: Vec<BlockIndex>,
    max_transfer_values: usize,
}

impl DiagonalHandler {
    pub fn new(
        rank: usize,
        world_size: usize,
        width_in_blocks: usize,
        block_size: usize,
        max_transfer_values: usize,
    ) -> Result<Self> {
        if rank >= world_size {
            return Err(TransposeError::config(format!(
                "rank {} must be smaller than the world size {}",
                rank, world_size
            )));
        }
        let pairing = DiagonalPairing::new(world_size, width_in_blocks)?;
        let blocks = pairing.blocks_of(rank);
        if rank == 0 {
            info!(
                "diagonal distribution: {} loopback ranks, {} blocks on rank 0",
                pairing.num_diagonal_ranks,
                blocks.len()
            );
        }
        debug!("rank {}: {} blocks", rank, blocks.len());
        Ok(DiagonalHandler {
            rank,
            block_size,
            pairing,
            blocks,
            max_transfer_values,
        })
    }

    pub fn pairing(&self) -> &DiagonalPairing {
        &self.pairing
    }
}

impl DistributionPolicy for DiagonalHandler {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Diagonal
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn layout(&self) -> BlockLayout {
        BlockLayout::list(self.block_size, self.blocks.len())
    }

    fn global_block(&self, local: BlockIndex) -> BlockIndex {
        self.blocks[local.row]
    }

    fn exchanged_block(&self, local: BlockIndex) -> usize {
        local.row
    }

    fn exchange(&mut self, comm: &dyn Communicator, buffer: &mut BlockBuffer) -> Result<()> {
        match self.pairing.pair_rank(self.rank) {
            Some(partner) => swap_with_partner(comm, partner, buffer, self.max_transfer_values),
            None => {
                debug!("rank {}: diagonal blocks stay local", self.rank);
                Ok(())
            }
        }
    }
}
