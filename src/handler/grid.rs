//! Grid distribution
//!
//! Block-cyclic distribution over a P x Q grid: global block (gr, gc) lives
//! on grid position (gr mod Q, gc mod P) at local block (gr / Q, gc / P).
//! Square grids swap whole buffers with the mirrored rank, all other grids
//! run the [`GridExchangeScheduler`].

use log::info;

use super::{swap_with_partner, DistributionPolicy};
use crate::buffer::BlockBuffer;
use crate::comm::Communicator;
use crate::config::{check_lcm_granularity, PolicyKind};
use crate::error::Result;
use crate::layout::{BlockIndex, BlockLayout};
use crate::schedule::{ExchangeStats, GridExchangeScheduler};
use crate::topology::GridTopology;

/// Distribution policy for [`PolicyKind::Grid`]
#[derive(Debug)]
pub struct GridHandler {
    topology: GridTopology,
    layout: BlockLayout,
    max_transfer_values: usize,
    /// `None` on square grids
    scheduler: Option<GridExchangeScheduler>,
}

impl GridHandler {
    pub fn new(
        rank: usize,
        world_size: usize,
        grid_width: usize,
        width_in_blocks: usize,
        block_size: usize,
        max_transfer_values: usize,
    ) -> Result<Self> {
        let topology = GridTopology::new(rank, world_size, grid_width)?;
        check_lcm_granularity(&topology, width_in_blocks)?;
        let layout = BlockLayout::new(
            block_size,
            topology.height_per_rank(width_in_blocks),
            topology.width_per_rank(width_in_blocks),
        );
        let scheduler = if topology.is_square() {
            None
        } else {
            Some(GridExchangeScheduler::new(topology, layout)?)
        };
        if rank == 0 {
            info!(
                "grid distribution: P={} Q={} gcd={} lcm={}, {}x{} blocks on rank 0",
                topology.width,
                topology.height,
                topology.gcd,
                topology.lcm,
                layout.rows,
                layout.cols
            );
        }
        Ok(GridHandler {
            topology,
            layout,
            max_transfer_values,
            scheduler,
        })
    }

    pub fn topology(&self) -> &GridTopology {
        &self.topology
    }

    pub fn scheduler(&self) -> Option<&GridExchangeScheduler> {
        self.scheduler.as_ref()
    }

    /// Partner of a square-grid swap; ranks on the diagonal pair with themselves
    pub fn pair_rank(&self) -> usize {
        self.topology.width * self.topology.col + self.topology.row
    }
}

impl DistributionPolicy for GridHandler {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Grid
    }

    fn rank(&self) -> usize {
        self.topology.rank
    }

    fn layout(&self) -> BlockLayout {
        self.layout
    }

    fn global_block(&self, local: BlockIndex) -> BlockIndex {
        BlockIndex::new(
            local.row * self.topology.height + self.topology.row,
            local.col * self.topology.width + self.topology.col,
        )
    }

    fn exchanged_block(&self, local: BlockIndex) -> usize {
        if self.scheduler.is_some() {
            return self.layout.linear(local);
        }
        // the partner's buffer arrives with its own, transposed block grid
        local.col * self.layout.rows + local.row
    }

    fn exchange(&mut self, comm: &dyn Communicator, buffer: &mut BlockBuffer) -> Result<()> {
        match self.scheduler.as_mut() {
            Some(scheduler) => scheduler.exchange(comm, buffer),
            None => swap_with_partner(comm, self.pair_rank(), buffer, self.max_transfer_values),
        }
    }

    fn exchange_stats(&self) -> Option<ExchangeStats> {
        self.scheduler.as_ref().map(GridExchangeScheduler::stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCluster;
    use std::time::Duration;

    #[test]
    fn test_square_grid_pairs() {
        // P = Q = 2: ranks 1 and 2 swap, 0 and 3 keep their blocks
        let pairs: Vec<_> = (0..4)
            .map(|rank| GridHandler::new(rank, 4, 2, 4, 2, usize::MAX).unwrap().pair_rank())
            .collect();
        assert_eq!(pairs, vec![0, 2, 1, 3]);

        let results = LocalCluster::new(4)
            .with_timeout(Some(Duration::from_secs(10)))
            .run(|comm| {
                let mut handler = GridHandler::new(comm.rank(), 4, 2, 4, 2, usize::MAX)?;
                let mut buffer = handler.generate();
                let original = buffer.a.clone();
                handler.exchange(&comm, &mut buffer)?;
                Ok((original, buffer.a))
            })
            .unwrap();
        assert_eq!(results[1].1, results[2].0);
        assert_eq!(results[2].1, results[1].0);
        assert_eq!(results[0].1, results[0].0);
        assert_eq!(results[3].1, results[3].0);
    }

    #[test]
    fn test_uneven_square_grid_placement() {
        // 5 blocks on 2 x 2: rank 1 holds 3x2 blocks, rank 2 holds 2x3
        let one = GridHandler::new(1, 4, 2, 5, 1, usize::MAX).unwrap();
        let two = GridHandler::new(2, 4, 2, 5, 1, usize::MAX).unwrap();
        assert_eq!((one.layout.rows, one.layout.cols), (3, 2));
        assert_eq!((two.layout.rows, two.layout.cols), (2, 3));

        for local in one.layout.row_major() {
            let global = one.global_block(local);
            let partner = two.layout.index_of(one.exchanged_block(local));
            assert_eq!(two.global_block(partner), global.transposed());
        }
    }

    #[test]
    fn test_non_square_grid_uses_scheduler() {
        let handler = GridHandler::new(0, 6, 2, 12, 1, usize::MAX).unwrap();
        let scheduler = handler.scheduler().unwrap();
        assert_eq!(scheduler.steps().count(), 6);
        assert_eq!(handler.exchanged_block(BlockIndex::new(1, 2)), 8);
        assert!(GridHandler::new(0, 6, 2, 4, 1, usize::MAX).is_err());
    }
}
