//! Grid Exchange Schedule
//!
//! Exchange plan for block-cyclic distributions on P x Q grids with P != Q.
//!
//! The local block grid of every rank is a repetition of one LCM tile of
//! `lcm/Q x lcm/P` blocks. Each tile position has a fixed destination rank,
//! recorded in the [`TargetMap`]. A rank talks to every destination exactly
//! once: `lcm/P * lcm/Q` steps, each sending to one rank and receiving from
//! another, with at most `gcd(P, Q)` steps in flight.
//!
//! Senders pack blocks row-major over their local positions, receivers
//! unpack column-major over theirs, which leaves every received block at the
//! local position of its transpose partner.

use std::fmt;

use log::debug;
use rayon::prelude::*;
use serde::Serialize;

use crate::buffer::BlockBuffer;
use crate::comm::{Communicator, Completion, RequestSet, EXCHANGE_TAG};
use crate::error::{Result, TransposeError};
use crate::layout::{BlockIndex, BlockLayout};
use crate::topology::{positive_mod, GridTopology};

/// Destination rank of every position of the LCM tile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetMap {
    rows: usize,
    cols: usize,
    targets: Vec<usize>,
}

impl TargetMap {
    /// Block (lr, lc) of rank (row, col) is global block
    /// `(lr*Q + row, lc*P + col)`; its transpose lives on rank
    /// `(global_col mod Q, global_row mod P)`.
    pub fn new(topology: &GridTopology) -> Self {
        let (p, q) = (topology.width, topology.height);
        let rows = topology.tile_rows();
        let cols = topology.tile_cols();
        let mut targets = Vec::with_capacity(rows * cols);
        for lr in 0..rows {
            for lc in 0..cols {
                let global_row = lr * q + topology.row;
                let global_col = lc * p + topology.col;
                targets.push((global_col % q) * p + global_row % p);
            }
        }
        TargetMap {
            rows,
            cols,
            targets,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Destination of a local block; positions repeat with the tile size
    pub fn target(&self, local: BlockIndex) -> usize {
        self.targets[(local.row % self.rows) * self.cols + local.col % self.cols]
    }

    /// Tile rows, top to bottom
    pub fn tile_rows(&self) -> impl Iterator<Item = &[usize]> {
        self.targets.chunks(self.cols)
    }
}

impl fmt::Display for TargetMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.tile_rows() {
            let cells: Vec<String> = row.iter().map(|t| format!("{:>3}", t)).collect();
            writeln!(f, "{}", cells.join(" "))?;
        }
        Ok(())
    }
}

/// Peers of one exchange step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommStep {
    pub send_rank: usize,
    pub recv_rank: usize,
}

/// All steps of one rank, in execution order.
///
/// Rank (row, col) sends in step (i, j) to
/// `(q - j*gcd, p + i*gcd)` with `g = (row - col) mod gcd`,
/// `p = col + g`, `q = row - g`. It receives from the rank whose send in the
/// same step targets it.
pub fn communication_steps(topology: &GridTopology) -> Vec<CommStep> {
    let (row, col) = (topology.row as i64, topology.col as i64);
    let d = topology.gcd as i64;
    let g = positive_mod(row - col, topology.gcd) as i64;
    let h = positive_mod(-g, topology.gcd) as i64;
    let (p, q) = (col + g, row - g);

    let mut steps = Vec::with_capacity(topology.tile_rows() * topology.tile_cols());
    for j in 0..topology.tile_cols() as i64 {
        for i in 0..topology.tile_rows() as i64 {
            steps.push(CommStep {
                send_rank: topology.rank_at(q - j * d, p + i * d),
                recv_rank: topology.rank_at(row + j * d + h, col - i * d - h),
            });
        }
    }
    steps
}

/// Counters of the last exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExchangeStats {
    pub steps: usize,
    pub blocks_sent: usize,
    pub blocks_received: usize,
    /// Largest number of steps waited for at once
    pub max_in_flight: usize,
}

/// One step with the linear local blocks it moves
#[derive(Debug, Clone)]
struct StepPlan {
    step: CommStep,
    outgoing: Vec<usize>,
    incoming: Vec<usize>,
}

/// Exchange of A for one rank of a P != Q grid
#[derive(Debug)]
pub struct GridExchangeScheduler {
    topology: GridTopology,
    layout: BlockLayout,
    target_map: TargetMap,
    plans: Vec<StepPlan>,
    /// Send buffers, one per round-robin slot, reused across exchanges
    slots: Vec<Vec<f32>>,
    stats: ExchangeStats,
}

impl GridExchangeScheduler {
    pub fn new(topology: GridTopology, layout: BlockLayout) -> Result<Self> {
        if layout.rows % topology.tile_rows() != 0 || layout.cols % topology.tile_cols() != 0 {
            return Err(TransposeError::config(format!(
                "local grid of {}x{} blocks is not a whole number of {}x{} LCM tiles \
                 for lcm(P={}, Q={}) = {}",
                layout.rows,
                layout.cols,
                topology.tile_rows(),
                topology.tile_cols(),
                topology.width,
                topology.height,
                topology.lcm
            )));
        }
        let target_map = TargetMap::new(&topology);
        let plans = communication_steps(&topology)
            .into_iter()
            .map(|step| StepPlan {
                step,
                outgoing: layout
                    .row_major()
                    .filter(|&b| target_map.target(b) == step.send_rank)
                    .map(|b| layout.linear(b))
                    .collect(),
                incoming: layout
                    .col_major()
                    .filter(|&b| target_map.target(b) == step.recv_rank)
                    .map(|b| layout.linear(b))
                    .collect(),
            })
            .collect();
        debug!(
            "rank {}: {} exchange steps, round-robin depth {}",
            topology.rank,
            topology.tile_rows() * topology.tile_cols(),
            topology.gcd
        );
        Ok(GridExchangeScheduler {
            topology,
            layout,
            target_map,
            plans,
            slots: vec![Vec::new(); topology.gcd],
            stats: ExchangeStats::default(),
        })
    }

    pub fn topology(&self) -> &GridTopology {
        &self.topology
    }

    pub fn target_map(&self) -> &TargetMap {
        &self.target_map
    }

    pub fn steps(&self) -> impl Iterator<Item = CommStep> + '_ {
        self.plans.iter().map(|plan| plan.step)
    }

    /// Local blocks (linear, in packing order) sent and received per step
    pub fn step_blocks(&self) -> impl Iterator<Item = (CommStep, &[usize], &[usize])> + '_ {
        self.plans
            .iter()
            .map(|plan| (plan.step, plan.outgoing.as_slice(), plan.incoming.as_slice()))
    }

    /// Counters of the most recent [`exchange`](Self::exchange)
    pub fn stats(&self) -> ExchangeStats {
        self.stats
    }

    pub fn exchange(&mut self, comm: &dyn Communicator, buffer: &mut BlockBuffer) -> Result<()> {
        if buffer.layout != self.layout {
            return Err(TransposeError::config(format!(
                "buffer layout {:?} does not match the schedule layout {:?}",
                buffer.layout, self.layout
            )));
        }
        let depth = self.topology.gcd;
        let layout = self.layout;
        let block_len = layout.block_len();
        let mut stats = ExchangeStats {
            steps: self.plans.len(),
            ..Default::default()
        };
        let mut requests = RequestSet::with_capacity(2 * depth);
        // plans whose receive is still outstanding
        let mut in_flight: Vec<usize> = Vec::with_capacity(depth);
        let mut slot = 0;

        for (index, plan) in self.plans.iter().enumerate() {
            let send_buffer = &mut self.slots[slot];
            send_buffer.resize(plan.outgoing.len() * block_len, 0.0);
            let source = &buffer.a;
            send_buffer
                .par_chunks_mut(block_len.max(1))
                .zip(plan.outgoing.par_iter())
                .for_each(|(dst, &block)| dst.copy_from_slice(&source[layout.range_of(block)]));

            debug!(
                "rank {}: step {} sends {} blocks to {}, expects {} from {}",
                self.topology.rank,
                index,
                plan.outgoing.len(),
                plan.step.send_rank,
                plan.incoming.len(),
                plan.step.recv_rank
            );
            requests.push(comm.isend(plan.step.send_rank, EXCHANGE_TAG, send_buffer)?);
            requests.push(comm.irecv(plan.step.recv_rank, EXCHANGE_TAG));
            stats.blocks_sent += plan.outgoing.len();
            in_flight.push(index);
            stats.max_in_flight = stats.max_in_flight.max(in_flight.len());

            slot = (slot + 1) % depth;
            if slot == 0 {
                self.complete(comm, &mut requests, &mut in_flight, buffer, &mut stats)?;
            }
        }
        if !requests.is_empty() {
            self.complete(comm, &mut requests, &mut in_flight, buffer, &mut stats)?;
        }

        buffer.swap_exchange();
        self.stats = stats;
        Ok(())
    }

    /// Wait for every outstanding request and unpack the received blocks
    fn complete(
        &self,
        comm: &dyn Communicator,
        requests: &mut RequestSet,
        in_flight: &mut Vec<usize>,
        buffer: &mut BlockBuffer,
        stats: &mut ExchangeStats,
    ) -> Result<()> {
        let rank = comm.rank();
        let layout = self.layout;
        let block_len = layout.block_len();
        comm.wait_all(requests, &mut |completion| {
            let (source, payload) = match completion {
                Completion::Sent { .. } => return Ok(()),
                Completion::Received { source, payload } => (source, payload),
            };
            let position = in_flight
                .iter()
                .position(|&i| self.plans[i].step.recv_rank == source)
                .ok_or_else(|| {
                    TransposeError::comm(rank, format!("unexpected message from rank {}", source))
                })?;
            let plan = &self.plans[in_flight.remove(position)];
            if payload.len() != plan.incoming.len() * block_len {
                return Err(TransposeError::comm(
                    rank,
                    format!(
                        "rank {} sent {} values, expected {} blocks of {}",
                        source,
                        payload.len(),
                        plan.incoming.len(),
                        block_len
                    ),
                ));
            }
            for (&block, values) in plan.incoming.iter().zip(payload.chunks(block_len.max(1))) {
                buffer.exchange[layout.range_of(block)].copy_from_slice(values);
            }
            stats.blocks_received += plan.incoming.len();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCluster;
    use std::collections::HashSet;
    use std::time::Duration;

    fn topologies(world_size: usize, p: usize) -> Vec<GridTopology> {
        (0..world_size)
            .map(|rank| GridTopology::new(rank, world_size, p).unwrap())
            .collect()
    }

    fn local_layout(topology: &GridTopology, n: usize, bs: usize) -> BlockLayout {
        BlockLayout::new(bs, topology.height_per_rank(n), topology.width_per_rank(n))
    }

    #[test]
    fn test_target_map_2x3() {
        // P=2, Q=3: rank 0 holds global rows 0, 3 and columns 0, 2, 4
        let topo = GridTopology::new(0, 6, 2).unwrap();
        let map = TargetMap::new(&topo);
        assert_eq!((map.rows(), map.cols()), (2, 3));
        assert_eq!(map.target(BlockIndex::new(0, 0)), 0);
        // global (0, 2) -> transpose (2, 0) on rank (2 mod 3, 0 mod 2)
        assert_eq!(map.target(BlockIndex::new(0, 1)), 4);
        // global (3, 4) -> transpose (4, 3) on rank (1, 1)
        assert_eq!(map.target(BlockIndex::new(1, 2)), 3);
        // repeats with the tile
        assert_eq!(map.target(BlockIndex::new(2, 4)), map.target(BlockIndex::new(0, 1)));
    }

    #[test]
    fn test_steps_are_symmetric() {
        for (world, p) in [(6, 2), (6, 3), (8, 2), (8, 4), (24, 4), (24, 6), (4, 1), (18, 3)] {
            let topos = topologies(world, p);
            let all: Vec<_> = topos.iter().map(communication_steps).collect();
            for (rank, steps) in all.iter().enumerate() {
                for (k, step) in steps.iter().enumerate() {
                    assert_eq!(
                        all[step.send_rank][k].recv_rank, rank,
                        "world {} P={} rank {} step {}",
                        world, p, rank, k
                    );
                }
                // every destination is visited once
                let sends: HashSet<_> = steps.iter().map(|s| s.send_rank).collect();
                assert_eq!(sends.len(), steps.len());
            }
        }
    }

    #[test]
    fn test_partial_tile_is_rejected() {
        let topo = GridTopology::new(0, 6, 2).unwrap();
        let layout = local_layout(&topo, 4, 2);
        assert!(GridExchangeScheduler::new(topo, layout)
            .unwrap_err()
            .is_configuration());
    }

    #[test]
    fn test_packing_order() {
        // P=2, Q=4 (gcd 2, lcm 4), rank 0 holds a 2x4 local grid for n=8
        let topo = GridTopology::new(0, 8, 2).unwrap();
        let layout = local_layout(&topo, 8, 1);
        let scheduler = GridExchangeScheduler::new(topo, layout).unwrap();
        for (step, outgoing, incoming) in scheduler.step_blocks() {
            assert!(outgoing.windows(2).all(|w| w[0] < w[1]), "row-major send order");
            let cols: Vec<_> = incoming.iter().map(|&b| layout.index_of(b)).collect();
            assert!(
                cols.windows(2).all(|w| (w[0].col, w[0].row) < (w[1].col, w[1].row)),
                "column-major receive order from {}",
                step.recv_rank
            );
        }
    }

    fn run_exchange(world: usize, p: usize, n: usize, bs: usize) -> Vec<(BlockBuffer, ExchangeStats)> {
        LocalCluster::new(world)
            .with_timeout(Some(Duration::from_secs(10)))
            .run(|comm| {
                let topo = GridTopology::new(comm.rank(), world, p)?;
                let layout = local_layout(&topo, n, bs);
                let mut buffer = BlockBuffer::new(layout);
                buffer.fill_random(comm.rank() as u64);
                let original = buffer.a.clone();
                let mut scheduler = GridExchangeScheduler::new(topo, layout)?;

                scheduler.exchange(&comm, &mut buffer)?;
                let stats = scheduler.stats();
                let exchanged = buffer.clone();
                scheduler.exchange(&comm, &mut buffer)?;
                assert_eq!(buffer.a, original, "second exchange restores A");
                Ok((exchanged, stats))
            })
            .unwrap()
    }

    #[test]
    fn test_single_column_grid() {
        // P=1, Q=4: lcm 4, gcd 1
        let topo = GridTopology::new(1, 4, 1).unwrap();
        assert_eq!(communication_steps(&topo).len(), 4);
        let scheduler = GridExchangeScheduler::new(topo, local_layout(&topo, 4, 2)).unwrap();
        assert_eq!(scheduler.slots.len(), 1);

        let results = run_exchange(4, 1, 4, 2);
        for (rank, (_, stats)) in results.iter().enumerate() {
            assert_eq!((stats.steps, stats.max_in_flight), (4, 1), "rank {}", rank);
            assert_eq!(stats.blocks_sent, 4);
            assert_eq!(stats.blocks_received, 4);
        }
    }

    #[test]
    fn test_short_payload_is_a_communication_failure() {
        // P=1, Q=2, n=2: rank 0 expects one block of 4 values from rank 1
        let err = LocalCluster::new(2)
            .with_timeout(Some(Duration::from_secs(10)))
            .run(|comm| {
                if comm.rank() == 1 {
                    comm.send(0, EXCHANGE_TAG, &[1.0])?;
                    comm.recv(0, EXCHANGE_TAG)?;
                    return Ok(());
                }
                let topo = GridTopology::new(0, 2, 1)?;
                let layout = local_layout(&topo, 2, 2);
                let mut buffer = BlockBuffer::new(layout);
                GridExchangeScheduler::new(topo, layout)?.exchange(&comm, &mut buffer)
            })
            .unwrap_err();
        match err {
            TransposeError::CommunicationFailure { rank, reason } => {
                assert_eq!(rank, 0);
                assert!(reason.contains("sent 1 values"), "{}", reason);
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn test_exchange_places_transpose_partners() {
        for (world, p, n) in [(6, 2, 6), (6, 3, 12), (8, 2, 8), (4, 1, 4), (8, 4, 4)] {
            let bs = 2;
            let exchanged = run_exchange(world, p, n, bs);
            for (rank, (buffer, _)) in exchanged.iter().enumerate() {
                let topo = GridTopology::new(rank, world, p).unwrap();
                for local in buffer.layout.row_major() {
                    let global_row = local.row * topo.height + topo.row;
                    let global_col = local.col * topo.width + topo.col;
                    // the partner block (global_col, global_row) came from this rank
                    let owner = topo.rank_at((global_col % topo.height) as i64, (global_row % topo.width) as i64);
                    let owner_topo = GridTopology::new(owner, world, p).unwrap();
                    let mut source = BlockBuffer::new(local_layout(&owner_topo, n, bs));
                    source.fill_random(owner as u64);
                    let at = BlockIndex::new(global_col / topo.height, global_row / topo.width);
                    assert_eq!(buffer.a_block(local), source.a_block(at));
                }
            }
        }
    }

    #[test]
    fn test_blocks_are_conserved() {
        let results = run_exchange(6, 2, 12, 1);
        let sent: usize = results.iter().map(|(_, s)| s.blocks_sent).sum();
        let received: usize = results.iter().map(|(_, s)| s.blocks_received).sum();
        assert_eq!(sent, 144);
        assert_eq!(sent, received);
        for (_, stats) in &results {
            assert_eq!(stats.steps, 6);
            assert_eq!(stats.max_in_flight, 1);
        }

        // P=2, Q=4 keeps two steps in flight
        let results = run_exchange(8, 2, 8, 1);
        assert!(results.iter().all(|(_, s)| s.max_in_flight == 2 && s.steps == 2));
    }
}
