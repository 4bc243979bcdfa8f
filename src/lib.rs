//! Distributed Block Matrix Transpose
//!
//! Computes `transpose(A) + B` for a dense N x N matrix that is split into
//! B x B blocks and distributed over a set of ranks. Every block has to meet
//! its transpose partner, which usually lives on another rank, so the heart
//! of this crate is the block exchange.
//!
//! # Overview
//!
//! Two distribution policies are available:
//!
//! - **Grid (`PQ`)**: block-cyclic distribution over a P x Q grid of ranks.
//!   Square grids swap whole buffers with the mirrored rank. All other grids
//!   run a multi-step schedule derived from `gcd(P, Q)` and `lcm(P, Q)` with
//!   at most `gcd(P, Q)` steps in flight.
//! - **Diagonal (`DIAG`)**: mirrored off-diagonal blocks live on rank pairs
//!   that swap their whole buffer, diagonal blocks stay on loopback ranks.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use pq_transpose::prelude::*;
//!
//! // 12 x 12 blocks on a 2 x 3 grid (6 ranks)
//! let config = TransposeConfig::grid_2x3();
//!
//! // Every rank runs as a thread of this process
//! let report = TransposeBenchmark::new(config).run_local(6).unwrap();
//!
//! assert!(report.verification.passed);
//! println!("{}", report);
//! ```
//!
//! # Exchanging on your own transport
//!
//! ```rust,no_run
//! use pq_transpose::prelude::*;
//!
//! fn transpose_on(comm: &dyn Communicator) -> Result<VerificationResult> {
//!     let config = TransposeConfig::small();
//!     let mut handler = create_handler(&config, comm.rank(), comm.world_size())?;
//!     let mut buffer = handler.generate();
//!
//!     handler.exchange(comm, &mut buffer)?;
//!     CpuKernel.execute(handler.as_ref(), &mut buffer)?;
//!     handler.exchange(comm, &mut buffer)?;
//!
//!     Verifier::default().verify(handler.as_mut(), comm, &mut buffer)
//! }
//! ```

pub mod benchmark;
pub mod buffer;
pub mod comm;
pub mod config;
pub mod error;
pub mod handler;
pub mod kernel;
pub mod layout;
pub mod schedule;
pub mod topology;
pub mod verify;

/// Prelude - commonly used types
pub mod prelude {
    pub use crate::benchmark::{BenchmarkReport, RepetitionTiming, TransposeBenchmark};
    pub use crate::buffer::BlockBuffer;
    pub use crate::comm::{Communicator, Completion, LocalCluster, LocalEndpoint, Request,
                          RequestSet, TransferStats, EXCHANGE_TAG};
    pub use crate::config::{PolicyKind, TransposeConfig};
    pub use crate::error::{Result, TransposeError};
    pub use crate::handler::{create_handler, DiagonalHandler, DiagonalPairing, DistributionPolicy,
                             GridHandler};
    pub use crate::kernel::{CpuKernel, KernelExecutor};
    pub use crate::layout::{BlockIndex, BlockLayout};
    pub use crate::schedule::{CommStep, ExchangeStats, GridExchangeScheduler, TargetMap};
    pub use crate::topology::GridTopology;
    pub use crate::verify::{VerificationResult, Verifier, TOLERANCE};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Grid widths P that divide `world_size`
pub fn grid_widths(world_size: usize) -> Vec<usize> {
    (1..=world_size).filter(|p| world_size % p == 0).collect()
}

/// Grid width closest to a square grid, preferring the wider one on ties
pub fn default_grid_width(world_size: usize) -> usize {
    grid_widths(world_size)
        .into_iter()
        .min_by_key(|&p| {
            let q = world_size / p;
            (p.abs_diff(q), std::cmp::Reverse(p))
        })
        .unwrap_or(1)
}
