//! Result verification
//!
//! After the kernel ran, A is exchanged once more so every block meets its
//! transpose partner again. The policy's reference transpose then turns A
//! into the residual, whose largest magnitude is reduced over all ranks.

use log::{debug, warn};
use serde::Serialize;

use crate::buffer::BlockBuffer;
use crate::comm::Communicator;
use crate::error::Result;
use crate::handler::DistributionPolicy;

/// Accepted absolute error per value
pub const TOLERANCE: f64 = 100.0 * f32::EPSILON as f64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VerificationResult {
    /// Largest absolute residual over all ranks
    pub max_error: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Verifier {
    pub tolerance: f64,
}

impl Default for Verifier {
    fn default() -> Self {
        Verifier {
            tolerance: TOLERANCE,
        }
    }
}

impl Verifier {
    /// Exchange A, compute the residual and reduce its maximum.
    ///
    /// A is overwritten with the residual; regenerate before reusing the buffer.
    pub fn verify(
        &self,
        policy: &mut dyn DistributionPolicy,
        comm: &dyn Communicator,
        buffer: &mut BlockBuffer,
    ) -> Result<VerificationResult> {
        policy.exchange(comm, buffer)?;
        policy.reference_transpose(buffer);
        let local = max_abs(&buffer.a);
        debug!("rank {}: local residual {:e}", comm.rank(), local);

        let max_error = comm.all_reduce_max(local)?;
        let passed = max_error < self.tolerance;
        if !passed && comm.rank() == 0 {
            warn!(
                "verification failed: max error {:e} exceeds {:e}",
                max_error, self.tolerance
            );
        }
        Ok(VerificationResult { max_error, passed })
    }
}

/// Largest absolute value; NaN if any value is NaN
fn max_abs(values: &[f32]) -> f64 {
    values.iter().fold(0.0_f64, |acc, &v| {
        let v = f64::from(v).abs();
        if acc.is_nan() || v.is_nan() {
            f64::NAN
        } else {
            acc.max(v)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCluster;
    use crate::config::{PolicyKind, TransposeConfig};
    use crate::handler::create_handler;
    use crate::kernel::{CpuKernel, KernelExecutor};
    use approx::assert_relative_eq;
    use std::time::Duration;

    /// Run the full exchange/kernel/exchange-back/verify flow on
    /// `A[i][j] = i*N + j`, `B = 0` and check every result value
    fn end_to_end(config: TransposeConfig, world_size: usize, corrupt_rank: Option<usize>) -> Vec<VerificationResult> {
        let n = config.matrix_size();
        LocalCluster::new(world_size)
            .with_timeout(Some(Duration::from_secs(10)))
            .run(|comm| {
                let mut handler = create_handler(&config, comm.rank(), world_size)?;
                let mut buffer = handler.generate_from(&|i, j| ((i * n + j) as f32, 0.0));
                handler.exchange(&comm, &mut buffer)?;
                CpuKernel.execute(handler.as_ref(), &mut buffer)?;
                handler.exchange(&comm, &mut buffer)?;

                let layout = buffer.layout;
                let bs = layout.block_size;
                for local in layout.row_major() {
                    let global = handler.global_block(local);
                    let block = buffer.result_block(local);
                    for i in 0..bs {
                        for j in 0..bs {
                            let (gi, gj) = (global.row * bs + i, global.col * bs + j);
                            assert_eq!(block[layout.in_block(i, j)], (gj * n + gi) as f32);
                        }
                    }
                }
                if corrupt_rank == Some(comm.rank()) {
                    buffer.result[0] += 1.0;
                }
                Verifier::default().verify(handler.as_mut(), &comm, &mut buffer)
            })
            .unwrap()
    }

    #[test]
    fn test_square_grid_end_to_end() {
        let results = end_to_end(TransposeConfig::small(), 4, None);
        for result in results {
            assert!(result.passed);
            assert_relative_eq!(result.max_error, 0.0);
        }
    }

    #[test]
    fn test_uneven_square_grid_end_to_end() {
        let config = TransposeConfig {
            matrix_size_in_blocks: 5,
            block_size: 3,
            ..TransposeConfig::small()
        };
        assert!(end_to_end(config, 4, None).iter().all(|r| r.passed));
    }

    #[test]
    fn test_non_square_grid_end_to_end() {
        let config = TransposeConfig {
            block_size: 2,
            ..TransposeConfig::grid_2x3()
        };
        assert!(end_to_end(config, 6, None).iter().all(|r| r.passed && r.max_error == 0.0));

        // P=2, Q=4 keeps two steps in flight
        let config = TransposeConfig {
            matrix_size_in_blocks: 8,
            block_size: 2,
            ..TransposeConfig::small()
        };
        assert!(end_to_end(config, 8, None).iter().all(|r| r.passed));
    }

    #[test]
    fn test_diagonal_end_to_end() {
        let config = TransposeConfig {
            matrix_size_in_blocks: 3,
            block_size: 2,
            policy: PolicyKind::Diagonal,
            ..TransposeConfig::small()
        };
        assert!(end_to_end(config, 5, None).iter().all(|r| r.passed));
    }

    #[test]
    fn test_corrupted_result_fails_everywhere() {
        let results = end_to_end(TransposeConfig::small(), 4, Some(2));
        for result in results {
            assert!(!result.passed);
            assert_relative_eq!(result.max_error, 1.0);
        }
    }

    #[test]
    fn test_nan_propagates() {
        assert!(max_abs(&[1.0, f32::NAN, 2.0]).is_nan());
        assert_eq!(max_abs(&[-3.0, 2.0]), 3.0);
        assert_eq!(max_abs(&[]), 0.0);
    }
}
