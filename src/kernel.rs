//! Transpose-and-add kernels
//!
//! A kernel computes `result = transpose(A_partner) + B` for every local
//! block, where `A_partner` is the exchanged block the policy reports for
//! that position. Accelerator backends plug in behind [`KernelExecutor`].

use rayon::prelude::*;

use crate::buffer::BlockBuffer;
use crate::error::Result;
use crate::handler::DistributionPolicy;
use crate::layout::transpose_block;

/// Executes the transpose-and-add on the local blocks of one rank
pub trait KernelExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// Requires A to be in its exchanged state
    fn execute(&self, policy: &dyn DistributionPolicy, buffer: &mut BlockBuffer) -> Result<()>;
}

/// Reference kernel on the host, one rayon task per block
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuKernel;

impl KernelExecutor for CpuKernel {
    fn name(&self) -> &str {
        "cpu"
    }

    fn execute(&self, policy: &dyn DistributionPolicy, buffer: &mut BlockBuffer) -> Result<()> {
        let layout = buffer.layout;
        if layout.is_empty() {
            return Ok(());
        }
        let bs = layout.block_size;
        let partners: Vec<usize> = layout
            .row_major()
            .map(|local| policy.exchanged_block(local))
            .collect();

        let (a, b, result) = (&buffer.a, &buffer.b, &mut buffer.result);
        result
            .par_chunks_mut(layout.block_len())
            .zip(b.par_chunks(layout.block_len()))
            .zip(partners.par_iter())
            .for_each(|((out, addend), &partner)| {
                transpose_block(&a[layout.range_of(partner)], out, bs);
                for (value, add) in out.iter_mut().zip(addend) {
                    *value += add;
                }
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::DiagonalHandler;
    use crate::layout::BlockIndex;

    #[test]
    fn test_cpu_kernel_on_loopback_rank() {
        // single rank, single diagonal block: result = A^T + B in place
        let handler = DiagonalHandler::new(0, 1, 1, 2, usize::MAX).unwrap();
        let mut buffer = handler.generate_from(&|i, j| ((i * 2 + j) as f32, 10.0));
        CpuKernel.execute(&handler, &mut buffer).unwrap();
        assert_eq!(buffer.result_block(BlockIndex::new(0, 0)), &[10.0, 12.0, 11.0, 13.0]);
        assert_eq!(CpuKernel.name(), "cpu");
    }
}
