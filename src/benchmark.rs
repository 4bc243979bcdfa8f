//! Benchmark Driver
//!
//! Runs the measured exchange / kernel / exchange-back cycle on every rank,
//! reduces the timings over all ranks and verifies the final result.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use log::{debug, info};
use serde::Serialize;

use crate::comm::{Communicator, LocalCluster, TransferStats};
use crate::config::{PolicyKind, TransposeConfig};
use crate::error::Result;
use crate::handler::create_handler;
use crate::kernel::{CpuKernel, KernelExecutor};
use crate::schedule::ExchangeStats;
use crate::verify::{VerificationResult, Verifier};

/// Slowest rank's times of one repetition, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RepetitionTiming {
    pub transfer: f64,
    pub calculation: f64,
}

/// Outcome of a benchmark run, identical on every rank
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub settings: BTreeMap<&'static str, String>,
    pub policy: PolicyKind,
    pub matrix_size: usize,
    pub world_size: usize,
    pub kernel: String,
    pub timings: Vec<RepetitionTiming>,
    pub avg_calculation_time: f64,
    pub best_calculation_time: f64,
    pub avg_transfer_time: f64,
    pub best_transfer_time: f64,
    /// Additions per second of the best repetition
    pub gflops: f64,
    /// Reads of A and B plus the write of the result, GB/s
    pub memory_bandwidth_gbs: f64,
    /// Matrix bytes moved through the network per second, GB/s
    pub network_bandwidth_gbs: f64,
    /// Message counters of the reporting rank
    pub transfer_stats: TransferStats,
    pub exchange_stats: Option<ExchangeStats>,
    pub verification: VerificationResult,
}

/// Drives one benchmark configuration
pub struct TransposeBenchmark {
    config: TransposeConfig,
    kernel: Box<dyn KernelExecutor>,
}

impl TransposeBenchmark {
    pub fn new(config: TransposeConfig) -> Self {
        Self::with_kernel(config, Box::new(CpuKernel))
    }

    pub fn with_kernel(config: TransposeConfig, kernel: Box<dyn KernelExecutor>) -> Self {
        TransposeBenchmark { config, kernel }
    }

    pub fn config(&self) -> &TransposeConfig {
        &self.config
    }

    /// Run on every rank of `comm`'s world; all ranks must call this
    pub fn run(&self, comm: &dyn Communicator) -> Result<BenchmarkReport> {
        let rank = comm.rank();
        let mut handler = create_handler(&self.config, rank, comm.world_size())?;
        let mut buffer = handler.generate();
        if rank == 0 {
            info!(
                "running {} repetitions of {} with kernel {}",
                self.config.repetitions,
                handler.kind(),
                self.kernel.name()
            );
        }

        let mut timings = Vec::with_capacity(self.config.repetitions);
        for repetition in 0..self.config.repetitions {
            comm.barrier()?;
            let start = Instant::now();
            handler.exchange(comm, &mut buffer)?;
            let transfer = start.elapsed().as_secs_f64();

            let start = Instant::now();
            self.kernel.execute(handler.as_ref(), &mut buffer)?;
            let calculation = start.elapsed().as_secs_f64();

            handler.exchange(comm, &mut buffer)?;
            let timing = RepetitionTiming {
                transfer: comm.all_reduce_max(transfer)?,
                calculation: comm.all_reduce_max(calculation)?,
            };
            debug!(
                "rank {}: repetition {} transfer {:.6}s calculation {:.6}s",
                rank, repetition, timing.transfer, timing.calculation
            );
            timings.push(timing);
        }

        let exchange_stats = handler.exchange_stats();
        let transfer_stats = comm.stats();
        let verification = Verifier::default().verify(handler.as_mut(), comm, &mut buffer)?;
        if rank == 0 {
            info!(
                "verification {}: max error {:e}",
                if verification.passed { "passed" } else { "failed" },
                verification.max_error
            );
        }

        Ok(self.report(
            comm.world_size(),
            timings,
            transfer_stats,
            exchange_stats,
            verification,
        ))
    }

    /// Run all ranks as threads of this process and return rank 0's report
    pub fn run_local(&self, world_size: usize) -> Result<BenchmarkReport> {
        self.config.validate(world_size)?;
        let cluster = LocalCluster::new(world_size).with_timeout(self.config.timeout());
        let mut reports = cluster.run(|endpoint| self.run(&endpoint))?;
        // validate() guarantees at least one rank
        Ok(reports.swap_remove(0))
    }

    fn report(
        &self,
        world_size: usize,
        timings: Vec<RepetitionTiming>,
        transfer_stats: TransferStats,
        exchange_stats: Option<ExchangeStats>,
        verification: VerificationResult,
    ) -> BenchmarkReport {
        let count = timings.len().max(1) as f64;
        let avg_calculation_time = timings.iter().map(|t| t.calculation).sum::<f64>() / count;
        let avg_transfer_time = timings.iter().map(|t| t.transfer).sum::<f64>() / count;
        let best_calculation_time = timings
            .iter()
            .map(|t| t.calculation)
            .fold(f64::INFINITY, f64::min);
        let best_transfer_time = timings
            .iter()
            .map(|t| t.transfer)
            .fold(f64::INFINITY, f64::min);

        let n = self.config.matrix_size() as f64;
        let values = n * n;
        let bytes = values * std::mem::size_of::<f32>() as f64;
        let per_second = |amount: f64, seconds: f64| {
            if seconds > 0.0 && seconds.is_finite() {
                amount / seconds / 1e9
            } else {
                0.0
            }
        };

        BenchmarkReport {
            settings: self.config.settings_map(world_size),
            policy: self.config.policy,
            matrix_size: self.config.matrix_size(),
            world_size,
            kernel: self.kernel.name().to_string(),
            gflops: per_second(values, best_calculation_time),
            memory_bandwidth_gbs: per_second(3.0 * bytes, best_calculation_time),
            network_bandwidth_gbs: per_second(bytes, best_transfer_time),
            timings,
            avg_calculation_time,
            best_calculation_time,
            avg_transfer_time,
            best_transfer_time,
            transfer_stats,
            exchange_stats,
            verification,
        }
    }
}

impl fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════════════════╗")?;
        writeln!(f, "║              Distributed Block Matrix Transpose              ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════════════════╣")?;
        for (key, value) in &self.settings {
            writeln!(f, "║ {:<26} {:>33} ║", format!("{}:", key), value)?;
        }
        writeln!(f, "╠══════════════════════════════════════════════════════════════╣")?;
        writeln!(f, "║ Avg Calculation Time:      {:>12.6} s                     ║", self.avg_calculation_time)?;
        writeln!(f, "║ Best Calculation Time:     {:>12.6} s                     ║", self.best_calculation_time)?;
        writeln!(f, "║ Avg Transfer Time:         {:>12.6} s                     ║", self.avg_transfer_time)?;
        writeln!(f, "║ Best Transfer Time:        {:>12.6} s                     ║", self.best_transfer_time)?;
        writeln!(f, "╠══════════════════════════════════════════════════════════════╣")?;
        writeln!(f, "║ GFLOP/s:                   {:>12.3}                       ║", self.gflops)?;
        writeln!(f, "║ Memory Bandwidth:          {:>12.3} GB/s                  ║", self.memory_bandwidth_gbs)?;
        writeln!(f, "║ Network Bandwidth:         {:>12.3} GB/s                  ║", self.network_bandwidth_gbs)?;
        writeln!(f, "╠══════════════════════════════════════════════════════════════╣")?;
        writeln!(f, "║ Messages Sent (rank 0):    {:>12}                       ║", self.transfer_stats.messages_sent)?;
        if let Some(stats) = &self.exchange_stats {
            writeln!(f, "║ Exchange Steps:            {:>12}                       ║", stats.steps)?;
            writeln!(f, "║ Max Steps In Flight:       {:>12}                       ║", stats.max_in_flight)?;
        }
        writeln!(f, "║ Max Error:                 {:>12.3e}                       ║", self.verification.max_error)?;
        writeln!(
            f,
            "║ Validation:                {:>12}                       ║",
            if self.verification.passed { "PASSED" } else { "FAILED" }
        )?;
        writeln!(f, "╚══════════════════════════════════════════════════════════════╝")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_run_small() {
        let report = TransposeBenchmark::new(TransposeConfig::small())
            .run_local(4)
            .unwrap();
        assert!(report.verification.passed);
        assert_eq!(report.timings.len(), 1);
        assert_eq!(report.matrix_size, 16);
        assert!(report.exchange_stats.is_none());
        // rank 0 sits on the grid diagonal and keeps its blocks
        assert_eq!(report.transfer_stats.messages_sent, 0);
    }

    #[test]
    fn test_local_run_non_square() {
        let config = TransposeConfig {
            block_size: 2,
            repetitions: 2,
            timeout_ms: Some(10_000),
            ..TransposeConfig::grid_2x3()
        };
        let report = TransposeBenchmark::new(config).run_local(6).unwrap();
        assert!(report.verification.passed);
        let stats = report.exchange_stats.unwrap();
        assert_eq!(stats.steps, 6);
        assert_eq!(stats.blocks_sent, stats.blocks_received);
        assert!(report.best_transfer_time <= report.avg_transfer_time);
    }

    #[test]
    fn test_invalid_setup_fails_before_running() {
        let err = TransposeBenchmark::new(TransposeConfig::small())
            .run_local(3)
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_report_display_and_json() {
        let report = TransposeBenchmark::new(TransposeConfig::small())
            .run_local(4)
            .unwrap();
        let text = report.to_string();
        assert!(text.contains("PASSED"));
        assert!(text.contains("Data Handler:"));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["policy"], "PQ");
        assert_eq!(json["verification"]["passed"], true);
    }
}
