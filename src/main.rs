//! Distributed Block Matrix Transpose - Command Line Interface
//!
//! Usage:
//!   ptrans run [OPTIONS]        Run the transpose benchmark on in-process ranks
//!   ptrans schedule [OPTIONS]   Show the exchange schedule of a grid
//!   ptrans config [OPTIONS]     Write a configuration file

use clap::{Parser, Subcommand};
use colored::*;

use pq_transpose::prelude::*;

#[derive(Parser)]
#[command(name = "ptrans")]
#[command(about = "Distributed block matrix transpose benchmark")]
#[command(version)]
struct Cli {
    /// Output results in JSON format (for machine parsing)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the benchmark, one thread per rank
    Run {
        /// Number of ranks
        #[arg(short = 'n', long, default_value = "4")]
        ranks: usize,

        /// TOML configuration file; flags below override its values
        #[arg(short, long)]
        config: Option<String>,

        /// Matrix width and height in blocks
        #[arg(short, long)]
        matrix_blocks: Option<usize>,

        /// Values per block side
        #[arg(short, long)]
        block_size: Option<usize>,

        /// Grid width P (defaults to the most square grid)
        #[arg(short = 'p', long)]
        grid_width: Option<usize>,

        /// Distribution policy (DIAG or PQ)
        #[arg(long)]
        policy: Option<PolicyKind>,

        /// Number of measured repetitions
        #[arg(short, long)]
        repetitions: Option<usize>,

        /// Receive timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Show target map, steps and block counts of a P x Q grid
    Schedule {
        /// Number of ranks
        #[arg(short = 'n', long, default_value = "6")]
        ranks: usize,

        /// Grid width P
        #[arg(short = 'p', long, default_value = "2")]
        grid_width: usize,

        /// Matrix width in blocks
        #[arg(short, long, default_value = "12")]
        matrix_blocks: usize,

        /// Only show this rank
        #[arg(short, long)]
        rank: Option<usize>,
    },

    /// Write a configuration file
    Config {
        /// Output path
        #[arg(short, long, default_value = "ptrans.toml")]
        output: String,

        /// Preset (default, small, grid-2x3)
        #[arg(long, default_value = "default")]
        preset: String,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let json_output = cli.json;

    match cli.command {
        Commands::Run {
            ranks,
            config,
            matrix_blocks,
            block_size,
            grid_width,
            policy,
            repetitions,
            timeout_ms,
        } => {
            let overrides = RunOverrides {
                matrix_blocks,
                block_size,
                grid_width,
                policy,
                repetitions,
                timeout_ms,
            };
            run_benchmark(ranks, config.as_deref(), overrides, json_output);
        }
        Commands::Schedule {
            ranks,
            grid_width,
            matrix_blocks,
            rank,
        } => {
            show_schedule(ranks, grid_width, matrix_blocks, rank, json_output);
        }
        Commands::Config { output, preset } => {
            write_config(&output, &preset, json_output);
        }
    }
}

fn fail(message: impl std::fmt::Display, json_output: bool) -> ! {
    if json_output {
        let error = serde_json::json!({ "error": message.to_string() });
        eprintln!("{}", error);
    } else {
        eprintln!("{}: {}", "Error".red(), message);
    }
    std::process::exit(1);
}

struct RunOverrides {
    matrix_blocks: Option<usize>,
    block_size: Option<usize>,
    grid_width: Option<usize>,
    policy: Option<PolicyKind>,
    repetitions: Option<usize>,
    timeout_ms: Option<u64>,
}

fn run_benchmark(ranks: usize, config_path: Option<&str>, overrides: RunOverrides, json_output: bool) {
    if !json_output {
        println!("{}", "╔══════════════════════════════════════════════════════════════╗".cyan());
        println!("{}", "║     Distributed Block Matrix Transpose                       ║".cyan());
        println!("{}", "╚══════════════════════════════════════════════════════════════╝".cyan());
        println!();
    }

    let mut config = match config_path {
        Some(path) => TransposeConfig::load(path).unwrap_or_else(|e| fail(e, json_output)),
        None => TransposeConfig {
            grid_width: pq_transpose::default_grid_width(ranks),
            ..Default::default()
        },
    };
    if let Some(v) = overrides.matrix_blocks {
        config.matrix_size_in_blocks = v;
    }
    if let Some(v) = overrides.block_size {
        config.block_size = v;
    }
    if let Some(v) = overrides.grid_width {
        config.grid_width = v;
    }
    if let Some(v) = overrides.policy {
        config.policy = v;
    }
    if let Some(v) = overrides.repetitions {
        config.repetitions = v;
    }
    if overrides.timeout_ms.is_some() {
        config.timeout_ms = overrides.timeout_ms;
    }

    if let Err(e) = config.validate(ranks) {
        fail(e, json_output);
    }

    if !json_output {
        println!("Configuration:");
        for (key, value) in config.settings_map(ranks) {
            println!("  • {}: {}", key, value);
        }
        println!();
        println!("{}", "Running benchmark...".yellow());
    }

    let start = std::time::Instant::now();
    let report = TransposeBenchmark::new(config)
        .run_local(ranks)
        .unwrap_or_else(|e| fail(e, json_output));
    let elapsed = start.elapsed();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&report).unwrap());
    } else {
        if report.verification.passed {
            println!("{}", "Benchmark complete!".green());
        } else {
            println!("{}", "Benchmark complete, validation FAILED".red());
        }
        println!();
        println!("{}", report);
        println!("Wall-clock time: {:.3}s", elapsed.as_secs_f64());
    }

    if !report.verification.passed {
        std::process::exit(1);
    }
}

/// JSON output structure for one rank's schedule
#[derive(serde::Serialize)]
struct RankSchedule {
    rank: usize,
    row: usize,
    col: usize,
    local_blocks: (usize, usize),
    /// Partner of the whole-buffer swap on square grids
    pair_rank: Option<usize>,
    steps: Vec<StepOutput>,
}

#[derive(serde::Serialize)]
struct StepOutput {
    send_rank: usize,
    recv_rank: usize,
    blocks_sent: usize,
    blocks_received: usize,
}

#[derive(serde::Serialize)]
struct ScheduleOutput {
    grid_width: usize,
    grid_height: usize,
    gcd: usize,
    lcm: usize,
    matrix_blocks: usize,
    ranks: Vec<RankSchedule>,
}

fn show_schedule(ranks: usize, grid_width: usize, matrix_blocks: usize, only: Option<usize>, json_output: bool) {
    let config = TransposeConfig {
        matrix_size_in_blocks: matrix_blocks,
        grid_width,
        policy: PolicyKind::Grid,
        ..Default::default()
    };
    if let Err(e) = config.validate(ranks) {
        fail(e, json_output);
    }
    if let Some(rank) = only.filter(|&r| r >= ranks) {
        fail(format!("rank {} outside world of {}", rank, ranks), json_output);
    }

    let mut output = ScheduleOutput {
        grid_width,
        grid_height: ranks / grid_width,
        gcd: 0,
        lcm: 0,
        matrix_blocks,
        ranks: Vec::new(),
    };
    let mut maps = Vec::new();

    for rank in (0..ranks).filter(|r| only.map_or(true, |o| o == *r)) {
        let handler = GridHandler::new(rank, ranks, grid_width, matrix_blocks, 1, usize::MAX)
            .unwrap_or_else(|e| fail(e, json_output));
        let topology = *handler.topology();
        output.gcd = topology.gcd;
        output.lcm = topology.lcm;
        let layout = handler.layout();

        let steps = handler
            .scheduler()
            .map(|scheduler| {
                scheduler
                    .step_blocks()
                    .map(|(step, outgoing, incoming)| StepOutput {
                        send_rank: step.send_rank,
                        recv_rank: step.recv_rank,
                        blocks_sent: outgoing.len(),
                        blocks_received: incoming.len(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        maps.push(handler.scheduler().map(|s| s.target_map().to_string()));

        output.ranks.push(RankSchedule {
            rank,
            row: topology.row,
            col: topology.col,
            local_blocks: (layout.rows, layout.cols),
            pair_rank: handler.scheduler().is_none().then(|| handler.pair_rank()),
            steps,
        });
    }

    if json_output {
        println!("{}", serde_json::to_string_pretty(&output).unwrap());
        return;
    }

    println!("{}", "╔══════════════════════════════════════════════════════════════╗".cyan());
    println!("{}", "║           Grid Exchange Schedule                             ║".cyan());
    println!("{}", "╚══════════════════════════════════════════════════════════════╝".cyan());
    println!();
    println!("Grid: P={} x Q={} (gcd {}, lcm {})", output.grid_width, output.grid_height, output.gcd, output.lcm);
    println!("Matrix: {} x {} blocks", matrix_blocks, matrix_blocks);
    println!();

    for (entry, map) in output.ranks.iter().zip(&maps) {
        println!(
            "{} {} (row {}, col {}): {} x {} local blocks",
            "Rank".cyan(),
            entry.rank,
            entry.row,
            entry.col,
            entry.local_blocks.0,
            entry.local_blocks.1
        );
        if let Some(pair) = entry.pair_rank {
            if pair == entry.rank {
                println!("  keeps its blocks (diagonal of the grid)");
            } else {
                println!("  swaps all blocks with rank {}", pair);
            }
            continue;
        }
        if let Some(map) = map {
            println!("  Target map:");
            for line in map.lines() {
                println!("    {}", line);
            }
        }
        for (index, step) in entry.steps.iter().enumerate() {
            println!(
                "  step {:>3}: send {:>4} blocks to {:>4}, receive {:>4} blocks from {:>4}",
                index, step.blocks_sent, step.send_rank, step.blocks_received, step.recv_rank
            );
        }
    }
}

fn write_config(path: &str, preset: &str, json_output: bool) {
    let config = match preset {
        "default" => TransposeConfig::default(),
        "small" => TransposeConfig::small(),
        "grid-2x3" => TransposeConfig::grid_2x3(),
        other => fail(
            format!("unknown preset '{}', expected default, small or grid-2x3", other),
            json_output,
        ),
    };
    if let Err(e) = config.save(path) {
        fail(e, json_output);
    }

    if json_output {
        let output = serde_json::json!({ "path": path, "config": config });
        println!("{}", serde_json::to_string_pretty(&output).unwrap());
    } else {
        println!("{} {}", "Configuration written to".green(), path);
    }
}
