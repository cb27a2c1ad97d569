//! conset-bench — throughput harness for the four concurrent sets.
//!
//! Drives the workload families the structures were built for: uniform
//! random operation mixes, Zipf-skewed mixes, and sequential /
//! shuffled construction-teardown runs.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use conset::core::report::Results;
use conset::core::workload::{
    shuffled_keys, worker_rng, OpKind, OperationMix, SkewedWorkload, UniformWorkload, Workload,
};
use conset::{AvlTree, CbTree, ConcurrentSet, MultiwaySearchTree, NonBlockingBst, ThreadRegistry};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

/// conset throughput benchmark
#[derive(Parser)]
#[command(name = "conset-bench")]
#[command(about = "Benchmark the concurrent ordered set implementations")]
#[command(version)]
struct Cli {
    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for .dat result files
    #[arg(long, default_value = "results")]
    out_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Structure {
    Avltree,
    Cbtree,
    Nbbst,
    Lfmst,
    All,
}

impl Structure {
    fn selected(self) -> &'static [Structure] {
        match self {
            Structure::All => &[
                Structure::Avltree,
                Structure::Cbtree,
                Structure::Nbbst,
                Structure::Lfmst,
            ],
            Structure::Avltree => &[Structure::Avltree],
            Structure::Cbtree => &[Structure::Cbtree],
            Structure::Nbbst => &[Structure::Nbbst],
            Structure::Lfmst => &[Structure::Lfmst],
        }
    }

    fn name(self) -> &'static str {
        match self {
            Structure::Avltree => "avltree",
            Structure::Cbtree => "cbtree",
            Structure::Nbbst => "nbbst",
            Structure::Lfmst => "lfmst",
            Structure::All => "all",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Uniform random add/remove/contains mix
    Random {
        /// Worker threads
        #[arg(long, default_value = "4")]
        threads: usize,

        /// Keys are drawn from [0, range]
        #[arg(long, default_value = "200000")]
        range: i32,

        /// Percentage of add operations
        #[arg(long, default_value = "5")]
        add: u32,

        /// Percentage of remove operations
        #[arg(long, default_value = "5")]
        remove: u32,

        /// Operations per thread
        #[arg(long, default_value = "1000000")]
        operations: u64,

        /// Repetitions; the best sample is reported
        #[arg(long, default_value = "3")]
        repeat: u32,

        /// Structure to drive
        #[arg(long, value_enum, default_value_t = Structure::All)]
        structure: Structure,

        /// Base RNG seed
        #[arg(long, default_value = "42")]
        seed: u64,
    },
    /// Zipf-skewed mix (hot keys)
    Skewed {
        #[arg(long, default_value = "8")]
        threads: usize,

        #[arg(long, default_value = "200000")]
        range: u64,

        /// Zipf exponent; higher is more skewed
        #[arg(long, default_value = "0.8")]
        exponent: f64,

        #[arg(long, default_value = "10")]
        add: u32,

        #[arg(long, default_value = "0")]
        remove: u32,

        #[arg(long, default_value = "1000000")]
        operations: u64,

        #[arg(long, default_value = "3")]
        repeat: u32,

        #[arg(long, value_enum, default_value_t = Structure::All)]
        structure: Structure,

        #[arg(long, default_value = "42")]
        seed: u64,
    },
    /// Sequential and shuffled fill/drain
    Fill {
        /// Number of keys to insert and remove
        #[arg(long, default_value = "100000")]
        size: usize,

        #[arg(long, value_enum, default_value_t = Structure::All)]
        structure: Structure,

        #[arg(long, default_value = "42")]
        seed: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(cli.log_level.parse().context("bad log level")?),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Random {
            threads,
            range,
            add,
            remove,
            operations,
            repeat,
            structure,
            seed,
        } => {
            let mix = OperationMix::new(add, remove)?;
            let workload = Workload::Uniform(UniformWorkload::new(range, mix));
            info!(
                threads,
                range, add, remove, operations, "uniform random benchmark"
            );

            let mut results = Results::start(format!("random-{range}-{add}-{remove}-{threads}"));
            for _ in 0..repeat {
                for &kind in structure.selected() {
                    let throughput = run_mix(kind, threads, operations, workload, seed);
                    info!(
                        structure = kind.name(),
                        throughput, "operations per millisecond"
                    );
                    results.add_result(kind.name(), throughput);
                }
            }
            results.finish(&cli.out_dir)?;
        }
        Commands::Skewed {
            threads,
            range,
            exponent,
            add,
            remove,
            operations,
            repeat,
            structure,
            seed,
        } => {
            let mix = OperationMix::new(add, remove)?;
            let workload = Workload::Skewed(SkewedWorkload::new(range, exponent, mix)?);
            info!(threads, range, exponent, add, remove, "skewed benchmark");

            let mut results = Results::start(format!("skewed-{range}-{exponent}-{threads}"));
            for _ in 0..repeat {
                for &kind in structure.selected() {
                    let throughput = run_mix(kind, threads, operations, workload, seed);
                    info!(
                        structure = kind.name(),
                        throughput, "operations per millisecond"
                    );
                    results.add_result(kind.name(), throughput);
                }
            }
            results.finish(&cli.out_dir)?;
        }
        Commands::Fill {
            size,
            structure,
            seed,
        } => {
            let mut results = Results::start(format!("fill-{size}"));
            for &kind in structure.selected() {
                let throughput = run_fill(kind, size, seed);
                info!(
                    structure = kind.name(),
                    throughput, "fill/drain operations per millisecond"
                );
                results.add_result(kind.name(), throughput);
            }
            results.finish(&cli.out_dir)?;
        }
    }

    Ok(())
}

fn run_mix(kind: Structure, threads: usize, operations: u64, workload: Workload, seed: u64) -> u64 {
    match kind {
        Structure::Avltree => drive_mix(&AvlTree::new(threads), threads, operations, workload, seed),
        Structure::Cbtree => drive_mix(&CbTree::new(threads), threads, operations, workload, seed),
        Structure::Nbbst => {
            drive_mix(&NonBlockingBst::new(threads), threads, operations, workload, seed)
        }
        Structure::Lfmst => {
            drive_mix(&MultiwaySearchTree::new(threads), threads, operations, workload, seed)
        }
        Structure::All => unreachable!("selected() never yields All"),
    }
}

/// Runs the operation mix on every worker and returns operations per
/// millisecond across all threads.
fn drive_mix<S: ConcurrentSet<i32>>(
    set: &S,
    threads: usize,
    operations: u64,
    workload: Workload,
    seed: u64,
) -> u64 {
    let registry = ThreadRegistry::new(threads);
    let start = Instant::now();

    std::thread::scope(|scope| {
        for tid in 0..threads {
            let registry = &registry;
            scope.spawn(move || {
                let Ok(ctx) = registry.register() else {
                    return;
                };
                let mut rng = worker_rng(seed, tid);
                for _ in 0..operations {
                    let (op, value) = workload.next(&mut rng);
                    match op {
                        OpKind::Add => {
                            set.add(&ctx, value);
                        }
                        OpKind::Remove => {
                            set.remove(&ctx, value);
                        }
                        OpKind::Contains => {
                            set.contains(&ctx, value);
                        }
                    }
                }
            });
        }
    });

    let elapsed_ms = start.elapsed().as_millis().max(1) as u64;
    threads as u64 * operations / elapsed_ms
}

fn run_fill(kind: Structure, size: usize, seed: u64) -> u64 {
    match kind {
        Structure::Avltree => drive_fill(&AvlTree::new(1), size, seed, false),
        Structure::Cbtree => drive_fill(&CbTree::new(1), size, seed, false),
        // The external BST is unbalanced; sequential insertion degrades
        // to a list, so it gets the shuffled stream only.
        Structure::Nbbst => drive_fill(&NonBlockingBst::new(1), size, seed, true),
        Structure::Lfmst => drive_fill(&MultiwaySearchTree::new(1), size, seed, false),
        Structure::All => unreachable!("selected() never yields All"),
    }
}

fn drive_fill<S: ConcurrentSet<i32>>(set: &S, size: usize, seed: u64, shuffled_only: bool) -> u64 {
    let registry = ThreadRegistry::new(1);
    let Ok(ctx) = registry.register() else {
        return 0;
    };
    let mut rng = worker_rng(seed, 0);
    let start = Instant::now();
    let mut operations = 0u64;

    if !shuffled_only {
        for key in 0..size as i32 {
            set.add(&ctx, key);
        }
        for key in 0..size as i32 {
            set.remove(&ctx, key);
        }
        operations += 2 * size as u64;
    }

    let keys = shuffled_keys(size, &mut rng);
    for &key in &keys {
        set.add(&ctx, key);
    }
    for &key in &keys {
        set.remove(&ctx, key);
    }
    operations += 2 * size as u64;

    let elapsed_ms = start.elapsed().as_millis().max(1) as u64;
    operations / elapsed_ms
}
