//! ring-bench - measures what pushing telemetry costs a CPU-bound loop
//!
//! Runs a fibonacci workload once bare to get the target throughput, then
//! again pushing a `{name: "batch", time, batch_size}` record per iteration,
//! and prints the rate statistics the consumer computed from those records.

use anyhow::Context;
use chrono::{Local, Utc};
use clap::Parser;
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};
use log::{info, warn};
use std::hint::black_box;
use std::path::PathBuf;
use std::time::Instant;
use telemetry_ring::report::print_table;
use telemetry_ring::{
    factory, fields, stat_stream_table, Assembler, Backend, LoggingConfig, RateMeter,
    TableFormat, Telemetry, TelemetryConfig, WorkerKind,
};

const BATCH_SIZE: i64 = 1024;

#[derive(Parser, Debug)]
#[command(name = "ring-bench", version, about = "Telemetry channel overhead benchmark")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "RING_CONFIG")]
    config: Option<PathBuf>,

    /// Slot store: shared | queue
    #[arg(long)]
    backend: Option<Backend>,

    /// Consumer execution unit: thread | process
    #[arg(long)]
    worker: Option<WorkerKind>,

    /// Channel capacity in cells
    #[arg(long)]
    capacity: Option<u64>,

    /// Loop iterations, one record each
    #[arg(short = 'n', long, default_value_t = 60)]
    iterations: u32,

    /// Fibonacci argument of the fake work
    #[arg(long, default_value_t = 28)]
    depth: u32,

    /// Report format: csv | md
    #[arg(long, default_value = "csv")]
    format: TableFormat,

    /// Also append the report to this file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Prefix of the environment overrides
    #[arg(long, default_value = "ring")]
    namespace: String,
}

fn fibonacci(n: u32) -> u64 {
    if n < 2 {
        return n as u64;
    }
    fibonacci(n - 1) + fibonacci(n - 2)
}

fn fake_work(depth: u32) {
    black_box(fibonacci(black_box(depth)));
}

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

fn initialize_logging(logging: &LoggingConfig) -> anyhow::Result<LoggerHandle> {
    let timestamp = Local::now().format("%Y-%m-%d_%H_%M_%S").to_string();
    let log_filename = format!("ring-bench_{}", timestamp);

    let handle = Logger::try_with_str(&logging.level)
        .context("Failed to create logger")?
        .format(flexi_logger::colored_opt_format)
        .log_to_file(
            FileSpec::default()
                .directory(&logging.directory)
                .basename(log_filename)
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::Warn)
        .rotate(
            Criterion::Size(logging.max_file_size),
            Naming::Numbers,
            Cleanup::KeepLogFiles(logging.max_files),
        )
        .start()
        .context("Failed to start logger")?;

    Ok(handle)
}

fn load_config(args: &Args) -> anyhow::Result<TelemetryConfig> {
    let mut config = match &args.config {
        Some(path) => TelemetryConfig::load(path)?,
        None => TelemetryConfig::default(),
    };
    config.apply_env(&args.namespace)?;
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(worker) = args.worker {
        config.worker = worker;
    }
    if let Some(capacity) = args.capacity {
        config.capacity = capacity;
    }
    config.validate()?;
    Ok(config)
}

/// Throughput of the bare loop, in batch items per second, and seconds per iteration.
fn baseline(iterations: u32, depth: u32) -> (f64, f64) {
    let started = Instant::now();
    for _ in 0..iterations {
        fake_work(depth);
    }
    let elapsed = started.elapsed().as_secs_f64();
    let count = BATCH_SIZE as f64 * iterations as f64;
    (count / elapsed, elapsed / iterations as f64)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    let _logger = initialize_logging(&config.logging)?;

    info!(
        "Starting ring-bench: backend={:?}, worker={:?}, iterations={}",
        config.backend, config.worker, args.iterations
    );

    let (target, per_iteration) = baseline(args.iterations, args.depth);

    // 报表在消费端（线程或子进程）完成时直接输出
    let format = args.format;
    let output = args.output.clone();
    let meter = RateMeter::new("batch", "batch_size").on_complete(move |rates| {
        let printed = stat_stream_table(&["rate"], &[*rates]).and_then(|table| {
            print_table(&table, &mut std::io::stdout(), format, output.as_deref())
        });
        if let Err(e) = printed {
            log::error!("Failed to print report: {}", e);
        }
    });

    let iterations = args.iterations;
    let depth = args.depth;
    let dropped = Telemetry::scope(
        config,
        factory(move || Ok(Assembler::new(meter))),
        |telemetry| {
            let mut dropped = 0u32;
            for _ in 0..iterations {
                let record = fields! {
                    "name" => "batch",
                    "time" => now_ns(),
                    "batch_size" => BATCH_SIZE,
                }?;
                match telemetry.push_object(record) {
                    Ok(()) => {}
                    Err(e) if e.is_recoverable() => {
                        dropped += 1;
                        warn!("Record dropped: {}", e);
                    }
                    Err(e) => return Err(anyhow::Error::from(e)),
                }
                fake_work(depth);
            }
            Ok::<_, anyhow::Error>(dropped)
        },
    )?;

    if dropped > 0 {
        warn!("{} records dropped under backpressure", dropped);
    }
    println!("Target is {:.4} | {:.6}", target, per_iteration);
    Ok(())
}
