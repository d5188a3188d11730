//! # Distributed All-to-All Bandwidth Benchmark — Main Entry Point
//!
//! The main function performs these key operations:
//! 1. **Initialize logging**: sets up structured logging with tracing
//! 2. **Parse arguments**: processes command-line configuration
//! 3. **Create benchmark config**: converts CLI args to internal config
//! 4. **Bootstrap and run**: connects the transport mesh and runs the
//!    selected mode to completion
//! 5. **Report**: prints the per-rank summary and optionally writes it
//!    as JSON

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use rdma_alltoall_bench::bench;
use rdma_alltoall_bench::cli::{Args, BenchmarkConfig};
use rdma_alltoall_bench::report::{self, RankSummary};

mod logging;
use logging::ColorizedFormatter;

/// Main application entry point. Uses Tokio's multi-threaded runtime to
/// drive the transport's async I/O alongside the gap-engine/communicator
/// task trees.
#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments first, as they control logging behavior.
    let args = Args::parse();

    // -v: DEBUG, -vv and more: TRACE, default: INFO. Applies to both the
    // log file and stdout.
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // The guard must be kept alive for the duration of the program for
    // file logging to keep flushing.
    let guard;
    let detailed_log_layer;

    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("rdma-bench.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "rdma-bench.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // Clean, user-facing output to stdout, suppressed by --quiet.
    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    // Keep the guard alive for the duration of the program; dropping it
    // immediately would stop file logging.
    let _log_guard = guard;

    info!("starting distributed all-to-all benchmark");

    let config = BenchmarkConfig::from_args(&args)?;
    let (rank, result) = bench::run(&config).await?;

    let summary = RankSummary::new(rank, &result);
    summary.print_console_line();
    if let Some(path) = &config.output_file {
        report::write_json_summary(path, &summary)?;
        info!("wrote summary to {path:?}");
    }

    info!("benchmark completed successfully");
    Ok(())
}
