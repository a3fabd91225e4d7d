//! Entry point for `accio`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode. All protocol work lives in the library modules; `main.rs` owns only
//! process setup (logging, signal handling, argument parsing) and fatal
//! startup validation.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use accio::{send_file, SenderConfig, ServerConfig, SessionManager, Storage};

/// Minimal file-ingestion service over TCP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the ingestion server until Ctrl-C, then drain gracefully.
    Server {
        /// Port to listen on (all interfaces).
        #[arg(short, long)]
        port: u16,
        /// Directory where transfer artifacts are written.
        #[arg(short, long)]
        dir: PathBuf,
    },
    /// Send one file to a running server (single attempt, no retry).
    Client {
        /// Server host.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Server port.
        #[arg(short, long)]
        port: u16,
        /// File to send.
        #[arg(short, long)]
        file: PathBuf,
        /// Payload chunk size in bytes.
        #[arg(long, default_value_t = 10_000)]
        chunk_size: usize,
        /// Probability in [0, 1] of silently dropping each chunk.
        #[arg(long, default_value_t = 0.1)]
        fault_probability: f64,
        /// RNG seed for reproducible chunk drops.
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server { port, dir } => run_server(port, dir).await,
        Mode::Client {
            host,
            port,
            file,
            chunk_size,
            fault_probability,
            seed,
        } => run_client(host, port, file, chunk_size, fault_probability, seed).await,
    }
}

async fn run_server(port: u16, dir: PathBuf) -> anyhow::Result<()> {
    let storage = Storage::open(&dir)
        .await
        .with_context(|| format!("output directory {} is not usable", dir.display()))?;

    let manager = SessionManager::bind(("0.0.0.0", port), ServerConfig::default(), storage)
        .await
        .with_context(|| format!("cannot listen on port {port}"))?;

    let handle = manager.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("cannot wait for termination signal")?;
    log::info!("termination signal received");

    handle.shutdown().await;
    Ok(())
}

async fn run_client(
    host: String,
    port: u16,
    file: PathBuf,
    chunk_size: usize,
    fault_probability: f64,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        (0.0..=1.0).contains(&fault_probability),
        "fault probability must be within [0, 1], got {fault_probability}"
    );

    let config = SenderConfig {
        chunk_size,
        fault_probability,
        seed,
        ..SenderConfig::default()
    };

    let report = send_file((host.as_str(), port), &file, &config)
        .await
        .with_context(|| format!("transfer of {} failed", file.display()))?;

    println!(
        "sent {} of {} byte(s); {} chunk(s) dropped",
        report.bytes_sent,
        report.file_len,
        report.dropped_chunks.len()
    );
    Ok(())
}
