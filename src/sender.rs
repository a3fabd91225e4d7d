//! Client side: one transfer attempt, no retry.
//!
//! The sender opens a bounded-timeout connection, scans byte-at-a-time for
//! the greeting (the inverse of the server's buffer scan), replies with the
//! handshake token, then streams the file as fixed-size chunks and closes
//! with the terminator.
//!
//! # Fault model
//!
//! Each chunk is first delayed in proportion to its length (an emulated
//! slow link), then with probability [`SenderConfig::fault_probability`]
//! **silently skipped**: the gap is never reported to the peer — no
//! checksum, no sequence number, no retransmit. The receiver cannot detect
//! it. This is deliberate fault injection for exercising the receiver
//! under lossy transfers, not a correctness feature. With a fixed
//! [`SenderConfig::seed`] the dropped chunk set is reproducible.

use std::io;
use std::path::Path;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;

use crate::protocol::{self, GREETING, HANDSHAKE_REPLY, TERMINATOR};

/// Default payload chunk size in bytes.
const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Default probability of silently dropping a chunk.
const DEFAULT_FAULT_PROBABILITY: f64 = 0.1;

/// Default bound on the connection attempt.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Emulated link delay per payload byte.
const DELAY_PER_BYTE: Duration = Duration::from_micros(10);

/// Cap on the per-chunk delay (reached at the default chunk size).
const MAX_CHUNK_DELAY: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from a transfer attempt. None of these are retried.
#[derive(Debug, Error)]
pub enum SendError {
    /// The source file could not be read; no connection was attempted.
    #[error("cannot read source file: {0}")]
    Source(io::Error),
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("connection failed: {0}")]
    Connect(io::Error),
    /// The server closed before sending the complete greeting.
    #[error("connection closed before the greeting completed")]
    GreetingCut,
    /// Mid-transfer socket error; remaining chunks (and possibly the
    /// terminator) were not sent.
    #[error("socket error mid-transfer: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Config and report
// ---------------------------------------------------------------------------

/// Tunable parameters of the sender's transfer and fault model.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Payload chunk size in bytes.
    pub chunk_size: usize,
    /// Probability in `[0.0, 1.0]` of silently dropping each chunk.
    pub fault_probability: f64,
    /// Bound on the connection attempt.
    pub connect_timeout: Duration,
    /// Fixed RNG seed for reproducible drops; `None` uses OS entropy.
    pub seed: Option<u64>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            fault_probability: DEFAULT_FAULT_PROBABILITY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            seed: None,
        }
    }
}

/// What one transfer attempt actually did.
#[derive(Debug, Clone)]
pub struct TransferReport {
    /// Length of the source file.
    pub file_len: usize,
    /// Payload bytes actually written (dropped chunks excluded).
    pub bytes_sent: usize,
    /// Indices of the chunks the fault model dropped.
    pub dropped_chunks: Vec<usize>,
}

impl TransferReport {
    /// Payload bytes the fault model swallowed.
    pub fn dropped_bytes(&self) -> usize {
        self.file_len - self.bytes_sent
    }
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

/// Perform exactly one transfer attempt of `path` to `addr`.
///
/// The file is read fully before any connection is made — a missing file
/// fails fast without touching the network. There is no retry at any stage.
pub async fn send_file(
    addr: impl ToSocketAddrs,
    path: &Path,
    config: &SenderConfig,
) -> Result<TransferReport, SendError> {
    let data = tokio::fs::read(path).await.map_err(SendError::Source)?;

    let mut stream = timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| SendError::ConnectTimeout(config.connect_timeout))?
        .map_err(SendError::Connect)?;

    await_greeting(&mut stream).await?;
    stream.write_all(HANDSHAKE_REPLY).await?;
    log::debug!("[sender] greeting received; reply sent");

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut report = TransferReport {
        file_len: data.len(),
        bytes_sent: 0,
        dropped_chunks: Vec::new(),
    };

    for (index, chunk) in data.chunks(config.chunk_size.max(1)).enumerate() {
        tokio::time::sleep(chunk_delay(chunk.len())).await;

        if rng.gen::<f64>() < config.fault_probability {
            // Silent gap: logged locally, never reported to the peer.
            log::warn!("[sender] dropping chunk {index} ({} bytes)", chunk.len());
            report.dropped_chunks.push(index);
            continue;
        }

        stream.write_all(chunk).await?;
        report.bytes_sent += chunk.len();
    }

    stream.write_all(TERMINATOR).await?;
    stream.flush().await?;

    log::info!(
        "[sender] sent {} of {} byte(s); {} chunk(s) dropped",
        report.bytes_sent,
        report.file_len,
        report.dropped_chunks.len()
    );
    Ok(report)
}

/// Read one byte at a time until the literal greeting has been seen.
async fn await_greeting(stream: &mut TcpStream) -> Result<(), SendError> {
    let mut seen: Vec<u8> = Vec::with_capacity(GREETING.len());
    let mut byte = [0u8; 1];

    while protocol::find_token(&seen, GREETING).is_none() {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(SendError::GreetingCut);
        }
        seen.push(byte[0]);
    }
    Ok(())
}

/// Delay for one chunk: proportional to its length, capped.
fn chunk_delay(len: usize) -> Duration {
    Duration::from_micros(len as u64 * DELAY_PER_BYTE.as_micros() as u64).min(MAX_CHUNK_DELAY)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
