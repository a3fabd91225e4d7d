//! Per-connection state machine.
//!
//! A [`Session`] owns the complete server-side state for one accepted
//! connection: the socket, the single growing byte buffer, and the idle
//! deadline. Its lifecycle is:
//!
//! ```text
//!  AwaitingHandshakeEcho ──ack pattern seen──▶ ReceivingPayload
//!          │                                        │
//!          │ idle timeout / error / force-close     │ terminator found
//!          ▼                                        ▼
//!        Failed ◀──idle timeout / force-close── Completed
//! ```
//!
//! Progression is strictly forward; no state is revisited. Exactly one
//! persistence write happens per session, on the terminal transition, and
//! the socket is closed exactly once on every exit path (when the session
//! is dropped). Failures never cross the session boundary: the task logs,
//! persists its artifact, and exits.
//!
//! The handshake check is deliberately lax: any received bytes containing
//! the [`ACK_PATTERN`] substring advance the session — there is no parse of
//! the reply (see [`crate::protocol`]).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::protocol::{self, ACK_PATTERN, GREETING, TERMINATOR};
use crate::storage::Storage;

/// Socket read granularity.
const READ_CHUNK: usize = 4096;

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// All states of the per-connection machine, in progression order.
///
/// The derived ordering encodes the forward-only invariant: every legal
/// transition goes to a strictly greater variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Greeting sent; waiting for bytes containing the ack pattern.
    AwaitingHandshakeEcho,
    /// Accumulating payload until the terminator appears in the buffer.
    ReceivingPayload,
    /// Terminal: payload bytes persisted.
    Completed,
    /// Terminal: error marker persisted.
    Failed,
}

impl SessionState {
    /// `true` for [`Completed`](Self::Completed) and [`Failed`](Self::Failed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

// ---------------------------------------------------------------------------
// Failure reasons
// ---------------------------------------------------------------------------

/// Why a session ended in [`SessionState::Failed`].
#[derive(Debug, Error)]
pub enum FailReason {
    #[error("no activity for {0:?}")]
    IdleTimeout(Duration),
    #[error("force-closed by staleness sweep")]
    ForceClosed,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the receive loop ended. Terminal classification and the single
/// persistence write happen afterwards, in one place.
enum Outcome {
    /// Terminator found; buffer already truncated at its end.
    Completed,
    /// Peer closed (or shutdown was signalled) before the terminator.
    PeerClosed,
    Failed(FailReason),
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Server-side state for one accepted connection.
pub struct Session {
    id: u64,
    stream: TcpStream,
    /// All bytes received so far, handshake reply included.
    buf: Vec<u8>,
    state: SessionState,
    created_at: Instant,
    last_activity: Instant,
    idle_timeout: Duration,
    storage: Storage,
    /// Signalled by the manager's staleness sweep.
    force_close: Arc<Notify>,
    /// Process-wide shutdown signal.
    shutdown: watch::Receiver<bool>,
}

impl Session {
    pub fn new(
        id: u64,
        stream: TcpStream,
        idle_timeout: Duration,
        storage: Storage,
        force_close: Arc<Notify>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            stream,
            buf: Vec::new(),
            state: SessionState::AwaitingHandshakeEcho,
            created_at: now,
            last_activity: now,
            idle_timeout,
            storage,
            force_close,
            shutdown,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to a terminal state and persist its artifact.
    ///
    /// Consumes the session; the socket closes when it is dropped here.
    /// Returns the terminal state reached.
    pub async fn run(mut self) -> SessionState {
        let outcome = self.drive().await;
        self.finish(outcome).await
    }

    /// Greeting, handshake scan, receive-until-terminator.
    async fn drive(&mut self) -> Outcome {
        if let Err(e) = self.stream.write_all(GREETING).await {
            return Outcome::Failed(FailReason::Io(e));
        }
        log::debug!("[session {}] greeting sent", self.id);

        let mut chunk = [0u8; READ_CHUNK];
        let idle = tokio::time::sleep(self.idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                res = self.stream.read(&mut chunk) => {
                    let n = match res {
                        Ok(0) => return Outcome::PeerClosed,
                        Ok(n) => n,
                        Err(e) => return Outcome::Failed(FailReason::Io(e)),
                    };
                    self.buf.extend_from_slice(&chunk[..n]);
                    self.last_activity = Instant::now();
                    idle.as_mut().reset(self.last_activity + self.idle_timeout);

                    if self.state == SessionState::AwaitingHandshakeEcho
                        && protocol::find_token(&self.buf, ACK_PATTERN).is_some()
                    {
                        self.advance(SessionState::ReceivingPayload);
                    }
                    // The read that completed the handshake may already carry
                    // the terminator; scan in the same iteration.
                    if self.state == SessionState::ReceivingPayload {
                        if let Some(at) = protocol::find_token(&self.buf, TERMINATOR) {
                            // Truncate at the end of the first occurrence;
                            // bytes after it in the same read are dropped.
                            self.buf.truncate(at + TERMINATOR.len());
                            return Outcome::Completed;
                        }
                    }
                }
                _ = &mut idle => {
                    return Outcome::Failed(FailReason::IdleTimeout(self.idle_timeout));
                }
                _ = self.force_close.notified() => {
                    return Outcome::Failed(FailReason::ForceClosed);
                }
                _ = self.shutdown.changed() => {
                    // Coordinated shutdown drains like a peer close: whatever
                    // arrived is flushed below.
                    return Outcome::PeerClosed;
                }
            }
        }
    }

    /// Terminal transition and the session's single persistence write.
    ///
    /// A short transfer (peer gone before the terminator) keeps its partial
    /// bytes; only an empty buffer degrades to the error marker.
    async fn finish(&mut self, outcome: Outcome) -> SessionState {
        let terminal = match outcome {
            Outcome::Completed => SessionState::Completed,
            Outcome::PeerClosed if !self.buf.is_empty() => {
                log::warn!(
                    "[session {}] peer closed before terminator; keeping {} byte(s)",
                    self.id,
                    self.buf.len()
                );
                SessionState::Completed
            }
            Outcome::PeerClosed => SessionState::Failed,
            Outcome::Failed(reason) => {
                log::warn!("[session {}] failed: {reason}", self.id);
                SessionState::Failed
            }
        };
        self.advance(terminal);

        let write = match terminal {
            SessionState::Completed => self.storage.save_payload(self.id, &self.buf).await,
            _ => self.storage.save_error(self.id).await,
        };
        if let Err(e) = write {
            log::error!("[session {}] could not persist artifact: {e}", self.id);
        }

        log::info!(
            "[session {}] {} after {:?}; {} byte(s) received",
            self.id,
            terminal,
            self.created_at.elapsed(),
            self.buf.len()
        );
        terminal
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            next > self.state,
            "session state must progress forward: {} -> {next}",
            self.state
        );
        log::debug!("[session {}] {} -> {next}", self.id, self.state);
        self.state = next;
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ERROR_MARKER, HANDSHAKE_REPLY};
    use tokio::net::TcpListener;

    #[test]
    fn states_progress_forward() {
        assert!(SessionState::AwaitingHandshakeEcho < SessionState::ReceivingPayload);
        assert!(SessionState::ReceivingPayload < SessionState::Completed);
        assert!(!SessionState::ReceivingPayload.is_terminal());
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
    }

    /// Accept one loopback connection and build a session around it.
    async fn session_pair(
        idle_timeout: Duration,
        storage: Storage,
    ) -> (Session, TcpStream, Arc<Notify>, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let force_close = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = Session::new(
            1,
            accepted,
            idle_timeout,
            storage,
            force_close.clone(),
            shutdown_rx,
        );
        (session, client, force_close, shutdown_tx)
    }

    #[tokio::test]
    async fn completes_on_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let (session, mut client, _force, _shutdown_tx) =
            session_pair(Duration::from_secs(5), storage.clone()).await;

        let driver = tokio::spawn(session.run());

        let mut greeting = vec![0u8; GREETING.len()];
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, GREETING);

        client.write_all(HANDSHAKE_REPLY).await.unwrap();
        client.write_all(b"payload bytes").await.unwrap();
        client.write_all(TERMINATOR).await.unwrap();

        let terminal = driver.await.unwrap();
        assert_eq!(terminal, SessionState::Completed);

        let artifact = tokio::fs::read(storage.artifact_path(1)).await.unwrap();
        let mut expected = HANDSHAKE_REPLY.to_vec();
        expected.extend_from_slice(b"payload bytes");
        expected.extend_from_slice(TERMINATOR);
        assert_eq!(artifact, expected);
    }

    #[tokio::test]
    async fn idle_timeout_persists_error_marker() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let (session, _client, _force, _shutdown_tx) =
            session_pair(Duration::from_millis(100), storage.clone()).await;

        // The client never sends a byte; the idle window runs out.
        let terminal = session.run().await;
        assert_eq!(terminal, SessionState::Failed);

        let artifact = tokio::fs::read(storage.artifact_path(1)).await.unwrap();
        assert_eq!(artifact, ERROR_MARKER);
    }

    #[tokio::test]
    async fn force_close_persists_error_marker() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let (session, _client, force, _shutdown_tx) =
            session_pair(Duration::from_secs(5), storage.clone()).await;

        // Permit is stored: the session observes it on its first select pass.
        force.notify_one();

        let terminal = session.run().await;
        assert_eq!(terminal, SessionState::Failed);

        let artifact = tokio::fs::read(storage.artifact_path(1)).await.unwrap();
        assert_eq!(artifact, ERROR_MARKER);
    }

    #[tokio::test]
    async fn peer_close_flushes_partial_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let (session, mut client, _force, _shutdown_tx) =
            session_pair(Duration::from_secs(5), storage.clone()).await;

        let driver = tokio::spawn(session.run());

        let mut greeting = vec![0u8; GREETING.len()];
        client.read_exact(&mut greeting).await.unwrap();
        client.write_all(HANDSHAKE_REPLY).await.unwrap();
        client.write_all(b"short").await.unwrap();
        drop(client); // no terminator

        let terminal = driver.await.unwrap();
        assert_eq!(terminal, SessionState::Completed);

        let artifact = tokio::fs::read(storage.artifact_path(1)).await.unwrap();
        let mut expected = HANDSHAKE_REPLY.to_vec();
        expected.extend_from_slice(b"short");
        assert_eq!(artifact, expected);
    }

    #[tokio::test]
    async fn empty_close_persists_error_marker() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let (session, client, _force, _shutdown_tx) =
            session_pair(Duration::from_secs(5), storage.clone()).await;

        drop(client); // connect, then vanish without a byte

        let terminal = session.run().await;
        assert_eq!(terminal, SessionState::Failed);

        let artifact = tokio::fs::read(storage.artifact_path(1)).await.unwrap();
        assert_eq!(artifact, ERROR_MARKER);
    }
}
