//! Accept loop, live-session registry, staleness sweep, graceful shutdown.
//!
//! The [`SessionManager`] is the only component that can see every session
//! at once. It assigns monotonically increasing ids, spawns one
//! [`Session`](crate::session::Session) task per accepted connection, and
//! tracks the live set in a registry behind one async mutex. Three parties
//! touch the registry, each through that lock:
//!
//! - the accept loop (insert),
//! - each session's exit path (remove),
//! - the staleness sweep (force-close signal; removal stays with the
//!   session so its artifact has exactly one writer).
//!
//! # Staleness sweep
//!
//! Independent of each session's idle timer: when an insert brings the live
//! count to [`ServerConfig::sweep_threshold`], every session whose age from
//! accept exceeds [`ServerConfig::max_session_age`] is signalled to close
//! and persists the error marker. This catches a peer that trickles bytes
//! forever, resetting its idle timer without ever completing. It is a
//! cleanup trigger, not admission control — connections are never rejected.
//!
//! # Shutdown
//!
//! [`ServerHandle::shutdown`] flips a watch channel observed by the accept
//! loop and by every session. Sessions drain like a peer close (partial
//! buffers flushed), and the manager awaits every session task before
//! returning: no session is abandoned without a persisted artifact.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::session::Session;
use crate::storage::Storage;

/// Default per-connection idle window.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default ceiling on total session age, idle resets notwithstanding.
const DEFAULT_MAX_SESSION_AGE: Duration = Duration::from_secs(600);

/// Default live-session count that triggers the staleness sweep.
const DEFAULT_SWEEP_THRESHOLD: usize = 10;

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Tunable timings and thresholds for the server side.
///
/// Defaults match the protocol's canonical values; tests shrink them.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// A session with no successful read for this long fails.
    pub idle_timeout: Duration,
    /// A session older than this (from accept) is force-closed by the sweep.
    pub max_session_age: Duration,
    /// Live-session count at which an insert triggers the sweep.
    pub sweep_threshold: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_session_age: DEFAULT_MAX_SESSION_AGE,
            sweep_threshold: DEFAULT_SWEEP_THRESHOLD,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// What the manager remembers about one live session.
struct SessionEntry {
    /// Accept time; the sweep ages sessions from here, not from activity.
    created_at: Instant,
    /// Wakes the session's force-close select branch.
    force_close: Arc<Notify>,
}

type Registry = Arc<Mutex<HashMap<u64, SessionEntry>>>;

/// Signal force-close to every session older than `max_age`.
///
/// Entries are not removed here: each session persists its error marker and
/// removes itself, keeping one writer per artifact.
fn sweep(live: &HashMap<u64, SessionEntry>, max_age: Duration) {
    let now = Instant::now();
    for (id, entry) in live {
        let age = now.duration_since(entry.created_at);
        if age > max_age {
            log::warn!("[session {id}] age {age:?} exceeds {max_age:?}; force-closing");
            entry.force_close.notify_one();
        }
    }
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

/// Owns the listening socket and the registry of live sessions.
pub struct SessionManager {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    storage: Storage,
    registry: Registry,
    /// Next session id; starts at 1, never reused, never decremented.
    next_id: u64,
}

impl SessionManager {
    /// Bind the listening socket. `127.0.0.1:0` gets an ephemeral port.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: ServerConfig,
        storage: Storage,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            config,
            storage,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: 1,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the accept loop and return a handle for addressing and
    /// shutting down the running server.
    pub fn spawn(self) -> ServerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let local_addr = self.local_addr;
        let handle = tokio::spawn(self.accept_loop(shutdown_rx));
        ServerHandle {
            local_addr,
            shutdown_tx,
            handle,
        }
    }

    async fn accept_loop(mut self, mut shutdown: watch::Receiver<bool>) {
        log::info!("listening on {}", self.local_addr);
        let mut session_tasks: Vec<JoinHandle<()>> = Vec::new();

        loop {
            tokio::select! {
                res = self.listener.accept() => {
                    match res {
                        Ok((stream, peer)) => {
                            session_tasks.retain(|t| !t.is_finished());
                            let task = self.admit(stream, peer, shutdown.clone()).await;
                            session_tasks.push(task);
                        }
                        Err(e) => {
                            // One failed accept does not stop the server.
                            log::warn!("accept failed: {e}");
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        self.drain(session_tasks).await;
    }

    /// Register and start one session for an accepted connection.
    async fn admit(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let id = self.next_id;
        self.next_id += 1;

        let force_close = Arc::new(Notify::new());
        let session = Session::new(
            id,
            stream,
            self.config.idle_timeout,
            self.storage.clone(),
            force_close.clone(),
            shutdown,
        );
        log::info!("[session {id}] accepted from {peer}");

        // The lock is held across the spawn, so the session's own removal
        // (which takes the same lock) cannot run before the entry exists.
        // Removal and terminal transition stay paired inside the task.
        let mut live = self.registry.lock().await;
        let registry = self.registry.clone();
        let task = tokio::spawn(async move {
            let _terminal = session.run().await;
            registry.lock().await.remove(&id);
        });
        live.insert(
            id,
            SessionEntry {
                created_at: Instant::now(),
                force_close,
            },
        );

        if live.len() >= self.config.sweep_threshold {
            log::debug!("{} live session(s); running staleness sweep", live.len());
            sweep(&live, self.config.max_session_age);
        }

        task
    }

    /// Await every session task after shutdown was signalled.
    ///
    /// Sessions saw the same watch channel flip and are flushing; finished
    /// tasks resolve immediately. A panicked session is logged, never
    /// propagated.
    async fn drain(self, session_tasks: Vec<JoinHandle<()>>) {
        let live = self.registry.lock().await.len();
        log::info!("shutting down; draining {live} live session(s)");

        for task in session_tasks {
            if let Err(e) = task.await {
                log::error!("session task join error: {e}");
            }
        }

        debug_assert!(self.registry.lock().await.is_empty());
        log::info!("shutdown complete");
    }
}

// ---------------------------------------------------------------------------
// ServerHandle
// ---------------------------------------------------------------------------

/// Handle to a running server, returned by [`SessionManager::spawn`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the server is accepting on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal shutdown and wait until every session has reached a terminal
    /// persisted artifact and the accept loop has exited.
    pub async fn shutdown(self) {
        // The loop may already be gone; a send error is not a failure here.
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            log::error!("server task join error: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_protocol() {
        let c = ServerConfig::default();
        assert_eq!(c.idle_timeout, Duration::from_secs(10));
        assert_eq!(c.max_session_age, Duration::from_secs(600));
        assert_eq!(c.sweep_threshold, 10);
    }

    #[tokio::test]
    async fn bind_assigns_ephemeral_port() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let manager = SessionManager::bind("127.0.0.1:0", ServerConfig::default(), storage)
            .await
            .unwrap();
        assert_ne!(manager.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn idle_server_shuts_down_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).await.unwrap();
        let manager = SessionManager::bind("127.0.0.1:0", ServerConfig::default(), storage)
            .await
            .unwrap();

        let handle = manager.spawn();
        handle.shutdown().await;

        // No sessions ever ran, so no artifacts were produced.
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_only_signals_overage_sessions() {
        let old_notify = Arc::new(Notify::new());
        let young_notify = Arc::new(Notify::new());

        let mut live = HashMap::new();
        live.insert(
            1,
            SessionEntry {
                created_at: Instant::now(),
                force_close: old_notify.clone(),
            },
        );
        tokio::time::sleep(Duration::from_secs(700)).await;
        live.insert(
            2,
            SessionEntry {
                created_at: Instant::now(),
                force_close: young_notify.clone(),
            },
        );

        sweep(&live, Duration::from_secs(600));

        // A signalled Notify stores a permit, so notified() resolves at once;
        // the young session's future must still be pending.
        tokio::time::timeout(Duration::from_millis(1), old_notify.notified())
            .await
            .expect("over-age session must be signalled");
        assert!(
            tokio::time::timeout(Duration::from_millis(1), young_notify.notified())
                .await
                .is_err()
        );
    }
}
