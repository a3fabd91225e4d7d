//! `accio` — a minimal file-ingestion service over TCP.
//!
//! A client pushes the bytes of one local file to the server through a short
//! token handshake; the server persists each accepted transfer to a
//! per-connection file on disk.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐  accio\r\n            ┌───────────┐
//!  │  Sender  │◀──────────────────────│  Session  │ (one per connection)
//!  │ (client) │──confirm-accio\r\n───▶│           │
//!  └────┬─────┘                       └─────┬─────┘
//!       │  file chunks + FILE_SENT\r\n      │ raw bytes
//!       └───────────────────────────────────┤
//!                                     ┌─────▼─────┐
//!                                     │  Storage  │  <id>.file
//!                                     └───────────┘
//!  ┌─────────────────────────────────────────────┐
//!  │               SessionManager                │
//!  │  (accept loop, id assignment, registry,     │
//!  │   staleness sweep, graceful shutdown)       │
//!  └─────────────────────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`protocol`] — wire tokens and the substring scan shared by both peers
//! - [`storage`]  — per-session artifact persistence (payload or error marker)
//! - [`session`]  — per-connection state machine, from accept to persistence
//! - [`manager`]  — accept loop, live-session registry, sweep, shutdown
//! - [`sender`]   — client side: handshake, chunked send, fault injection

pub mod manager;
pub mod protocol;
pub mod sender;
pub mod session;
pub mod storage;

pub use manager::{ServerConfig, ServerHandle, SessionManager};
pub use sender::{send_file, SendError, SenderConfig, TransferReport};
pub use storage::Storage;
