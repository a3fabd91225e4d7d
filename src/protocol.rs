//! Wire tokens and the substring scan shared by client and server.
//!
//! The protocol has no length prefix. Control markers are literal byte
//! sequences embedded in the stream:
//!
//! | Token               | Direction       | Meaning                        |
//! |---------------------|-----------------|--------------------------------|
//! | `accio\r\n`         | server → client | greeting, sent once on accept  |
//! | `confirm-accio\r\n` | client → server | handshake reply                |
//! | raw file bytes      | client → server | payload, opaque chunks         |
//! | `FILE_SENT\r\n`     | client → server | end of payload                 |
//!
//! The server does not parse the handshake reply; it only checks that the
//! accumulated bytes contain [`ACK_PATTERN`] somewhere. End of payload is
//! likewise detected by scanning the accumulated buffer for [`TERMINATOR`].
//!
//! # In-band terminator hazard
//!
//! Because termination is a substring scan over an unbounded binary payload,
//! a file that happens to contain `FILE_SENT\r\n` as naturally occurring
//! bytes ends the transfer early and truncates the saved data at that first
//! occurrence. This is a known limitation of the framing, kept deliberately;
//! see the truncation test in `tests/transfer_tests.rs`.

/// Greeting the server writes immediately after accepting a connection.
pub const GREETING: &[u8] = b"accio\r\n";

/// Handshake reply the client sends after reading the full greeting.
pub const HANDSHAKE_REPLY: &[u8] = b"confirm-accio\r\n";

/// Substring the server looks for in the client's handshake bytes.
///
/// Any reply containing this pattern advances the session; the reply is
/// otherwise not validated.
pub const ACK_PATTERN: &[u8] = b"accio";

/// Token the client sends after the last payload chunk.
pub const TERMINATOR: &[u8] = b"FILE_SENT\r\n";

/// Marker persisted in place of payload when a session fails.
pub const ERROR_MARKER: &[u8] = b"ERROR";

/// Byte offset of the first occurrence of `token` in `haystack`, if any.
///
/// Both peers drive their receive loops with this scan: the server over its
/// growing session buffer, the client byte-at-a-time over the greeting.
pub fn find_token(haystack: &[u8], token: &[u8]) -> Option<usize> {
    if token.is_empty() || haystack.len() < token.len() {
        return None;
    }
    haystack.windows(token.len()).position(|w| w == token)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
