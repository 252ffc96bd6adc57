//! Typed errors at the protocol and persistence seams
//!
//! Application-level plumbing uses `anyhow`; these enums cover the cases
//! callers need to branch on.

use thiserror::Error;

/// Connection lifecycle failures
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("failed to reach gateway at {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("logon rejected by gateway: {0}")]
    LogonRejected(String),

    #[error("logon response never arrived within {0:?}")]
    LogonTimeout(std::time::Duration),

    #[error("gateway negotiated unsupported protocol version {0}")]
    UnsupportedVersion(i64),

    #[error("gateway speaks binary DTC encoding, only text framing is supported")]
    UnsupportedEncoding,

    #[error("no inbound traffic for {0:?}, connection presumed dead")]
    SilenceTimeout(std::time::Duration),

    #[error("connection closed by peer")]
    PeerClosed,

    #[error("inbound frame exceeded the buffer limit, stream presumed corrupt")]
    FrameOverflow,

    #[error("circuit breaker is open, reconnect suppressed")]
    CircuitOpen,
}

/// Failures sending an outbound request on an established session
#[derive(Debug, Error)]
pub enum SendError {
    #[error("session is no longer connected")]
    Disconnected,

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("socket write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence failures; a failed write never silently loses state, the
/// previous durable state remains authoritative
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("a position is already open for scope {0}")]
    PositionExists(String),

    #[error("write failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}
