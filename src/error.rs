//! Typed errors for the notification pipeline.
//!
//! Command handlers in `main.rs` still return `anyhow::Result`; the types here
//! exist where a caller has to tell one failure apart from another.

use thiserror::Error;

/// Failure converting between hex, binary, and `npub` identities.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("invalid hex identity: {0}")]
    Hex(String),

    #[error("invalid bech32 identity: {0}")]
    Bech32(String),

    #[error("wrong prefix: expected {expected}, got {got}")]
    Prefix { expected: String, got: String },

    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}

/// Dedup store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Identity directory failure. "Not found" is not an error; see
/// [`crate::directory::IdentityDirectory::lookup`].
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The directory could not be reached or read.
    #[error("identity directory unavailable: {0}")]
    Unavailable(String),

    /// The directory answered with data that could not be parsed.
    #[error("identity directory corrupt: {0}")]
    Corrupt(String),
}

/// Transport failure on a single relay connection.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid relay url: {0}")]
    Url(#[from] url::ParseError),

    #[error("relay url {0} has no host or port")]
    Address(String),

    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("socks proxy error: {0}")]
    Socks(#[from] tokio_socks::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connect timed out after {0}s")]
    Timeout(u64),
}
