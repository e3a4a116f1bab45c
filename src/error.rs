use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the session and pool layers.
///
/// Fatality is decided by the owning session: protocol and I/O errors mark
/// the session failed and unusable, while a server-reported error leaves it
/// idle and reusable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("packet out of order: expected sequence {expected}, got {actual}")]
    PacketOutOfOrder { expected: u8, actual: u8 },

    #[error("incomplete response: expected {expected} more bytes, got {actual}")]
    IncompleteResponse { expected: usize, actual: usize },

    #[error("server error {code} ({sql_state}): {message}")]
    Server {
        code: u16,
        sql_state: String,
        message: String,
    },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("pool exhausted: timed out waiting for a session (pool full: {pool_full})")]
    PoolTimeout { pool_full: bool },

    #[error("pool is closed")]
    PoolClosed,

    #[error("session is not usable (failed or closed)")]
    SessionUnusable,

    #[error("a command is already in flight on this session")]
    CommandInFlight,

    #[error("connection closed by server")]
    Disconnected,

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error is fatal to the session that produced it.
    ///
    /// A server-reported error payload is a normal reply; everything that
    /// indicates a broken or desynchronized connection is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Server { .. })
    }
}
