use std::sync::Arc;

use thiserror::Error;

pub use color_eyre::eyre::eyre;

use crate::protocol::response::ErrPacket;

pub type Result<T> = core::result::Result<T, Error>;

/// Crate-wide error type.
///
/// Promise rejections fan out to every registered handler, so the type is
/// `Clone`; non-clonable payloads (`std::io::Error`, `color_eyre::Report`)
/// are held behind `Arc`.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Server Error: {0}")]
    Server(#[from] ErrPacket),

    #[error("Authentication failed (code {code}): {message}")]
    Auth { code: u16, message: String },

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Invalid packet")]
    InvalidPacket,

    #[error("Unexpected end of packet")]
    UnexpectedEof,

    #[error("Packet sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u8, actual: u8 },

    #[error("Unknown protocol element: {0}")]
    UnknownProtocol(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Event loop is already running")]
    LoopBusy,

    #[error("No event loop on the current thread")]
    NoEventLoop,

    #[error("Event loop ran out of work while a promise was still pending")]
    Deadlock,

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Cannot nest transactions - a transaction is already active")]
    NestedTransaction,

    #[error("Statement expects {expected} parameters, got {actual}")]
    ParamCountMismatch { expected: u16, actual: usize },

    #[error("Invalid isolation level: {0}")]
    InvalidIsolationLevel(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Bad config error: {0}")]
    BadConfig(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("All {count} promises rejected; last: {last}")]
    AllRejected { count: usize, last: Box<Error> },

    #[error("A bug in weft: {0}")]
    LibraryBug(Arc<color_eyre::Report>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<color_eyre::Report> for Error {
    fn from(report: color_eyre::Report) -> Self {
        Error::LibraryBug(Arc::new(report))
    }
}

impl From<core::convert::Infallible> for Error {
    fn from(err: core::convert::Infallible) -> Self {
        match err {}
    }
}

impl Error {
    pub fn from_debug(err: impl std::fmt::Debug) -> Self {
        Self::LibraryBug(Arc::new(eyre!(format!("{:#?}", err))))
    }

    /// Transport and protocol errors are fatal for the connection that
    /// produced them; server-reported SQL errors are not.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::InvalidPacket
                | Error::UnexpectedEof
                | Error::SequenceMismatch { .. }
                | Error::UnknownProtocol(_)
        )
    }
}

impl<Src, Dst: ?Sized> From<zerocopy::CastError<Src, Dst>> for Error {
    fn from(err: zerocopy::CastError<Src, Dst>) -> Self {
        Self::LibraryBug(Arc::new(eyre!("{:#?}", err)))
    }
}
