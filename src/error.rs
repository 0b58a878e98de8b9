use std::io;

use thiserror::Error;

/// Failure while decoding a request frame. Any variant ends the session.
#[derive(Debug, Error)]
pub(crate) enum ProtocolError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// Short reads mean the peer went away mid-frame; treat them like a close.
    pub(crate) fn from_read(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ProtocolError::ConnectionClosed,
            _ => ProtocolError::Io(e),
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("snapshot digest mismatch: wrote {expected}, read back {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("background saving already in progress")]
    BackgroundSaveInProgress,
}

impl PersistError {
    pub(crate) fn is_not_found(&self) -> bool {
        matches!(self, PersistError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

/// A KEYS pattern that cannot be matched. Raised only when matching reaches
/// the malformed part, so it is reported per key.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum PatternError {
    #[error("unclosed character class")]
    UnclosedClass,

    #[error("trailing escape")]
    TrailingEscape,
}
