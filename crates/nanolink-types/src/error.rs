//! Error taxonomy shared by the codec, connections and the registry.

use std::time::Duration;
use thiserror::Error;

/// Errors produced anywhere in the nanolink transport.
#[derive(Error, Debug)]
pub enum WireError {
    /// Socket I/O failed (includes EOF in the middle of a frame).
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A socket operation did not finish before its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The peer closed the stream cleanly between frames.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Preamble mismatch or a malformed/oversized length field.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Decryption or integrity-tag verification failed.
    ///
    /// Never says which of the two checks failed.
    #[error("Authentication failed")]
    Authentication,

    /// A message could not be serialized or deserialized.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// An invalid combination of options was supplied.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The registry has been shut down and no longer answers.
    #[error("Registry is shut down")]
    RegistryShutdown,
}

/// Coarse classification of a [`WireError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Authentication,
    Encoding,
    Configuration,
    Shutdown,
}

impl WireError {
    /// Collapse the error into its taxonomy class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) | Self::Timeout(_) | Self::ConnectionClosed => ErrorKind::Transport,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Authentication => ErrorKind::Authentication,
            Self::Encoding(_) => ErrorKind::Encoding,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::RegistryShutdown => ErrorKind::Shutdown,
        }
    }

    /// Whether the stream that produced this error can still be used.
    ///
    /// Authentication and encoding failures happen after a whole frame was
    /// consumed, so the next frame boundary is still known. Transport and
    /// protocol failures leave the read position undefined.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Protocol)
    }
}

/// Alias for results in the nanolink crates.
pub type WireResult<T> = Result<T, WireError>;
