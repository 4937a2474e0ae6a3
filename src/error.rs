//! Error types for keyrelay.

use thiserror::Error;

use crate::channel::CloseReason;
use crate::identity::PublicIdentity;
use crate::protocol::ProtocolError;

/// Exit codes for the keyrelay binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Normal exit
    Success = 0,
    /// Generic failure
    Failure = 1,
    /// Listen failed
    ListenFailed = 10,
    /// QUIC connection failed
    QuicConnectionFailed = 11,
    /// TLS verification failed
    TlsVerificationFailed = 12,
    /// Invalid configuration
    Config = 13,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

/// Failures of the matching and tunneling engine.
///
/// Each one is fatal to the channel it concerns and to nothing else.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("no listener registered for {0}")]
    NoSuchListener(PublicIdentity),

    #[error("no pending connection to accept for {0}")]
    NothingToAccept(PublicIdentity),

    #[error("{0} is already listening")]
    AlreadyListening(PublicIdentity),

    #[error("liveness timeout")]
    LivenessTimeout,

    #[error("channel closed")]
    ChannelClosed,
}

impl RelayError {
    /// The close reason reported to the peer whose channel this error ends.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            RelayError::ProtocolViolation(_) => CloseReason::ProtocolViolation,
            RelayError::NoSuchListener(_) => CloseReason::Unreachable,
            RelayError::NothingToAccept(_) => CloseReason::NothingToAccept,
            RelayError::AlreadyListening(_) => CloseReason::AlreadyListening,
            RelayError::LivenessTimeout => CloseReason::Timeout,
            RelayError::ChannelClosed => CloseReason::PeerClosed,
        }
    }
}

impl From<ProtocolError> for RelayError {
    fn from(e: ProtocolError) -> Self {
        RelayError::ProtocolViolation(e.to_string())
    }
}

/// Main error type for keyrelay.
#[derive(Debug, Error)]
pub enum Error {
    #[error("listen failed: {0}")]
    ListenFailed(String),

    #[error("QUIC connection failed: {0}")]
    QuicConnectionFailed(String),

    #[error("TLS verification failed: {0}")]
    TlsVerificationFailed(String),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the exit code for this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::ListenFailed(_) => ExitCode::ListenFailed,
            Error::QuicConnectionFailed(_) => ExitCode::QuicConnectionFailed,
            Error::TlsVerificationFailed(_) => ExitCode::TlsVerificationFailed,
            Error::Relay(_) => ExitCode::Failure,
            Error::Io(_) => ExitCode::Failure,
            Error::Config(_) => ExitCode::Config,
        }
    }
}

/// Result type alias for keyrelay operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_errors_map_to_distinct_close_reasons() {
        let id = PublicIdentity::from([1u8; 32]);
        assert_eq!(RelayError::NoSuchListener(id).close_reason(), CloseReason::Unreachable);
        assert_eq!(
            RelayError::NothingToAccept(id).close_reason(),
            CloseReason::NothingToAccept
        );
        assert_eq!(
            RelayError::AlreadyListening(id).close_reason(),
            CloseReason::AlreadyListening
        );
        assert_eq!(RelayError::LivenessTimeout.close_reason(), CloseReason::Timeout);
    }

    #[test]
    fn test_protocol_error_becomes_violation() {
        let err: RelayError = ProtocolError::EmptyMessage.into();
        assert!(matches!(err, RelayError::ProtocolViolation(_)));
        assert!(err.to_string().contains("empty message"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(i32::from(Error::Config("bad".into()).exit_code()), 13);
        assert_eq!(
            Error::ListenFailed("in use".into()).exit_code(),
            ExitCode::ListenFailed
        );
        assert_eq!(
            Error::Relay(RelayError::ChannelClosed).exit_code(),
            ExitCode::Failure
        );
    }
}
