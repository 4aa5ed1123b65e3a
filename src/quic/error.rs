//! Errors surfaced by the multiplexed transport.

use std::io;

use thiserror::Error;

/// Status codes reported by the native transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportStatus {
    Aborted,
    AddressInUse,
    AlpnNegotiationFailure,
    ConnectionIdle,
    ConnectionRefused,
    InternalError,
    InvalidState,
    StreamLimitReached,
}

impl std::fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportStatus::Aborted => "aborted",
            TransportStatus::AddressInUse => "address in use",
            TransportStatus::AlpnNegotiationFailure => "no common application protocol",
            TransportStatus::ConnectionIdle => "connection idle",
            TransportStatus::ConnectionRefused => "connection refused",
            TransportStatus::InternalError => "internal error",
            TransportStatus::InvalidState => "invalid state",
            TransportStatus::StreamLimitReached => "stream limit reached",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QuicError {
    /// The operation was aborted because the local side closed the object.
    #[error("operation aborted")]
    OperationAborted,

    #[error("operation canceled")]
    OperationCanceled,

    #[error("connection aborted by peer with error code {error_code}")]
    ConnectionAborted { error_code: u64 },

    /// `error_code` is `None` when the abort was initiated locally.
    #[error("stream aborted{}", .error_code.map(|c| format!(" with error code {c}")).unwrap_or_default())]
    StreamAborted { error_code: Option<u64> },

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection timed out while idle")]
    ConnectionIdle,

    #[error("transport error: {0}")]
    Transport(TransportStatus),

    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    #[error("address already in use")]
    AddressInUse,
}

impl QuicError {
    /// Map a native status to the error an operation reports.
    pub fn from_status(status: TransportStatus) -> Self {
        match status {
            TransportStatus::Aborted => QuicError::OperationAborted,
            TransportStatus::AddressInUse => QuicError::AddressInUse,
            TransportStatus::ConnectionIdle => QuicError::ConnectionIdle,
            TransportStatus::ConnectionRefused => QuicError::ConnectionRefused,
            other => QuicError::Transport(other),
        }
    }
}

impl From<TransportStatus> for QuicError {
    fn from(status: TransportStatus) -> Self {
        QuicError::from_status(status)
    }
}

impl From<QuicError> for io::Error {
    fn from(e: QuicError) -> Self {
        let kind = match e {
            QuicError::OperationAborted => io::ErrorKind::ConnectionAborted,
            QuicError::ConnectionAborted { .. } | QuicError::StreamAborted { .. } => {
                io::ErrorKind::ConnectionReset
            }
            QuicError::ConnectionRefused => io::ErrorKind::ConnectionRefused,
            QuicError::ConnectionIdle => io::ErrorKind::TimedOut,
            QuicError::InvalidOperation(_) => io::ErrorKind::InvalidInput,
            QuicError::AddressInUse => io::ErrorKind::AddrInUse,
            QuicError::OperationCanceled | QuicError::Transport(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_abort_message_names_the_code() {
        assert_eq!(
            QuicError::StreamAborted { error_code: Some(7) }.to_string(),
            "stream aborted with error code 7"
        );
        assert_eq!(
            QuicError::StreamAborted { error_code: None }.to_string(),
            "stream aborted"
        );
    }

    #[test]
    fn statuses_map_to_specific_errors() {
        assert_eq!(
            QuicError::from(TransportStatus::ConnectionRefused),
            QuicError::ConnectionRefused
        );
        assert_eq!(
            QuicError::from(TransportStatus::StreamLimitReached),
            QuicError::Transport(TransportStatus::StreamLimitReached)
        );
    }

    #[test]
    fn io_conversion_keeps_the_source() {
        let err: io::Error = QuicError::ConnectionAborted { error_code: 3 }.into();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        let inner = err.get_ref().and_then(|e| e.downcast_ref::<QuicError>());
        assert_eq!(inner, Some(&QuicError::ConnectionAborted { error_code: 3 }));
    }
}
