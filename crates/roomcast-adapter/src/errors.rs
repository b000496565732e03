use roomcast_core::ProtocolError;

/// Failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The adapter was shut down before the request could be answered.
    #[error("adapter shut down")]
    Shutdown,
}

impl AdapterError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::Shutdown => "shutdown",
        }
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_converts() {
        let err: AdapterError = TransportError::Closed.into();
        assert!(matches!(err, AdapterError::Transport(TransportError::Closed)));
        assert_eq!(err.error_kind(), "transport");
        assert_eq!(err.to_string(), "transport closed");
    }

    #[test]
    fn shutdown_is_its_own_kind() {
        assert_eq!(AdapterError::Shutdown.error_kind(), "shutdown");
        assert_eq!(AdapterError::Shutdown.to_string(), "adapter shut down");
    }
}
