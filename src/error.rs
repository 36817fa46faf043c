//! Error types for relayq operations.

use thiserror::Error;

/// Result type used throughout relayq.
pub type RelayResult<T> = Result<T, RelayError>;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for relayq operations.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Invalid construction arguments; never retried
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// Broker unreachable or channel setup failed while opening a client
    #[error("Connection error: {message}")]
    ConnectionError {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxedSource>,
    },

    /// Publish, consume, ack or nack failed on an established client
    #[error("Transport error: {message}")]
    TransportError {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxedSource>,
    },

    /// Task payload could not be serialized or deserialized
    #[error("Payload error: {0}")]
    PayloadError(#[from] serde_json::Error),

    /// The task's own logic reported a failure
    #[error("Task execution failed: {message}")]
    TaskExecutionFailed {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<BoxedSource>,
    },

    /// The client slot holds no client (never opened or already closed)
    #[error("Broker client is not available")]
    ClientUnavailable,

    /// The engine was closed and will not open new clients
    #[error("Engine is closed")]
    EngineClosed,

    /// `consume` was already invoked on this consumer
    #[error("Consumer is already consuming")]
    AlreadyConsuming,
}

impl RelayError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create a connection error wrapping its cause
    pub fn connection<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ConnectionError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection error without an underlying cause
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error wrapping its cause
    pub fn transport<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::TransportError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transport error without an underlying cause
    pub fn channel(message: impl Into<String>) -> Self {
        Self::TransportError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new task execution error
    pub fn task_execution<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::TaskExecutionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a task execution error from a plain message
    pub fn task_failed(message: impl Into<String>) -> Self {
        Self::TaskExecutionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Whether the outer retry loop can expect this error to clear up on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError { .. } | Self::TransportError { .. } | Self::ClientUnavailable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            RelayError::config("URL should be set").to_string(),
            "Configuration error: URL should be set"
        );
        assert_eq!(
            RelayError::unreachable("refused").to_string(),
            "Connection error: refused"
        );
        assert_eq!(
            RelayError::task_failed("boom").to_string(),
            "Task execution failed: boom"
        );
    }

    #[test]
    fn test_source_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = RelayError::transport("publish failed", io);
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("pipe closed"));
    }

    #[test]
    fn test_payload_error_from_serde() {
        let err: RelayError = serde_json::from_slice::<u32>(b"not json").unwrap_err().into();
        assert!(matches!(err, RelayError::PayloadError(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(RelayError::unreachable("down").is_recoverable());
        assert!(RelayError::channel("closed").is_recoverable());
        assert!(!RelayError::config("bad").is_recoverable());
        assert!(!RelayError::EngineClosed.is_recoverable());
    }
}
