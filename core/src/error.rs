use thiserror::Error;

/// CRI conformance harness error types
#[derive(Error, Debug)]
pub enum CriTestError {
    /// Pod or container specification rejected by the runtime, or an invalid
    /// harness configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// RPC-level failure reported verbatim by the runtime
    #[error("Runtime call {method} failed ({code:?}): {message}")]
    RuntimeCallError {
        method: String,
        code: tonic::Code,
        message: String,
    },

    /// A state was not reached, or a caller-side deadline elapsed
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// A log line matches neither supported format
    #[error("Malformed log at line {line}: {message}")]
    MalformedLogError { line: usize, message: String },

    /// Streaming URL could not be resolved
    #[error("Invalid streaming location: {0}")]
    InvalidLocationError(String),

    /// Sub-protocol negotiation failed
    #[error("Unsupported stream protocol: offered [{}], server selected {}", offered.join(", "), selected.as_deref().unwrap_or("none"))]
    UnsupportedProtocolError {
        offered: Vec<String>,
        selected: Option<String>,
    },

    /// Transport failure on an established stream, or a rejected upgrade
    #[error("Stream error: {0}")]
    StreamError(String),

    /// Failed to connect to a runtime endpoint
    #[error("Transport error: {0}")]
    TransportError(String),

    /// A conformance expectation did not hold
    #[error("Assertion failed: {0}")]
    AssertionError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl CriTestError {
    /// Whether this error is a deadline of any kind.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CriTestError::TimeoutError(_))
    }

    /// Whether the runtime reported the target as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CriTestError::RuntimeCallError {
                code: tonic::Code::NotFound,
                ..
            }
        )
    }
}

impl From<serde_json::Error> for CriTestError {
    fn from(err: serde_json::Error) -> Self {
        CriTestError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CriTestError {
    fn from(err: serde_yaml::Error) -> Self {
        CriTestError::SerializationError(err.to_string())
    }
}

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, CriTestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let error = CriTestError::ConfigError("Missing required field".to_string());
        assert_eq!(
            error.to_string(),
            "Configuration error: Missing required field"
        );
    }

    #[test]
    fn test_runtime_call_error_display() {
        let error = CriTestError::RuntimeCallError {
            method: "StartContainer".to_string(),
            code: tonic::Code::NotFound,
            message: "container not found".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Runtime call StartContainer failed (NotFound): container not found"
        );
        assert!(error.is_not_found());
    }

    #[test]
    fn test_timeout_error_display() {
        let error = CriTestError::TimeoutError("container abc never reached RUNNING".to_string());
        assert_eq!(
            error.to_string(),
            "Timeout: container abc never reached RUNNING"
        );
        assert!(error.is_timeout());
    }

    #[test]
    fn test_malformed_log_error_display() {
        let error = CriTestError::MalformedLogError {
            line: 3,
            message: "expected at least 3 fields".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Malformed log at line 3: expected at least 3 fields"
        );
    }

    #[test]
    fn test_unsupported_protocol_display() {
        let error = CriTestError::UnsupportedProtocolError {
            offered: vec!["v4.channel.k8s.io".to_string(), "channel.k8s.io".to_string()],
            selected: None,
        };
        assert_eq!(
            error.to_string(),
            "Unsupported stream protocol: offered [v4.channel.k8s.io, channel.k8s.io], server selected none"
        );
    }

    #[test]
    fn test_unsupported_protocol_display_with_selection() {
        let error = CriTestError::UnsupportedProtocolError {
            offered: vec!["v4.channel.k8s.io".to_string()],
            selected: Some("v5.channel.k8s.io".to_string()),
        };
        assert!(error.to_string().ends_with("server selected v5.channel.k8s.io"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CriTestError = io_error.into();
        assert!(matches!(err, CriTestError::IoError(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err: CriTestError = json_err.into();
        assert!(matches!(err, CriTestError::SerializationError(_)));
    }

    #[test]
    fn test_not_found_only_for_not_found_code() {
        let error = CriTestError::RuntimeCallError {
            method: "StopContainer".to_string(),
            code: tonic::Code::Internal,
            message: "boom".to_string(),
        };
        assert!(!error.is_not_found());
        assert!(!error.is_timeout());
    }
}
