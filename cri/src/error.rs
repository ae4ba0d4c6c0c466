//! CRI-specific error conversions.

use a3s_critest_core::error::CriTestError;
use tonic::{Code, Status};

/// Convert a gRPC Status returned by the runtime into a CriTestError.
///
/// `method` is the CRI method name, e.g. `StartContainer`.
pub fn status_to_error(method: &str, status: Status) -> CriTestError {
    match status.code() {
        Code::InvalidArgument => {
            CriTestError::ConfigError(format!("{} rejected: {}", method, status.message()))
        }
        Code::DeadlineExceeded => {
            CriTestError::TimeoutError(format!("{}: {}", method, status.message()))
        }
        code => CriTestError::RuntimeCallError {
            method: method.to_string(),
            code,
            message: status.message().to_string(),
        },
    }
}

/// Build the caller-side deadline error for a method.
pub fn deadline_error(method: &str, limit: std::time::Duration) -> CriTestError {
    CriTestError::TimeoutError(format!("{} did not complete within {:?}", method, limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_invalid_argument_maps_to_config_error() {
        let err = status_to_error("CreateContainer", Status::invalid_argument("bad mount"));
        match err {
            CriTestError::ConfigError(msg) => {
                assert!(msg.contains("CreateContainer"));
                assert!(msg.contains("bad mount"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_deadline_exceeded_maps_to_timeout() {
        let err = status_to_error("ExecSync", Status::deadline_exceeded("too slow"));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_not_found_is_preserved() {
        let err = status_to_error("ContainerStatus", Status::not_found("no such container"));
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "Runtime call ContainerStatus failed (NotFound): no such container"
        );
    }

    #[test]
    fn test_internal_maps_to_runtime_call_error() {
        let err = status_to_error("StartContainer", Status::internal("boom"));
        match err {
            CriTestError::RuntimeCallError { method, code, .. } => {
                assert_eq!(method, "StartContainer");
                assert_eq!(code, Code::Internal);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_deadline_error_names_method() {
        let err = deadline_error("StopContainer", Duration::from_secs(3));
        assert!(err.is_timeout());
        assert!(err.to_string().contains("StopContainer"));
    }
}
