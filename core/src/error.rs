use std::any::Any;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid task state: {0}")]
    InvalidState(String),
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("task already downloading: {0}")]
    Duplicate(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("transfer error: {0}")]
    Transfer(String),
    #[error("probe failed: {0}")]
    Probe(String),
    #[error("segment {index} failed with HTTP status {status}")]
    Segment { index: u32, status: u16 },
    #[error("mux error: {0}")]
    Mux(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("download canceled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Network-class failures (unreachable host, refused connection, timeout)
    /// are worth another attempt; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Network(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }

    /// Turns a caught panic payload into a terminal error.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        CoreError::Internal(format!("panicked: {}", message))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_are_retryable() {
        assert!(CoreError::Network("timed out".to_string()).is_retryable());
        assert!(!CoreError::Transfer("HTTP 404".to_string()).is_retryable());
        assert!(!CoreError::Segment { index: 2, status: 500 }.is_retryable());
        assert!(!CoreError::Mux("no video track".to_string()).is_retryable());
        assert!(!CoreError::Io("disk full".to_string()).is_retryable());
        assert!(!CoreError::Cancelled.is_retryable());
        assert!(!CoreError::Internal("panicked".to_string()).is_retryable());
    }

    #[test]
    fn panic_payloads_become_internal_errors() {
        let payload = std::panic::catch_unwind(|| panic!("index {} out of range", 4)).unwrap_err();
        let err = CoreError::from_panic(payload.as_ref());
        assert_eq!(err.to_string(), "internal error: panicked: index 4 out of range");

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(7u8)).unwrap_err();
        assert!(matches!(CoreError::from_panic(payload.as_ref()), CoreError::Internal(_)));
    }

    #[test]
    fn segment_error_carries_status() {
        let err = CoreError::Segment { index: 3, status: 403 };
        assert_eq!(err.to_string(), "segment 3 failed with HTTP status 403");
    }
}
