//! Error types for Oakley

use std::fmt;

/// Unified error type for all Oakley operations
#[derive(Debug)]
pub enum OakleyError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error
    Protocol(String),

    /// Security error (authentication, authorization, etc.)
    Security(String),

    /// Not implemented
    NotImplemented(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for OakleyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OakleyError::Io(e) => write!(f, "IO error: {}", e),
            OakleyError::Config(msg) => write!(f, "Configuration error: {}", msg),
            OakleyError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            OakleyError::Security(msg) => write!(f, "Security error: {}", msg),
            OakleyError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            OakleyError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for OakleyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OakleyError::Io(e) => Some(e),
            OakleyError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for OakleyError {
    fn from(err: std::io::Error) -> Self {
        OakleyError::Io(err)
    }
}

/// Result type for Oakley operations
pub type OakleyResult<T> = Result<T, OakleyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OakleyError::Config("missing peer id".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing peer id");

        let err = OakleyError::Protocol("bad header".to_string());
        assert_eq!(err.to_string(), "Protocol error: bad header");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "socket closed");
        let err: OakleyError = io_err.into();
        match err {
            OakleyError::Io(e) => assert!(e.to_string().contains("socket closed")),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_error_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "inner");
        let err: OakleyError = io_err.into();
        assert!(std::error::Error::source(&err).is_some());

        let err = OakleyError::Security("auth failed".to_string());
        assert!(std::error::Error::source(&err).is_none());
    }
}
