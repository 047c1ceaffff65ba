//! Error handling for the collector service

use thiserror::Error;

/// Collector service error type
#[derive(Error, Debug, Clone)]
pub enum CollectorError {
    /// Configuration source or service configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Field protocol errors (bad frame, exception response, unexpected function code)
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Connection establishment and maintenance errors (includes not connected)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Operation timeout errors
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Shared store errors
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Data handling errors (decoding, conversion, serialization)
    #[error("Data error: {0}")]
    DataError(String),

    /// Message bus errors
    #[error("Bus error: {0}")]
    BusError(String),
}

/// Result type alias for the collector service
pub type Result<T> = std::result::Result<T, CollectorError>;

impl CollectorError {
    pub fn config(msg: impl Into<String>) -> Self {
        CollectorError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        CollectorError::IoError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        CollectorError::ProtocolError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        CollectorError::ConnectionError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        CollectorError::TimeoutError(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        CollectorError::StorageError(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        CollectorError::DataError(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        CollectorError::BusError(msg.into())
    }

    /// The physical link is unusable and must be re-established
    pub fn is_link_error(&self) -> bool {
        matches!(
            self,
            CollectorError::ConnectionError(_)
                | CollectorError::TimeoutError(_)
                | CollectorError::IoError(_)
        )
    }

    /// Error scoped to a single request; the link stays usable
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            CollectorError::ProtocolError(_) | CollectorError::DataError(_)
        )
    }
}

impl From<std::io::Error> for CollectorError {
    fn from(err: std::io::Error) -> Self {
        CollectorError::IoError(err.to_string())
    }
}

impl From<sqlx::Error> for CollectorError {
    fn from(err: sqlx::Error) -> Self {
        CollectorError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for CollectorError {
    fn from(err: serde_json::Error) -> Self {
        CollectorError::DataError(format!("JSON: {}", err))
    }
}

impl From<serde_yaml::Error> for CollectorError {
    fn from(err: serde_yaml::Error) -> Self {
        CollectorError::ConfigError(format!("YAML: {}", err))
    }
}

impl From<figment::Error> for CollectorError {
    fn from(err: figment::Error) -> Self {
        CollectorError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(CollectorError::timeout("read").is_link_error());
        assert!(CollectorError::io("reset").is_link_error());
        assert!(!CollectorError::protocol("exception 0x02").is_link_error());
        assert!(CollectorError::protocol("exception 0x02").is_protocol_error());
        assert!(!CollectorError::storage("locked").is_protocol_error());
    }

    #[test]
    fn test_io_conversion_keeps_message() {
        let err: CollectorError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset").into();
        assert!(matches!(err, CollectorError::IoError(ref m) if m.contains("peer reset")));
    }
}
