//! Error handling for the room relay and transfer core

use std::fmt;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, DropError>;

/// Relay error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropError {
    /// A non-terminal session already exists for the same sender, receiver and file
    Conflict(String),
    /// Unknown or expired session or connection
    NotFound(String),
    /// Operation invalid for the session's current state
    StaleState(String),
    /// Chunk offset/size invariant violated
    Corruption(String),
    /// File exceeds the configured maximum
    SizeLimit(String),
    /// Target connection unreachable at send time
    RelayDelivery(String),
    /// Network-related errors
    Network(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// Protocol errors
    Protocol(String),
    /// Connection errors
    Connection(String),
    /// Configuration error
    Config(String),
    /// Timeout error
    Timeout(String),
    /// Server internal error
    Internal(String),
}

impl DropError {
    /// Get error code for this error type
    pub fn code(&self) -> u32 {
        match self {
            DropError::Conflict(_) => 2000,
            DropError::NotFound(_) => 2001,
            DropError::StaleState(_) => 2002,
            DropError::Corruption(_) => 2003,
            DropError::SizeLimit(_) => 2004,
            DropError::RelayDelivery(_) => 2005,
            DropError::Network(_) => 1000,
            DropError::Serialization(_) => 1001,
            DropError::Protocol(_) => 1003,
            DropError::Connection(_) => 1004,
            DropError::Config(_) => 1010,
            DropError::Timeout(_) => 1011,
            DropError::Internal(_) => 1009,
        }
    }

    /// Get human-readable error message
    pub fn message(&self) -> &str {
        match self {
            DropError::Conflict(msg) => msg,
            DropError::NotFound(msg) => msg,
            DropError::StaleState(msg) => msg,
            DropError::Corruption(msg) => msg,
            DropError::SizeLimit(msg) => msg,
            DropError::RelayDelivery(msg) => msg,
            DropError::Network(msg) => msg,
            DropError::Serialization(msg) => msg,
            DropError::Protocol(msg) => msg,
            DropError::Connection(msg) => msg,
            DropError::Config(msg) => msg,
            DropError::Timeout(msg) => msg,
            DropError::Internal(msg) => msg,
        }
    }

    /// Benign races that are logged and dropped rather than reported
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            DropError::Conflict(_)
                | DropError::NotFound(_)
                | DropError::StaleState(_)
                | DropError::RelayDelivery(_)
        )
    }

    /// Create a conflict error
    pub fn conflict<T: Into<String>>(msg: T) -> Self {
        DropError::Conflict(msg.into())
    }

    /// Create a not found error
    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        DropError::NotFound(msg.into())
    }

    /// Create a stale state error
    pub fn stale_state<T: Into<String>>(msg: T) -> Self {
        DropError::StaleState(msg.into())
    }

    /// Create a corruption error
    pub fn corruption<T: Into<String>>(msg: T) -> Self {
        DropError::Corruption(msg.into())
    }

    /// Create a size limit error
    pub fn size_limit<T: Into<String>>(msg: T) -> Self {
        DropError::SizeLimit(msg.into())
    }

    /// Create a relay delivery error
    pub fn relay_delivery<T: Into<String>>(msg: T) -> Self {
        DropError::RelayDelivery(msg.into())
    }

    /// Create a network error
    pub fn network<T: Into<String>>(msg: T) -> Self {
        DropError::Network(msg.into())
    }

    /// Create a serialization error
    pub fn serialization<T: Into<String>>(msg: T) -> Self {
        DropError::Serialization(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        DropError::Protocol(msg.into())
    }

    /// Create a connection error
    pub fn connection<T: Into<String>>(msg: T) -> Self {
        DropError::Connection(msg.into())
    }

    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        DropError::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        DropError::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        DropError::Internal(msg.into())
    }
}

impl fmt::Display for DropError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            DropError::NotFound(msg) => write!(f, "Not found: {}", msg),
            DropError::StaleState(msg) => write!(f, "Stale state: {}", msg),
            DropError::Corruption(msg) => write!(f, "Corruption: {}", msg),
            DropError::SizeLimit(msg) => write!(f, "Size limit exceeded: {}", msg),
            DropError::RelayDelivery(msg) => write!(f, "Relay delivery failed: {}", msg),
            DropError::Network(msg) => write!(f, "Network error: {}", msg),
            DropError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            DropError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            DropError::Connection(msg) => write!(f, "Connection error: {}", msg),
            DropError::Config(msg) => write!(f, "Configuration error: {}", msg),
            DropError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            DropError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for DropError {}

impl From<std::io::Error> for DropError {
    fn from(err: std::io::Error) -> Self {
        DropError::Network(format!("IO error: {}", err))
    }
}

impl From<quinn::ConnectError> for DropError {
    fn from(err: quinn::ConnectError) -> Self {
        DropError::Connection(format!("QUIC connection error: {}", err))
    }
}

impl From<quinn::ConnectionError> for DropError {
    fn from(err: quinn::ConnectionError) -> Self {
        DropError::Connection(format!("QUIC connection error: {}", err))
    }
}

impl From<quinn::ReadError> for DropError {
    fn from(err: quinn::ReadError) -> Self {
        DropError::Network(format!("QUIC read error: {}", err))
    }
}

impl From<quinn::WriteError> for DropError {
    fn from(err: quinn::WriteError) -> Self {
        DropError::Network(format!("QUIC write error: {}", err))
    }
}

impl From<quinn::ClosedStream> for DropError {
    fn from(err: quinn::ClosedStream) -> Self {
        DropError::Connection(format!("Stream closed: {}", err))
    }
}

impl From<serde_json::Error> for DropError {
    fn from(err: serde_json::Error) -> Self {
        DropError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<anyhow::Error> for DropError {
    fn from(err: anyhow::Error) -> Self {
        DropError::Internal(err.to_string())
    }
}
