//! Error types for the server
//! Provides structured error handling using thiserror for better error reporting

use thiserror::Error;

/// Main error type for the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// A RESP frame could not be decoded from the wire bytes.
    #[error("Malformed frame: {message}")]
    Frame { message: String },

    /// The buffer ends before the current frame is complete. The
    /// connection loop reacts by reading more bytes, not by failing.
    #[error("Truncated frame, need more bytes")]
    Truncated,

    /// Command verb not recognised by the dispatcher.
    #[error("Unknown command: {verb}")]
    UnknownCommand { verb: String },

    /// Command arguments missing or unusable.
    #[error("Bad arguments for {verb}: {message}")]
    BadArguments { verb: String, message: String },

    /// Replication handshake or wire protocol violation.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Configuration related errors.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The snapshot file is structurally invalid.
    #[error("Snapshot corrupt: {message}")]
    Snapshot { message: String },

    /// The snapshot uses the 64-bit integer string encoding.
    #[error("Snapshot uses unsupported i64 string encoding")]
    I64NotSupported,

    /// Network/IO related errors.
    #[error("Network IO error")]
    Io(#[from] std::io::Error),

    /// String conversion errors.
    #[error("String conversion error")]
    StringConversion(#[from] std::string::FromUtf8Error),

    /// Task execution errors for async operations.
    #[error("Task execution error")]
    TaskExecution(#[from] tokio::task::JoinError),
}

/// Result type alias for convenience
pub type ServerResult<T> = std::result::Result<T, ServerError>;

impl ServerError {
    /// Create a malformed-frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a snapshot corruption error
    pub fn snapshot<S: Into<String>>(message: S) -> Self {
        Self::Snapshot {
            message: message.into(),
        }
    }

    /// Create a bad-arguments error
    pub fn bad_arguments<V: Into<String>, S: Into<String>>(verb: V, message: S) -> Self {
        Self::BadArguments {
            verb: verb.into(),
            message: message.into(),
        }
    }
}
