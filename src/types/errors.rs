//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Every
//! variant maps to a gRPC-style [`Code`], which is what the retry policy
//! classifies on and what crosses the wire inside an `Error` frame.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Status codes, named and serialized like their gRPC counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    ResourceExhausted,
    FailedPrecondition,
    Unimplemented,
    Internal,
    Unavailable,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol-level framing failures. Always terminal for the affected stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Message exceeds the configured send or receive limit.
    #[error("message too large: {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },

    /// Frame header or payload does not follow the wire format.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Input ended in the middle of a frame.
    #[error("truncated frame: {buffered} bytes buffered at end of input")]
    Truncated { buffered: usize },
}

/// Main error enum for the RPC core.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection could not be established.
    #[error("dial {address} failed: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Wire framing failure.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Keepalive- or transport-detected connection death.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Stream limit reached on a connection.
    #[error("capacity exceeded: {limit} concurrent streams")]
    CapacityExceeded { limit: usize },

    /// Caller-specified time budget elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Application-level failure returned by a handler.
    #[error("{code}: {message}")]
    Status { code: Code, message: String },

    /// Call abandoned by the peer or by shutdown.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Invalid configuration or arguments.
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Status code used for retry classification and on the wire.
    pub fn code(&self) -> Code {
        match self {
            Error::Dial { .. } | Error::ConnectionLost(_) | Error::Io(_) => Code::Unavailable,
            Error::Frame(FrameError::TooLarge { .. }) => Code::ResourceExhausted,
            Error::Frame(_) => Code::Internal,
            Error::CapacityExceeded { .. } => Code::ResourceExhausted,
            Error::DeadlineExceeded => Code::DeadlineExceeded,
            Error::Status { code, .. } => *code,
            Error::Cancelled(_) => Code::Cancelled,
            Error::Validation(_) => Code::InvalidArgument,
            Error::Serialization(_) => Code::Internal,
        }
    }

    /// Failures that no retry policy may recover.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Frame(_) | Error::DeadlineExceeded | Error::Cancelled(_)
        )
    }

    pub(crate) fn to_wire(&self) -> WireError {
        match self {
            Error::Frame(FrameError::TooLarge { size, limit }) => WireError::TooLarge {
                size: *size,
                limit: *limit,
            },
            Error::Frame(e) => WireError::Malformed {
                message: e.to_string(),
            },
            Error::CapacityExceeded { limit } => WireError::CapacityExceeded { limit: *limit },
            Error::DeadlineExceeded => WireError::DeadlineExceeded,
            Error::Status { code, message } => WireError::Status {
                code: *code,
                message: message.clone(),
            },
            Error::Cancelled(msg) => WireError::Status {
                code: Code::Cancelled,
                message: msg.clone(),
            },
            other => WireError::Status {
                code: other.code(),
                message: other.to_string(),
            },
        }
    }
}

/// Failure as carried by an `Error` frame. Tagged so the class survives the trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum WireError {
    Status { code: Code, message: String },
    CapacityExceeded { limit: usize },
    DeadlineExceeded,
    TooLarge { size: usize, limit: usize },
    Malformed { message: String },
}

impl From<WireError> for Error {
    fn from(wire: WireError) -> Self {
        match wire {
            WireError::Status { code, message } => Error::Status { code, message },
            WireError::CapacityExceeded { limit } => Error::CapacityExceeded { limit },
            WireError::DeadlineExceeded => Error::DeadlineExceeded,
            WireError::TooLarge { size, limit } => FrameError::TooLarge { size, limit }.into(),
            WireError::Malformed { message } => FrameError::Malformed(message).into(),
        }
    }
}

// Convenience constructors
impl Error {
    pub fn status(code: Code, msg: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: msg.into(),
        }
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::status(Code::Unavailable, msg)
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::status(Code::InvalidArgument, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::status(Code::NotFound, msg)
    }

    pub fn unimplemented(msg: impl Into<String>) -> Self {
        Self::status(Code::Unimplemented, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::status(Code::Internal, msg)
    }

    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
