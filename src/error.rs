//! Error types and handling for the flipq library

use thiserror::Error;

/// Result type alias for queue operations
pub type Result<T> = std::result::Result<T, FlipqError>;

/// Main error type for the flipq library
///
/// Every core operation returns one of these by value; the kinds surface
/// across the transport boundary verbatim as their wire codes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlipqError {
    /// Bad enum value, bad size, or a null where one is forbidden
    #[error("Invalid arguments: {message}")]
    InvalidArguments {
        /// What was out of range or missing
        message: String,
    },

    /// Queue status is dead: the consumer went away
    #[error("No consumer attached")]
    NoConsumer,

    /// Timed out, or non-blocking mode and nothing available
    #[error("No buffer available")]
    NoBuffer,

    /// The dirty head exists but its present timestamp is in the future
    #[error("No buffer ready yet")]
    NoBufferReady,

    /// Flush or request arrived before any consumer listener was bound
    #[error("Consumer listener is not registered")]
    ConsumerUnregisteredListener,

    /// A second producer tried to connect
    #[error("Another producer is already connected (pid {pid})")]
    ConsumerIsConnected {
        /// Pid that currently owns the connection
        pid: i32,
    },

    /// Strict-disconnect mode is active
    #[error("Producer is strictly disconnected")]
    ConsumerDisconnected,

    /// Operation attempted in the wrong slot state
    #[error("Invalid buffer state: {message}")]
    BufferStateInvalid {
        /// Which state check failed
        message: String,
    },

    /// Sequence number unknown to the cache
    #[error("Buffer {sequence} is not in the cache")]
    BufferNotInCache {
        /// The offending sequence
        sequence: u32,
    },

    /// Attach on a sequence that is already cached
    #[error("Buffer {sequence} is already in the cache")]
    BufferIsInCache {
        /// The offending sequence
        sequence: u32,
    },

    /// Attach would exceed the queue size
    #[error("Buffer queue is full")]
    BufferQueueFull,

    /// User data or attach would exceed a bounded size
    #[error("Out of range: {message}")]
    OutOfRange {
        /// Which bound was exceeded
        message: String,
    },

    /// Operation rejected, e.g. last-flushed access on a protected buffer
    #[error("Operation not supported: {message}")]
    NotSupport {
        /// Why the operation is refused
        message: String,
    },

    /// Internal invariant failure
    #[error("Unexpected error: {message}")]
    Unknown {
        /// Description of the broken invariant
        message: String,
    },
}

impl FlipqError {
    /// Create a new invalid-arguments error
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::InvalidArguments { message: message.into() }
    }

    /// Create a new invalid-state error
    pub fn bad_state(message: impl Into<String>) -> Self {
        Self::BufferStateInvalid { message: message.into() }
    }

    /// Create a new out-of-range error
    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::OutOfRange { message: message.into() }
    }

    /// Create a new not-supported error
    pub fn not_support(message: impl Into<String>) -> Self {
        Self::NotSupport { message: message.into() }
    }

    /// Create a new internal error
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown { message: message.into() }
    }

    /// Check if this error is recoverable by retrying later
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NoBuffer | Self::NoBufferReady | Self::BufferQueueFull)
    }

    /// Check if this error indicates the consumer side is gone
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::NoConsumer |
                Self::ConsumerDisconnected |
                Self::ConsumerIsConnected { .. } |
                Self::ConsumerUnregisteredListener
        )
    }

    /// Stable wire code for the transport reply header
    pub fn wire_code(&self) -> i32 {
        match self {
            Self::InvalidArguments { .. } => 1,
            Self::NoConsumer => 2,
            Self::NoBuffer => 3,
            Self::NoBufferReady => 4,
            Self::ConsumerUnregisteredListener => 5,
            Self::ConsumerIsConnected { .. } => 6,
            Self::ConsumerDisconnected => 7,
            Self::BufferStateInvalid { .. } => 8,
            Self::BufferNotInCache { .. } => 9,
            Self::BufferIsInCache { .. } => 10,
            Self::BufferQueueFull => 11,
            Self::OutOfRange { .. } => 12,
            Self::NotSupport { .. } => 13,
            Self::Unknown { .. } => 14,
        }
    }

    /// Rebuild an error from its wire code; payload details do not travel
    pub fn from_wire_code(code: i32) -> Option<Self> {
        let err = match code {
            0 => return None,
            1 => Self::invalid_args("remote"),
            2 => Self::NoConsumer,
            3 => Self::NoBuffer,
            4 => Self::NoBufferReady,
            5 => Self::ConsumerUnregisteredListener,
            6 => Self::ConsumerIsConnected { pid: 0 },
            7 => Self::ConsumerDisconnected,
            8 => Self::bad_state("remote"),
            9 => Self::BufferNotInCache { sequence: 0 },
            10 => Self::BufferIsInCache { sequence: 0 },
            11 => Self::BufferQueueFull,
            12 => Self::out_of_range("remote"),
            13 => Self::not_support("remote"),
            _ => Self::unknown(format!("wire code {code}")),
        };
        Some(err)
    }
}

/// Convenience macro for creating invalid-arguments errors
#[macro_export]
macro_rules! invalid_args {
    ($($arg:tt)*) => {
        $crate::error::FlipqError::invalid_args(format!($($arg)*))
    };
}

/// Convenience macro for creating invalid-state errors
#[macro_export]
macro_rules! bad_state {
    ($($arg:tt)*) => {
        $crate::error::FlipqError::bad_state(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(FlipqError::NoBuffer.is_recoverable());
        assert!(!FlipqError::NoConsumer.is_recoverable());
        assert!(FlipqError::NoConsumer.is_connection_error());
        assert!(!FlipqError::BufferQueueFull.is_connection_error());
    }

    #[test]
    fn test_wire_round_trip() {
        let kinds = [
            FlipqError::NoConsumer,
            FlipqError::NoBuffer,
            FlipqError::NoBufferReady,
            FlipqError::ConsumerUnregisteredListener,
            FlipqError::ConsumerDisconnected,
            FlipqError::BufferQueueFull,
        ];
        for err in kinds {
            let back = FlipqError::from_wire_code(err.wire_code()).unwrap();
            assert_eq!(back.wire_code(), err.wire_code());
        }
        assert!(FlipqError::from_wire_code(0).is_none());
    }

    #[test]
    fn test_error_macros() {
        let err = invalid_args!("transform {} out of range", 99);
        assert!(matches!(err, FlipqError::InvalidArguments { .. }));
    }
}
