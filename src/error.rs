//! Error types and handling for pagebridge

/// Result type alias for pagebridge operations
pub type Result<T> = std::result::Result<T, XferError>;

/// How a caller should react to a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Nothing is wrong with the request; retrying later may succeed
    Retryable,
    /// The request itself is invalid and will fail again unchanged
    CallerError,
    /// The transfer failed at the boundary; this request is lost
    Fatal,
}

/// Error types for the transfer subsystem
#[derive(Debug, thiserror::Error)]
pub enum XferError {
    /// The producer's memory could not be pinned for zero-copy transfer
    #[error("Pin failure: {message}")]
    PinFailure { message: String },

    /// No free page was available for a copy-mode transfer
    #[error("Allocation failure: {message}")]
    AllocationFailure { message: String },

    /// The source buffer could not be copied into a fresh page
    #[error("Copy failure: requested {requested} bytes, source holds {available}")]
    CopyFailure { requested: usize, available: usize },

    /// The queue already tracks its maximum number of items
    #[error("Queue full: {depth} items tracked")]
    QueueFull { depth: usize },

    /// The queue was empty when an item was expected
    #[error("No transfer item queued")]
    NoItem,

    /// A mapping length outside `1..=page_size` was requested
    #[error("Invalid mapping size: requested {requested}, maximum {max}")]
    InvalidSize { requested: usize, max: usize },

    /// The page could not be mapped into the consumer's address space
    #[error("Map failure: {message}")]
    MapFailure { message: String },

    /// Invalid parameters or configuration
    #[error("Invalid parameter: {parameter} - {message}")]
    InvalidParameter { parameter: String, message: String },

    /// A control request or frame could not be decoded
    #[error("Malformed request: {message}")]
    Malformed { message: String },

    /// The control channel is gone (peer closed, context torn down)
    #[error("Channel closed: {message}")]
    ChannelClosed { message: String },

    /// I/O related errors (sockets, mmap, eventfd)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Platform-specific errors
    #[error("Platform error: {message}")]
    Platform { message: String },
}

impl XferError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create a pin failure
    pub fn pin_failure(message: impl Into<String>) -> Self {
        Self::PinFailure {
            message: message.into(),
        }
    }

    /// Create an allocation failure
    pub fn allocation_failure(message: impl Into<String>) -> Self {
        Self::AllocationFailure {
            message: message.into(),
        }
    }

    /// Create a copy failure
    pub fn copy_failure(requested: usize, available: usize) -> Self {
        Self::CopyFailure {
            requested,
            available,
        }
    }

    /// Create a queue full error
    pub fn queue_full(depth: usize) -> Self {
        Self::QueueFull { depth }
    }

    /// Create an invalid mapping size error
    pub fn invalid_size(requested: usize, max: usize) -> Self {
        Self::InvalidSize { requested, max }
    }

    /// Create a map failure
    pub fn map_failure(message: impl Into<String>) -> Self {
        Self::MapFailure {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a malformed request error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Create a channel closed error
    pub fn channel_closed(message: impl Into<String>) -> Self {
        Self::ChannelClosed {
            message: message.into(),
        }
    }

    /// Create a platform error
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
        }
    }

    /// Classify the error for retry decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            XferError::NoItem
            | XferError::AllocationFailure { .. }
            | XferError::QueueFull { .. }
            | XferError::ChannelClosed { .. } => ErrorClass::Retryable,
            XferError::InvalidSize { .. }
            | XferError::InvalidParameter { .. }
            | XferError::Malformed { .. } => ErrorClass::CallerError,
            XferError::PinFailure { .. }
            | XferError::CopyFailure { .. }
            | XferError::MapFailure { .. }
            | XferError::Io { .. }
            | XferError::Platform { .. } => ErrorClass::Fatal,
        }
    }

    /// Whether retrying the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Whether the failure means the channel itself must be reopened
    pub fn is_disconnect(&self) -> bool {
        matches!(self, XferError::ChannelClosed { .. } | XferError::Io { .. })
    }
}

// Convert from common error types
impl From<std::io::Error> for XferError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset => Self::channel_closed(err.to_string()),
            _ => Self::from_io(err, "I/O operation failed"),
        }
    }
}

impl From<bincode::Error> for XferError {
    fn from(err: bincode::Error) -> Self {
        Self::malformed(format!("Bincode error: {}", err))
    }
}

impl From<nix::Error> for XferError {
    fn from(err: nix::Error) -> Self {
        Self::from_io(std::io::Error::from(err), "System call failed")
    }
}

impl From<XferError> for std::io::Error {
    fn from(err: XferError) -> Self {
        use std::io::ErrorKind;

        let kind = match &err {
            XferError::NoItem => ErrorKind::WouldBlock,
            XferError::InvalidSize { .. }
            | XferError::InvalidParameter { .. }
            | XferError::Malformed { .. } => ErrorKind::InvalidInput,
            XferError::AllocationFailure { .. } | XferError::QueueFull { .. } => {
                ErrorKind::OutOfMemory
            }
            XferError::ChannelClosed { .. } => ErrorKind::BrokenPipe,
            _ => ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}
