//! Typed control and mapping messages

use serde::{Deserialize, Serialize};

use crate::error::XferError;

/// Metadata of the head transfer item as reported to consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XferInfo {
    /// Producer-assigned byte position
    pub offset: i64,
    /// Payload size; 0 for an empty item
    pub size: u64,
    /// Frame identifier for debugging, 0 when no page is attached
    pub frame_id: u64,
}

impl XferInfo {
    /// Whether the item carries no page
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// The three queue control operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlOp {
    /// Current queue depth
    GetCount,
    /// Metadata of the head item
    GetInfo,
    /// Remove and drop the head item; a no-op on an empty queue
    ReleaseHead,
}

/// Replies to [`ControlOp`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlReply {
    Count(u64),
    Info(XferInfo),
    Released,
}

/// Where a remote consumer finds the mapped head page
///
/// The arena descriptor travels alongside the message; the consumer maps
/// one page at `file_offset` and reads `len` bytes from `data_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapGrant {
    pub frame_id: u64,
    pub file_offset: u64,
    pub data_offset: u64,
    /// Bytes visible to the consumer; 0 means nothing was mapped
    pub len: u64,
    /// Mapping generation, increases with every established mapping
    pub generation: u64,
}

impl MapGrant {
    /// Grant for an empty head item: success without a mapping
    pub fn empty() -> Self {
        Self {
            frame_id: 0,
            file_offset: 0,
            data_offset: 0,
            len: 0,
            generation: 0,
        }
    }

    /// Whether the grant maps nothing
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A request sent over a control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Control(ControlOp),
    /// Map the head item, `length` bytes at most one page
    MapHead { length: u64 },
    /// Drop this session's mapping
    Unmap,
    /// Copy up to `len` bytes of the head item starting at `pos`
    Read { pos: u64, len: u32 },
    /// Block until the queue is non-empty or the timeout expires
    WaitReadable { timeout_ms: u64 },
    Ping,
}

/// A response to a [`Request`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Control(ControlReply),
    Mapped(MapGrant),
    Unmapped { was_mapped: bool },
    Data(Vec<u8>),
    Readable(bool),
    Pong,
    Error(WireError),
}

/// Error as carried on the wire, one variant per [`XferError`] variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireError {
    PinFailure(String),
    AllocationFailure(String),
    CopyFailure { requested: u64, available: u64 },
    QueueFull { depth: u64 },
    NoItem,
    InvalidSize { requested: u64, max: u64 },
    MapFailure(String),
    InvalidParameter { parameter: String, message: String },
    Malformed(String),
    ChannelClosed(String),
    Io(String),
    Platform(String),
}

impl From<&XferError> for WireError {
    fn from(err: &XferError) -> Self {
        match err {
            XferError::PinFailure { message } => WireError::PinFailure(message.clone()),
            XferError::AllocationFailure { message } => {
                WireError::AllocationFailure(message.clone())
            }
            XferError::CopyFailure {
                requested,
                available,
            } => WireError::CopyFailure {
                requested: *requested as u64,
                available: *available as u64,
            },
            XferError::QueueFull { depth } => WireError::QueueFull {
                depth: *depth as u64,
            },
            XferError::NoItem => WireError::NoItem,
            XferError::InvalidSize { requested, max } => WireError::InvalidSize {
                requested: *requested as u64,
                max: *max as u64,
            },
            XferError::MapFailure { message } => WireError::MapFailure(message.clone()),
            XferError::InvalidParameter { parameter, message } => WireError::InvalidParameter {
                parameter: parameter.clone(),
                message: message.clone(),
            },
            XferError::Malformed { message } => WireError::Malformed(message.clone()),
            XferError::ChannelClosed { message } => WireError::ChannelClosed(message.clone()),
            XferError::Io { message, .. } => WireError::Io(message.clone()),
            XferError::Platform { message } => WireError::Platform(message.clone()),
        }
    }
}

impl From<WireError> for XferError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::PinFailure(message) => XferError::PinFailure { message },
            WireError::AllocationFailure(message) => XferError::AllocationFailure { message },
            WireError::CopyFailure {
                requested,
                available,
            } => XferError::copy_failure(requested as usize, available as usize),
            WireError::QueueFull { depth } => XferError::queue_full(depth as usize),
            WireError::NoItem => XferError::NoItem,
            WireError::InvalidSize { requested, max } => {
                XferError::invalid_size(requested as usize, max as usize)
            }
            WireError::MapFailure(message) => XferError::MapFailure { message },
            WireError::InvalidParameter { parameter, message } => {
                XferError::InvalidParameter { parameter, message }
            }
            WireError::Malformed(message) => XferError::Malformed { message },
            WireError::ChannelClosed(message) => XferError::ChannelClosed { message },
            WireError::Io(message) => XferError::Io {
                message,
                source: None,
            },
            WireError::Platform(message) => XferError::Platform { message },
        }
    }
}

impl Response {
    /// Build the error response for a failed request
    pub fn error(err: &XferError) -> Self {
        Response::Error(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn test_wire_error_preserves_class() {
        let cases = [
            XferError::NoItem,
            XferError::invalid_size(0, 4096),
            XferError::map_failure("remap"),
            XferError::queue_full(128),
            XferError::malformed("junk"),
        ];
        for err in cases {
            let class = err.class();
            let back: XferError = WireError::from(&err).into();
            assert_eq!(back.class(), class);
            assert_eq!(back.to_string(), err.to_string());
        }
    }

    #[test]
    fn test_empty_grant() {
        let grant = MapGrant::empty();
        assert!(grant.is_empty());
        assert_eq!(grant.frame_id, 0);
        assert_eq!(XferError::from(WireError::NoItem).class(), ErrorClass::Retryable);
    }
}
