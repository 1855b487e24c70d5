//! Control channel transports
//!
//! Consumers talk to a context through a [`ControlChannel`]. The in-process
//! [`LocalChannel`] calls the context directly; [`UnixChannel`] speaks the
//! framed protocol to a [`ControlServer`] and receives the arena descriptor
//! with every mapping grant. A [`Connector`] creates channels, so a consumer
//! can drop a broken one and open a fresh one.

pub mod local;
pub mod unix;

use std::time::Duration;

use crate::error::{Result, XferError};
use crate::mapping::MappedRegion;
use crate::protocol::{ControlOp, ControlReply, XferInfo};

pub use local::{LocalChannel, LocalConnector};
pub use unix::{ControlServer, ServerConfig, ServerHandle, ServerStats, UnixChannel, UnixConnector};

/// Request/response surface a consumer drives
pub trait ControlChannel {
    /// Execute one control operation
    fn control(&mut self, op: ControlOp) -> Result<ControlReply>;

    /// Map the head item, at most one page
    fn map_head(&mut self, length: usize) -> Result<MappedRegion>;

    /// Drop this channel's mapping; returns whether one was live
    fn unmap(&mut self) -> Result<bool>;

    /// Copy bytes of the head item starting at `pos`
    fn read_head(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize>;

    /// Block until the queue is non-empty or `timeout` passes
    fn wait_readable(&mut self, timeout: Duration) -> Result<bool>;

    /// Check that the other side still answers
    fn ping(&mut self) -> Result<()>;

    /// Current queue depth
    fn count(&mut self) -> Result<u64> {
        match self.control(ControlOp::GetCount)? {
            ControlReply::Count(count) => Ok(count),
            other => Err(unexpected_reply(ControlOp::GetCount, &other)),
        }
    }

    /// Metadata of the head item; `NoItem` when the queue is empty
    fn info(&mut self) -> Result<XferInfo> {
        match self.control(ControlOp::GetInfo)? {
            ControlReply::Info(info) => Ok(info),
            other => Err(unexpected_reply(ControlOp::GetInfo, &other)),
        }
    }

    /// Release the head item; succeeds on an empty queue
    fn release_head(&mut self) -> Result<()> {
        match self.control(ControlOp::ReleaseHead)? {
            ControlReply::Released => Ok(()),
            other => Err(unexpected_reply(ControlOp::ReleaseHead, &other)),
        }
    }
}

/// Opens control channels
pub trait Connector {
    type Channel: ControlChannel;

    fn connect(&mut self) -> Result<Self::Channel>;
}

fn unexpected_reply(op: ControlOp, reply: &ControlReply) -> XferError {
    XferError::malformed(format!("Unexpected reply {:?} to {:?}", reply, op))
}
