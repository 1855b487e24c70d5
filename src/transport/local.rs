//! In-process control channel

use std::time::Duration;

use crate::error::Result;
use crate::mapping::{MappedRegion, SessionId};
use crate::protocol::{ControlOp, ControlReply};
use crate::subsystem::XferContext;

use super::{ControlChannel, Connector};

/// Channel calling straight into a context; one session per channel
#[derive(Debug)]
pub struct LocalChannel<'ctx> {
    ctx: &'ctx XferContext,
    session: SessionId,
}

impl<'ctx> LocalChannel<'ctx> {
    pub fn open(ctx: &'ctx XferContext) -> Self {
        Self {
            session: ctx.open_session(),
            ctx,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }
}

impl ControlChannel for LocalChannel<'_> {
    fn control(&mut self, op: ControlOp) -> Result<ControlReply> {
        self.ctx.control(op)
    }

    fn map_head(&mut self, length: usize) -> Result<MappedRegion> {
        self.ctx.map_head(self.session, length)
    }

    fn unmap(&mut self) -> Result<bool> {
        Ok(self.ctx.unmap(self.session))
    }

    fn read_head(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.ctx.read_head(pos, buf)
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<bool> {
        Ok(self.ctx.wait_readable(timeout))
    }

    fn ping(&mut self) -> Result<()> {
        if self.ctx.is_torn_down() {
            return Err(crate::error::XferError::channel_closed(
                "Transfer subsystem has been torn down",
            ));
        }
        Ok(())
    }
}

impl Drop for LocalChannel<'_> {
    fn drop(&mut self) {
        self.ctx.close_session(self.session);
    }
}

/// Opens [`LocalChannel`]s on a borrowed context
#[derive(Debug, Clone, Copy)]
pub struct LocalConnector<'ctx> {
    ctx: &'ctx XferContext,
}

impl<'ctx> LocalConnector<'ctx> {
    pub fn new(ctx: &'ctx XferContext) -> Self {
        Self { ctx }
    }
}

impl<'ctx> Connector for LocalConnector<'ctx> {
    type Channel = LocalChannel<'ctx>;

    fn connect(&mut self) -> Result<Self::Channel> {
        Ok(LocalChannel::open(self.ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AcquireMode, ArenaConfig, PageAligned};
    use crate::subsystem::SubsystemConfig;

    fn context() -> XferContext {
        let config = SubsystemConfig::default()
            .with_acquire_mode(AcquireMode::Copy)
            .with_arena(ArenaConfig::new("local_test", 2));
        XferContext::init(config).unwrap()
    }

    #[test]
    fn test_dropping_channel_unpins_mapping() {
        let ctx = context();
        let staged = PageAligned::new(b"mapped");
        ctx.enqueue_write(0, staged.as_slice(), 6).unwrap();

        let mut channel = LocalConnector::new(&ctx).connect().unwrap();
        let region = channel.map_head(6).unwrap();
        assert_eq!(region.as_slice(), b"mapped");
        drop(region);
        assert_eq!(ctx.arena().ref_count(0), 2);

        drop(channel);
        assert_eq!(ctx.arena().ref_count(0), 1);
        assert!(ctx.active_mapping().is_none());
    }

    #[test]
    fn test_default_helpers() {
        let ctx = context();
        let mut channel = LocalChannel::open(&ctx);
        assert_eq!(channel.count().unwrap(), 0);
        assert!(channel.info().unwrap_err().is_retryable());
        channel.release_head().unwrap();
        channel.ping().unwrap();
    }
}
