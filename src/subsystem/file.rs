//! File-like adapter over a context
//!
//! Writes become transfer items at the current position; reads copy from
//! the head item. This is the surface a namespace layer would hand out per
//! open file.

use std::io::{self, Read, Write};

use log::debug;

use super::context::XferContext;

/// An open transfer file with its own position
#[derive(Debug)]
pub struct XferFile<'ctx> {
    ctx: &'ctx XferContext,
    write_pos: i64,
    read_pos: u64,
}

impl<'ctx> XferFile<'ctx> {
    /// Open a transfer file at position 0
    pub fn open(ctx: &'ctx XferContext) -> Self {
        Self {
            ctx,
            write_pos: 0,
            read_pos: 0,
        }
    }

    /// Position the next write will be recorded at
    pub fn write_position(&self) -> i64 {
        self.write_pos
    }

    /// Position inside the head item the next read starts from
    pub fn read_position(&self) -> u64 {
        self.read_pos
    }

    /// Restart reading at the beginning of the head item
    pub fn rewind_read(&mut self) {
        self.read_pos = 0;
    }
}

impl Write for XferFile<'_> {
    /// Queue one transfer item; zero-length writes queue an empty item
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.ctx.enqueue_write(self.write_pos, buf, buf.len())?;
        debug!("wrote {} of {} bytes at {}", written, buf.len(), self.write_pos);
        self.write_pos += written as i64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for XferFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.ctx.read_head(self.read_pos, buf)?;
        self.read_pos += n as u64;
        Ok(n)
    }
}
