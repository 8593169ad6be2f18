//! Anonymous-pipe channel, for make versions that predate `fifo:` auth.
//!
//! Both fds are made inheritable and advertised by number. Participants hold
//! the inherited write end, so a blocked reader only sees end-of-stream once
//! every process holding that end has exited.

use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};

use crate::error::{PoolError, Result};
use crate::fd;

pub struct PipeChannel {
    reader: File,
    writer: File,
    /// Private non-blocking view of `reader` for draining, when available.
    drain_reader: Option<File>,
}

impl PipeChannel {
    pub fn create() -> Result<Self> {
        let (read_fd, write_fd) = nix::unistd::pipe()
            .map_err(|e| PoolError::ChannelCreateFailed(format!("pipe: {e}")))?;

        fd::set_inheritable(&read_fd)
            .and_then(|()| fd::set_inheritable(&write_fd))
            .map_err(|e| PoolError::ChannelCreateFailed(format!("fcntl: {e}")))?;

        let reader = File::from(read_fd);
        let writer = File::from(write_fd);
        let drain_reader = fd::reopen_nonblocking(&reader).ok();

        tracing::debug!(
            read_fd = reader.as_raw_fd(),
            write_fd = writer.as_raw_fd(),
            "Created pipe channel"
        );

        Ok(Self {
            reader,
            writer,
            drain_reader,
        })
    }

    pub fn fds(&self) -> (RawFd, RawFd) {
        (self.reader.as_raw_fd(), self.writer.as_raw_fd())
    }

    /// Reader for draining, and whether it is non-blocking.
    pub(crate) fn reader(&self) -> (&File, bool) {
        match &self.drain_reader {
            Some(file) => (file, true),
            None => (&self.reader, false),
        }
    }

    pub(crate) fn writer(&self) -> &File {
        &self.writer
    }
}

/// Participant connection to an inherited pipe channel.
pub(crate) struct PipeEndpoint {
    reader: File,
    writer: File,
    nonblocking: bool,
}

impl PipeEndpoint {
    pub fn connect(read: RawFd, write: RawFd) -> Result<Self> {
        let shared = fd::dup_inherited(read)?;
        let writer = fd::dup_inherited(write)?;

        let (reader, nonblocking) = match fd::reopen_nonblocking(&shared) {
            Ok(private) => (private, true),
            Err(e) => {
                tracing::debug!(error = %e, "Using shared blocking pipe reader");
                (shared, false)
            }
        };

        tracing::trace!(read, write, nonblocking, "Connected to pipe channel");
        Ok(Self {
            reader,
            writer,
            nonblocking,
        })
    }

    pub fn reader(&self) -> &File {
        &self.reader
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    pub fn release(&self, byte: u8) -> Result<()> {
        fd::write_token(&self.writer, byte)
    }
}
