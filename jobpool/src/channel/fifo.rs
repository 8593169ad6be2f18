//! Named-pipe channel.
//!
//! The coordinator keeps both ends open for the pool's lifetime: the read end
//! lets participants open the write end without ENXIO, the write end keeps
//! participants from seeing end-of-stream. Participants never keep a write end
//! open between releases, so once the coordinator closes its own every blocked
//! reader observes EOF.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;

use crate::error::{PoolError, Result};
use crate::fd;

pub struct FifoChannel {
    path: PathBuf,
    reader: Option<File>,
    writer: Option<File>,
}

impl FifoChannel {
    /// Create the FIFO at `path`, replacing any stale node left there.
    pub fn create(path: &Path) -> Result<Self> {
        let create_failed = |what: &str, e: &dyn std::fmt::Display| {
            PoolError::ChannelCreateFailed(format!("{what} {}: {e}", path.display()))
        };

        if path.symlink_metadata().is_ok() {
            tracing::debug!(path = %path.display(), "Removing stale fifo");
            std::fs::remove_file(path).map_err(|e| create_failed("remove", &e))?;
        }

        nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|e| create_failed("mkfifo", &e))?;

        // Read end first: opening the write end non-blocking needs a reader.
        let reader = fd::open_fifo_reader(path).map_err(|e| create_failed("open", &e))?;
        let writer = fd::open_fifo_writer(path).map_err(|e| create_failed("open", &e))?;

        tracing::debug!(path = %path.display(), "Created fifo channel");

        Ok(Self {
            path: path.to_path_buf(),
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn reader(&self) -> io::Result<&File> {
        self.reader.as_ref().ok_or_else(destroyed)
    }

    pub(crate) fn writer(&self) -> io::Result<&File> {
        self.writer.as_ref().ok_or_else(destroyed)
    }

    pub fn destroy(mut self) -> io::Result<()> {
        self.cleanup()
    }

    fn cleanup(&mut self) -> io::Result<()> {
        // Writer first so blocked readers see EOF as soon as possible.
        self.writer.take();
        self.reader.take();
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Removed fifo");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for FifoChannel {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove fifo");
        }
    }
}

fn destroyed() -> io::Error {
    io::Error::other("fifo channel already destroyed")
}

/// Participant connection to a FIFO channel.
pub(crate) struct FifoEndpoint {
    path: PathBuf,
    reader: File,
}

impl FifoEndpoint {
    pub fn connect(path: &Path) -> Result<Self> {
        let reader = fd::open_fifo_reader(path)?;
        tracing::trace!(path = %path.display(), "Connected to fifo channel");
        Ok(Self {
            path: path.to_path_buf(),
            reader,
        })
    }

    pub fn reader(&self) -> &File {
        &self.reader
    }

    pub fn release(&self, byte: u8) -> Result<()> {
        let writer = fd::open_fifo_writer(&self.path)?;
        fd::write_token(&writer, byte)
    }
}
