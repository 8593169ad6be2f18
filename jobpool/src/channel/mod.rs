//! Token channel: a byte stream whose kernel buffer is the token reservoir.
//!
//! Writing one byte releases a token, reading one byte acquires one. The
//! channel keeps no count of its own; the buffer is the count.
//!
//! - **FifoChannel**: named pipe reachable by path (canonical)
//! - **PipeChannel**: anonymous pipe reachable by inherited fd numbers

mod fifo;
mod pipe;

use std::time::Duration;

use crate::config::{ChannelKind, SEED_TOKEN};
use crate::descriptor::Descriptor;
use crate::error::{PoolError, Result};
use crate::fd;

pub use fifo::FifoChannel;
pub use pipe::PipeChannel;

pub(crate) use fifo::FifoEndpoint;
pub(crate) use pipe::PipeEndpoint;

/// Coordinator-owned channel.
pub enum TokenChannel {
    Fifo(FifoChannel),
    Pipe(PipeChannel),
}

impl TokenChannel {
    pub fn descriptor(&self) -> Descriptor {
        match self {
            Self::Fifo(c) => Descriptor::Fifo {
                path: c.path().to_path_buf(),
            },
            Self::Pipe(c) => {
                let (read, write) = c.fds();
                Descriptor::Pipe { read, write }
            }
        }
    }

    /// Write `count` tokens into a fresh channel.
    pub fn seed(&self, count: usize) -> Result<()> {
        let writer = match self {
            Self::Fifo(c) => c.writer()?,
            Self::Pipe(c) => c.writer(),
        };
        for seeded in 0..count {
            fd::write_token(writer, SEED_TOKEN).map_err(|e| {
                PoolError::ChannelCreateFailed(format!(
                    "seeding stopped after {seeded} of {count} tokens: {e}"
                ))
            })?;
        }
        tracing::debug!(count, "Seeded token channel");
        Ok(())
    }

    /// Remove every token currently in the channel without waiting, and
    /// return how many there were.
    pub fn drain(&self) -> Result<usize> {
        let (reader, nonblocking) = match self {
            Self::Fifo(c) => (c.reader()?, true),
            Self::Pipe(c) => c.reader(),
        };
        let mut count = 0;
        loop {
            match fd::read_token(reader, Some(Duration::ZERO), nonblocking) {
                Ok(Some(_)) => count += 1,
                Ok(None) | Err(PoolError::ChannelClosed) => break,
                Err(e) => return Err(e),
            }
        }
        tracing::trace!(count, "Drained token channel");
        Ok(count)
    }

    /// Close the channel. Blocked FIFO readers observe `ChannelClosed`.
    pub fn destroy(self) -> Result<()> {
        match self {
            Self::Fifo(c) => c.destroy()?,
            Self::Pipe(c) => drop(c),
        }
        tracing::debug!("Token channel destroyed");
        Ok(())
    }
}

/// Create the channel described by `kind`. Nothing is seeded yet.
pub fn create_channel(kind: &ChannelKind) -> Result<TokenChannel> {
    match kind {
        ChannelKind::Fifo { path } => Ok(TokenChannel::Fifo(FifoChannel::create(path)?)),
        ChannelKind::Pipe => Ok(TokenChannel::Pipe(PipeChannel::create()?)),
    }
}

/// Participant-side connection.
pub(crate) enum Endpoint {
    Fifo(FifoEndpoint),
    Pipe(PipeEndpoint),
}

impl Endpoint {
    pub fn reader(&self) -> &std::fs::File {
        match self {
            Self::Fifo(e) => e.reader(),
            Self::Pipe(e) => e.reader(),
        }
    }

    pub fn is_nonblocking(&self) -> bool {
        match self {
            Self::Fifo(_) => true,
            Self::Pipe(e) => e.is_nonblocking(),
        }
    }

    pub fn release(&self, byte: u8) -> Result<()> {
        match self {
            Self::Fifo(e) => e.release(byte),
            Self::Pipe(e) => e.release(byte),
        }
    }
}

pub(crate) fn connect_channel(descriptor: &Descriptor) -> Result<Endpoint> {
    match descriptor {
        Descriptor::Fifo { path } => Ok(Endpoint::Fifo(FifoEndpoint::connect(path)?)),
        Descriptor::Pipe { read, write } => {
            Ok(Endpoint::Pipe(PipeEndpoint::connect(*read, *write)?))
        }
    }
}
