use std::io;

use thiserror::Error;

use crate::config::MAX_CAPACITY;
use crate::coordinator::PoolState;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid capacity {0}: must be between 1 and {MAX_CAPACITY}")]
    InvalidCapacity(usize),

    #[error("failed to create token channel: {0}")]
    ChannelCreateFailed(String),

    /// The pool was destroyed. Participants should stop or run unthrottled,
    /// never retry.
    #[error("token channel closed")]
    ChannelClosed,

    #[error("invalid jobserver descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("pool is {0} and cannot run another command")]
    NotReusable(PoolState),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PoolError {
    /// True when the coordinator failed before the wrapped command could run.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            PoolError::InvalidCapacity(_)
                | PoolError::ChannelCreateFailed(_)
                | PoolError::Spawn { .. }
        )
    }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for PoolError {
    fn from(errno: nix::errno::Errno) -> Self {
        PoolError::Io(io::Error::from(errno))
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
