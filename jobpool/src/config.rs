//! Pool configuration.

use std::path::PathBuf;

use crate::error::{PoolError, Result};

/// Upper bound on the pool size. Every token sits in the channel's kernel
/// buffer, and 4096 bytes fit in any pipe buffer, so seeding never blocks.
pub const MAX_CAPACITY: usize = 4096;

/// Byte written for every seeded token, the same one GNU make uses.
pub const SEED_TOKEN: u8 = b'+';

/// Environment variable carrying the connection descriptor.
pub const MAKEFLAGS: &str = "MAKEFLAGS";

/// Backing primitive for the token channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// Named pipe at a filesystem path. Reachable by unrelated processes.
    Fifo { path: PathBuf },
    /// Anonymous pipe whose fds are inherited by the wrapped command.
    Pipe,
}

impl ChannelKind {
    /// Named pipe at `{temp_dir}/jobpool-{pid}.fifo`.
    pub fn default_fifo() -> Self {
        let path = std::env::temp_dir().join(format!("jobpool-{}.fifo", std::process::id()));
        ChannelKind::Fifo { path }
    }
}

impl Default for ChannelKind {
    fn default() -> Self {
        Self::default_fifo()
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub capacity: usize,
    pub kind: ChannelKind,
    /// Audit the channel after a successful run and fail if tokens leaked.
    pub check: bool,
    /// Seed one token less, leaving the implicit slot GNU make assumes for
    /// the top-level process.
    pub implicit_slot: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(default_capacity())
    }
}

impl PoolConfig {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            kind: ChannelKind::default(),
            check: false,
            implicit_slot: false,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_kind(mut self, kind: ChannelKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_fifo(self, path: impl Into<PathBuf>) -> Self {
        self.with_kind(ChannelKind::Fifo { path: path.into() })
    }

    pub fn with_pipe(self) -> Self {
        self.with_kind(ChannelKind::Pipe)
    }

    pub fn with_check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    pub fn with_implicit_slot(mut self, implicit_slot: bool) -> Self {
        self.implicit_slot = implicit_slot;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 || self.capacity > MAX_CAPACITY {
            return Err(PoolError::InvalidCapacity(self.capacity));
        }
        if let ChannelKind::Fifo { path } = &self.kind
            && path.to_string_lossy().chars().any(char::is_whitespace)
        {
            // MAKEFLAGS is split on whitespace by every consumer.
            return Err(PoolError::ChannelCreateFailed(format!(
                "fifo path {} contains whitespace",
                path.display()
            )));
        }
        Ok(())
    }

    /// Anchor a relative fifo path to the current directory.
    ///
    /// The path is published verbatim, and descendants that change directory
    /// (`make -C`, `ninja -C`) must still reach it.
    pub fn resolve_paths(mut self) -> Result<Self> {
        if let ChannelKind::Fifo { path } = &mut self.kind
            && path.is_relative()
        {
            let absolute = std::path::absolute(&*path).map_err(|e| {
                PoolError::ChannelCreateFailed(format!("resolve {}: {e}", path.display()))
            })?;
            *path = absolute;
        }
        Ok(self)
    }

    /// Number of tokens written into the channel at startup.
    pub fn seed_count(&self) -> usize {
        if self.implicit_slot {
            self.capacity - 1
        } else {
            self.capacity
        }
    }
}

/// Number of logical CPUs on this host.
pub fn default_capacity() -> usize {
    num_cpus::get().max(1)
}
