//! Connection descriptor published through `MAKEFLAGS`.
//!
//! Two encodings are understood, both from the GNU make jobserver protocol:
//! - `--jobserver-auth=fifo:PATH` (canonical, written for FIFO pools)
//! - `--jobserver-auth=R,W` plus the legacy `--jobserver-fds=R,W` (pipe pools)
//!
//! When several flags are present the last `--jobserver-auth` wins, falling
//! back to `--jobserver-fds`, matching how make itself reads its flags.

use std::fmt;
use std::os::fd::RawFd;
use std::path::PathBuf;

use crate::error::{PoolError, Result};

const AUTH_FLAG: &str = "--jobserver-auth=";
const FDS_FLAG: &str = "--jobserver-fds=";
const FIFO_PREFIX: &str = "fifo:";

/// How a participant reaches the token channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Descriptor {
    Fifo { path: PathBuf },
    Pipe { read: RawFd, write: RawFd },
}

impl Descriptor {
    /// Full `MAKEFLAGS` value advertising a pool of `capacity` jobs.
    pub fn to_makeflags(&self, capacity: usize) -> String {
        match self {
            Descriptor::Fifo { .. } => format!(" -j{capacity} {AUTH_FLAG}{self}"),
            Descriptor::Pipe { .. } => {
                format!(" -j{capacity} {FDS_FLAG}{self} {AUTH_FLAG}{self}")
            }
        }
    }

    /// Extract the descriptor from a `MAKEFLAGS` value.
    ///
    /// Returns `Ok(None)` when no jobserver flag is present: the caller should
    /// run unthrottled.
    pub fn from_makeflags(makeflags: &str) -> Result<Option<Self>> {
        let mut auth = None;
        let mut fds = None;
        for word in makeflags.split_whitespace() {
            if word == "--" {
                // Variable assignments follow.
                break;
            }
            if let Some(value) = word.strip_prefix(AUTH_FLAG) {
                auth = Some(value);
            } else if let Some(value) = word.strip_prefix(FDS_FLAG) {
                fds = Some(value);
            }
        }

        match auth.or(fds) {
            Some(value) => value.parse().map(Some),
            None => Ok(None),
        }
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descriptor::Fifo { path } => write!(f, "{FIFO_PREFIX}{}", path.display()),
            Descriptor::Pipe { read, write } => write!(f, "{read},{write}"),
        }
    }
}

impl std::str::FromStr for Descriptor {
    type Err = PoolError;

    fn from_str(value: &str) -> Result<Self> {
        if let Some(path) = value.strip_prefix(FIFO_PREFIX) {
            if path.is_empty() {
                return Err(PoolError::InvalidDescriptor(value.to_string()));
            }
            return Ok(Descriptor::Fifo {
                path: PathBuf::from(path),
            });
        }

        let (read, write) = value
            .split_once(',')
            .ok_or_else(|| PoolError::InvalidDescriptor(value.to_string()))?;
        let parse_fd = |s: &str| {
            s.parse::<RawFd>()
                .ok()
                .filter(|fd| *fd >= 0)
                .ok_or_else(|| PoolError::InvalidDescriptor(value.to_string()))
        };
        Ok(Descriptor::Pipe {
            read: parse_fd(read)?,
            write: parse_fd(write)?,
        })
    }
}
