//! jobpool: a GNU make compatible jobserver token pool.
//!
//! A [`Coordinator`] creates a token channel, fills it with N tokens and runs
//! a command whose `MAKEFLAGS` point at the channel. Any participant in that
//! process tree (make, ninja, cargo, or a [`Client`]) takes a token before
//! starting a job and gives it back afterwards, so at most N jobs run at once
//! across the whole tree.

#[cfg(not(unix))]
compile_error!("jobpool relies on unix pipes and FIFOs");

mod channel;
mod client;
mod config;
mod coordinator;
mod descriptor;
mod error;
mod fd;
mod signal;
mod token;

pub use channel::{FifoChannel, PipeChannel, TokenChannel, create_channel};
pub use client::{Client, run_job};
pub use config::{ChannelKind, MAKEFLAGS, MAX_CAPACITY, PoolConfig, SEED_TOKEN, default_capacity};
pub use coordinator::{Coordinator, PoolExit, PoolState, TokenAudit, exit_code};
pub use descriptor::Descriptor;
pub use error::{PoolError, Result};
pub use token::{Acquired, Token};
