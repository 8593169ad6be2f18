//! Coordinator - owns the pool for the lifetime of one wrapped command.
//!
//! Flow:
//! 1. Validate capacity (`Created`)
//! 2. Create the channel and write the tokens (`Seeded`)
//! 3. Spawn the wrapped command with `MAKEFLAGS` pointing at the channel (`Running`)
//! 4. Wait for it, relaying SIGINT/SIGTERM/SIGHUP (`Draining`)
//! 5. Optionally audit the token count, then destroy the channel (`Destroyed`)
//!
//! The coordinator never acquires or releases tokens itself while the command
//! runs; it is the channel's custodian, not a participant.

use std::ffi::OsStr;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use tokio::process::{Child, Command};

use crate::channel::{TokenChannel, create_channel};
use crate::config::{MAKEFLAGS, PoolConfig};
use crate::descriptor::Descriptor;
use crate::error::{PoolError, Result};
use crate::signal::{Interrupts, forward};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Seeded,
    Running,
    Draining,
    Destroyed,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolState::Created => "created",
            PoolState::Seeded => "seeded",
            PoolState::Running => "running",
            PoolState::Draining => "draining",
            PoolState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Token count found in the channel after the command exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenAudit {
    pub expected: usize,
    pub found: usize,
}

impl TokenAudit {
    pub fn is_balanced(&self) -> bool {
        self.expected == self.found
    }
}

impl fmt::Display for TokenAudit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { expected, found } = *self;
        if found < expected {
            write!(
                f,
                "{} tokens were missing from the pool (got {found}, expected {expected})",
                expected - found
            )
        } else if found > expected {
            write!(
                f,
                "{} extra tokens were released to the pool (got {found}, expected {expected})",
                found - expected
            )
        } else {
            write!(f, "all {expected} tokens returned")
        }
    }
}

/// How the pool ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolExit {
    /// Exit code for the coordinator process.
    pub exit_code: i32,
    /// Exit code of the wrapped command, `128 + signo` if a signal killed it.
    pub command_code: i32,
    pub audit: Option<TokenAudit>,
}

pub struct Coordinator {
    config: PoolConfig,
    state: PoolState,
    channel: Option<TokenChannel>,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish()
    }
}

impl Coordinator {
    pub fn new(config: PoolConfig) -> Result<Self> {
        let config = config.resolve_paths()?;
        config.validate()?;
        tracing::debug!(capacity = config.capacity, kind = ?config.kind, "Pool created");
        Ok(Self {
            config,
            state: PoolState::Created,
            channel: None,
        })
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn transition(&mut self, next: PoolState) {
        tracing::debug!(from = %self.state, to = %next, "Pool state transition");
        self.state = next;
    }

    /// Create the channel and fill it. Idempotent once seeded.
    pub fn seed(&mut self) -> Result<Descriptor> {
        if let Some(channel) = &self.channel {
            return Ok(channel.descriptor());
        }

        let channel = create_channel(&self.config.kind)?;
        channel.seed(self.config.seed_count())?;
        let descriptor = channel.descriptor();
        self.channel = Some(channel);
        self.transition(PoolState::Seeded);

        tracing::info!(
            capacity = self.config.capacity,
            seeded = self.config.seed_count(),
            descriptor = %descriptor,
            "Jobserver pool ready"
        );
        Ok(descriptor)
    }

    /// `MAKEFLAGS` value for the wrapped command, once seeded.
    pub fn makeflags(&self) -> Option<String> {
        self.channel
            .as_ref()
            .map(|c| c.descriptor().to_makeflags(self.config.capacity))
    }

    /// Run `command` under the pool and tear the pool down afterwards.
    ///
    /// Errors are returned only when the command never started. Once it has
    /// run, its exit code is reported through [`PoolExit`] whatever happens.
    /// Either way the pool ends up `Destroyed`.
    pub async fn run<I, S>(&mut self, command: I) -> Result<PoolExit>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        if !matches!(self.state, PoolState::Created | PoolState::Seeded) {
            return Err(PoolError::NotReusable(self.state));
        }

        let (mut child, mut interrupts, makeflags) = match self.launch(command) {
            Ok(launched) => launched,
            Err(e) => {
                self.destroy();
                return Err(e);
            }
        };
        self.transition(PoolState::Running);

        let pid = child.id();
        tracing::info!(pid, makeflags = %makeflags, "Started wrapped command");

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                signal = interrupts.recv() => {
                    if self.state != PoolState::Draining {
                        self.transition(PoolState::Draining);
                    }
                    if let Some(pid) = pid {
                        forward(pid, signal);
                    }
                }
            }
        };
        if self.state != PoolState::Draining {
            self.transition(PoolState::Draining);
        }

        let command_code = match status {
            Ok(status) => exit_code(status),
            Err(e) => {
                tracing::error!(error = %e, "Failed to wait for wrapped command");
                1
            }
        };
        tracing::info!(exit_code = command_code, "Wrapped command exited");

        let audit = if self.config.check && command_code == 0 {
            self.audit()
        } else {
            None
        };
        let exit_code = match audit {
            Some(audit) if !audit.is_balanced() => {
                tracing::error!("{audit}");
                1
            }
            _ => command_code,
        };

        self.destroy();

        Ok(PoolExit {
            exit_code,
            command_code,
            audit,
        })
    }

    fn launch<I, S>(&mut self, command: I) -> Result<(Child, Interrupts, String)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut argv = command.into_iter();
        let program = argv.next().ok_or_else(|| PoolError::Spawn {
            command: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;
        let program_name = program.as_ref().to_string_lossy().into_owned();

        // Before the channel exists, so no signal can kill us with a fifo on disk.
        let interrupts = Interrupts::install()?;

        self.seed()?;
        let makeflags = self.makeflags().unwrap_or_default();

        let child = Command::new(program.as_ref())
            .args(argv)
            .env(MAKEFLAGS, &makeflags)
            .spawn()
            .map_err(|source| PoolError::Spawn {
                command: program_name.clone(),
                source,
            })?;
        tracing::debug!(command = %program_name, "Spawned wrapped command");
        Ok((child, interrupts, makeflags))
    }

    fn audit(&self) -> Option<TokenAudit> {
        let channel = self.channel.as_ref()?;
        match channel.drain() {
            Ok(found) => {
                let audit = TokenAudit {
                    expected: self.config.seed_count(),
                    found,
                };
                tracing::debug!(expected = audit.expected, found, "Token audit");
                Some(audit)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Token audit failed");
                None
            }
        }
    }

    fn destroy(&mut self) {
        if let Some(channel) = self.channel.take()
            && let Err(e) = channel.destroy()
        {
            tracing::warn!(error = %e, "Failed to destroy token channel");
        }
        self.transition(PoolState::Destroyed);
    }
}

/// Shell convention: the exit code, or `128 + signo` for a signal death.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signo)) => 128 + signo,
        (None, None) => 1,
    }
}
