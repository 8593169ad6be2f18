//! `jobserver-pool`: run a command under a shared GNU make jobserver.
//!
//! Exit status is the wrapped command's, `128 + signo` if a signal killed it,
//! 1 if `--check` found the token count off, 125 if the pool could not be set
//! up, 126/127 if the command could not be executed or found.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use jobpool::{ChannelKind, Coordinator, PoolConfig, PoolError};

const SETUP_FAILED: i32 = 125;
const NOT_EXECUTABLE: i32 = 126;
const NOT_FOUND: i32 = 127;

const USAGE_EXAMPLES: &str = "\
Examples:
  Share 8 job slots between two ninja builds:
    jobserver-pool -j8 -- sh -c 'ninja -C out/a & ninja -C out/b & wait'

  Use an anonymous pipe for tools that predate fifo jobservers:
    jobserver-pool --pipe -j4 -- make all

  Verify every job returned its token:
    jobserver-pool --check -j16 -- ./build.sh

Participants find the pool through MAKEFLAGS, which is replaced for the
wrapped command with ` -jN --jobserver-auth=fifo:PATH` (or the fd pair form
with --pipe).";

#[derive(Parser, Debug)]
#[command(name = "jobserver-pool")]
#[command(version, about = "Run a command under a GNU make jobserver token pool")]
#[command(after_long_help = USAGE_EXAMPLES)]
struct Args {
    /// Number of tokens in the pool (defaults to the CPU count)
    #[arg(short = 'j', long = "jobs", env = "JOBPOOL_JOBS", default_value_t = jobpool::default_capacity())]
    jobs: usize,

    /// Named pipe to create for the pool (defaults to a per-process path in the temp dir)
    #[arg(long, env = "JOBPOOL_FIFO")]
    fifo: Option<PathBuf>,

    /// Use an anonymous pipe and pass its fds to the command (overrides --fifo)
    #[arg(long)]
    pipe: bool,

    /// After a successful run, verify all tokens were returned
    #[arg(long)]
    check: bool,

    /// Seed one token fewer: the command's first job runs on its implicit slot
    #[arg(long)]
    implicit_slot: bool,

    /// Command to run, with its arguments
    #[arg(required = true, trailing_var_arg = true, value_name = "COMMAND")]
    command: Vec<OsString>,
}

impl Args {
    fn pool_config(&self) -> PoolConfig {
        let kind = match (&self.fifo, self.pipe) {
            (_, true) => ChannelKind::Pipe,
            (Some(path), false) => ChannelKind::Fifo { path: path.clone() },
            (None, false) => ChannelKind::default_fifo(),
        };
        PoolConfig::new(self.jobs)
            .with_kind(kind)
            .with_check(self.check)
            .with_implicit_slot(self.implicit_slot)
    }
}

/// RUST_LOG wins; otherwise JOBPOOL_LOG picks the level. LOG_FORMAT=json
/// switches to JSON lines. Logs go to stderr so the wrapped command owns stdout.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("JOBPOOL_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!("jobpool={level},jobserver_pool={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn failure_code(err: &PoolError) -> i32 {
    match err {
        PoolError::Spawn { source, .. } => match source.kind() {
            ErrorKind::NotFound => NOT_FOUND,
            ErrorKind::PermissionDenied => NOT_EXECUTABLE,
            _ => SETUP_FAILED,
        },
        _ => SETUP_FAILED,
    }
}

fn run(args: Args) -> anyhow::Result<i32> {
    let config = args.pool_config();
    tracing::debug!(?config, "Parsed pool configuration");

    let mut coordinator = match Coordinator::new(config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("jobserver-pool: could not set up the pool: {e}");
            return Ok(SETUP_FAILED);
        }
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match runtime.block_on(coordinator.run(args.command)) {
        Ok(exit) => {
            tracing::debug!(
                exit_code = exit.exit_code,
                command_code = exit.command_code,
                "Pool finished"
            );
            Ok(exit.exit_code)
        }
        Err(e) => {
            eprintln!("jobserver-pool: could not set up the pool: {e}");
            Ok(failure_code(&e))
        }
    }
}

fn main() {
    init_tracing();
    let args = Args::parse();

    let code = match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("jobserver-pool: {e:#}");
            SETUP_FAILED
        }
    };
    process::exit(code);
}
