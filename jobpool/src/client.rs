//! Participant side of the pool.
//!
//! Any process that found a jobserver descriptor in its environment brackets
//! every job with an acquire before starting it and a release after it ends.
//! The pool trusts participants to keep that symmetric: a release without a
//! matching acquire silently adds capacity, and nothing here can detect it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use crate::channel::{Endpoint, connect_channel};
use crate::config::MAKEFLAGS;
use crate::descriptor::Descriptor;
use crate::error::{PoolError, Result};
use crate::fd;
use crate::token::{Acquired, Token};

/// Handle to a jobserver pool. Cheap to clone and shareable across threads.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    descriptor: Descriptor,
    endpoint: Endpoint,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("descriptor", &self.inner.descriptor)
            .finish()
    }
}

impl Client {
    /// Join the pool advertised in `MAKEFLAGS`, if any.
    ///
    /// `Ok(None)` means run unthrottled: either no pool is advertised, or the
    /// advertised one is already gone.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(MAKEFLAGS) {
            Ok(value) => Self::from_makeflags(&value),
            Err(_) => Ok(None),
        }
    }

    pub fn from_makeflags(makeflags: &str) -> Result<Option<Self>> {
        let Some(descriptor) = Descriptor::from_makeflags(makeflags)? else {
            tracing::trace!("No jobserver in MAKEFLAGS, running unthrottled");
            return Ok(None);
        };

        match Self::connect(&descriptor) {
            Ok(client) => Ok(Some(client)),
            Err(e @ (PoolError::ChannelClosed | PoolError::InvalidDescriptor(_))) => {
                tracing::warn!(
                    descriptor = %descriptor,
                    error = %e,
                    "Jobserver unavailable, running unthrottled"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn connect(descriptor: &Descriptor) -> Result<Self> {
        let endpoint = connect_channel(descriptor)?;
        tracing::debug!(descriptor = %descriptor, "Joined jobserver pool");
        Ok(Self {
            inner: Arc::new(ClientInner {
                descriptor: descriptor.clone(),
                endpoint,
            }),
        })
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.inner.descriptor
    }

    /// Wait for a token. Fails with `ChannelClosed` once the pool is destroyed.
    pub fn acquire(&self) -> Result<Acquired> {
        loop {
            if let Some(acquired) = self.read(None)? {
                return Ok(acquired);
            }
        }
    }

    /// Take a token only if one is free right now.
    pub fn try_acquire(&self) -> Result<Option<Acquired>> {
        self.read(Some(Duration::ZERO))
    }

    /// Wait at most `timeout`. `Ok(None)` means no token arrived in time, which
    /// says nothing about the pool's health.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Option<Acquired>> {
        self.read(Some(timeout))
    }

    fn read(&self, timeout: Option<Duration>) -> Result<Option<Acquired>> {
        let endpoint = &self.inner.endpoint;
        let byte = fd::read_token(endpoint.reader(), timeout, endpoint.is_nonblocking())?;
        Ok(byte.map(|b| self.wrap(b)))
    }

    /// Async [`acquire`](Self::acquire). Dropping the future never loses a token.
    pub async fn acquire_async(&self) -> Result<Acquired> {
        let endpoint = &self.inner.endpoint;
        if !endpoint.is_nonblocking() {
            // A shared blocking fd cannot be registered with the reactor.
            let client = self.clone();
            return tokio::task::spawn_blocking(move || client.acquire())
                .await
                .map_err(|e| PoolError::Io(std::io::Error::other(e)))?;
        }

        let file = endpoint.reader().try_clone()?;
        let reader =
            AsyncFd::try_with_interest(file, Interest::READABLE).map_err(std::io::Error::from)?;
        loop {
            match tokio::time::timeout(fd::CLOSE_PROBE_INTERVAL, reader.readable()).await {
                Ok(guard) => {
                    let mut guard = guard?;
                    let attempt = guard.try_io(|inner| match fd::try_read_token(inner.get_ref()) {
                        Ok(Some(byte)) => Ok(Ok(byte)),
                        Ok(None) => Err(std::io::ErrorKind::WouldBlock.into()),
                        Err(e) => Ok(Err(e)),
                    });
                    match attempt {
                        Ok(Ok(result)) => return result.map(|b| self.wrap(b)),
                        Ok(Err(e)) => return Err(e.into()),
                        Err(_would_block) => continue,
                    }
                }
                // No wakeup: probe for a vanished writer the reactor won't report.
                Err(_elapsed) => {
                    if let Some(byte) = fd::try_read_token(reader.get_ref())? {
                        return Ok(self.wrap(byte));
                    }
                }
            }
        }
    }

    fn wrap(&self, byte: u8) -> Acquired {
        tracing::trace!(token = byte, "Acquired token");
        Acquired::new(self.clone(), Token::new(byte))
    }

    /// Return a token obtained through [`Acquired::into_token`]. Never blocks.
    pub fn release(&self, token: Token) -> Result<()> {
        self.inner.endpoint.release(token.byte())?;
        tracing::trace!(token = token.byte(), "Released token");
        Ok(())
    }

    /// Run `job` while holding a token.
    pub fn run<T>(&self, job: impl FnOnce() -> T) -> Result<T> {
        let _held = self.acquire()?;
        Ok(job())
    }
}

/// Run `job` under the pool when there is one.
///
/// Without a client, or once the pool has been torn down, the job runs
/// unthrottled. Other pool errors are returned without running it.
pub fn run_job<T>(client: Option<&Client>, job: impl FnOnce() -> T) -> Result<T> {
    let Some(client) = client else {
        return Ok(job());
    };
    match client.acquire() {
        Ok(held) => {
            let out = job();
            drop(held);
            Ok(out)
        }
        Err(PoolError::ChannelClosed) => {
            tracing::warn!("Jobserver pool closed, running unthrottled");
            Ok(job())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{TokenChannel, create_channel};
    use crate::config::ChannelKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    fn fifo_pool(dir: &tempfile::TempDir, n: usize) -> TokenChannel {
        let channel = create_channel(&ChannelKind::Fifo {
            path: dir.path().join("tokens"),
        })
        .unwrap();
        channel.seed(n).unwrap();
        channel
    }

    #[test]
    fn two_tokens_three_acquirers() {
        let dir = tempfile::tempdir().unwrap();
        let channel = fifo_pool(&dir, 2);
        let desc = channel.descriptor();

        let a = Client::connect(&desc).unwrap();
        let b = Client::connect(&desc).unwrap();
        let c = Client::connect(&desc).unwrap();

        let held_a = a.try_acquire().unwrap().expect("first token");
        let _held_b = b.try_acquire().unwrap().expect("second token");
        assert!(c.try_acquire().unwrap().is_none());

        let (tx, rx) = mpsc::channel();
        let waiter = thread::spawn(move || {
            let held = c.acquire();
            tx.send(held.is_ok()).unwrap();
            held.map(Acquired::into_token)
        });

        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        drop(held_a);
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn concurrent_holders_never_exceed_capacity() {
        const CAPACITY: usize = 3;
        const WORKERS: usize = 8;
        const ROUNDS: usize = 25;

        let dir = tempfile::tempdir().unwrap();
        let channel = fifo_pool(&dir, CAPACITY);
        let desc = channel.descriptor();

        let held = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..WORKERS)
            .map(|_| {
                let client = Client::connect(&desc).unwrap();
                let held = Arc::clone(&held);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        client
                            .run(|| {
                                let now = held.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                thread::sleep(Duration::from_millis(1));
                                held.fetch_sub(1, Ordering::SeqCst);
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
        assert!(peak.load(Ordering::SeqCst) >= 1);
        // Conservation: every acquired token came back.
        assert_eq!(channel.drain().unwrap(), CAPACITY);
    }

    #[test]
    fn nested_requesters_share_one_budget() {
        // Two sub-builds each try to run four jobs at once against a pool of four.
        const CAPACITY: usize = 4;

        let dir = tempfile::tempdir().unwrap();
        let channel = fifo_pool(&dir, CAPACITY);
        let desc = channel.descriptor();
        let held = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let subbuilds: Vec<_> = (0..2)
            .map(|_| {
                let client = Client::connect(&desc).unwrap();
                let held = Arc::clone(&held);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    let jobs: Vec<_> = (0..CAPACITY)
                        .map(|_| {
                            let client = client.clone();
                            let held = Arc::clone(&held);
                            let peak = Arc::clone(&peak);
                            thread::spawn(move || {
                                let _token = client.acquire().unwrap();
                                let now = held.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                thread::sleep(Duration::from_millis(20));
                                held.fetch_sub(1, Ordering::SeqCst);
                            })
                        })
                        .collect();
                    for job in jobs {
                        job.join().unwrap();
                    }
                })
            })
            .collect();
        for subbuild in subbuilds {
            subbuild.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
        assert_eq!(channel.drain().unwrap(), CAPACITY);
    }

    #[test]
    fn destroy_wakes_blocked_acquirer() {
        let dir = tempfile::tempdir().unwrap();
        let channel = fifo_pool(&dir, 1);
        let desc = channel.descriptor();

        let holder = Client::connect(&desc).unwrap();
        let _token = holder.acquire().unwrap().into_token();

        let waiter = Client::connect(&desc).unwrap();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(waiter.acquire().map(Acquired::into_token));
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        channel.destroy().unwrap();

        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, Err(PoolError::ChannelClosed)));
    }

    #[test]
    fn timeout_is_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let channel = fifo_pool(&dir, 1);
        let client = Client::connect(&channel.descriptor()).unwrap();

        let _held = client.acquire().unwrap();
        let start = std::time::Instant::now();
        let missed = client.acquire_timeout(Duration::from_millis(100)).unwrap();
        assert!(missed.is_none());
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn capacity_conserved_over_many_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let channel = fifo_pool(&dir, 2);
        let client = Client::connect(&channel.descriptor()).unwrap();

        for _ in 0..200 {
            let a = client.acquire().unwrap();
            let b = client.acquire().unwrap();
            assert!(client.try_acquire().unwrap().is_none());
            drop((a, b));
        }
        assert_eq!(channel.drain().unwrap(), 2);
    }

    #[test]
    fn pipe_pool_dispenses_exactly_capacity() {
        let channel = create_channel(&ChannelKind::Pipe).unwrap();
        channel.seed(2).unwrap();
        let client = Client::connect(&channel.descriptor()).unwrap();

        let a = client.try_acquire().unwrap();
        let b = client.try_acquire().unwrap();
        assert!(a.is_some() && b.is_some());
        if client.inner.endpoint.is_nonblocking() {
            assert!(client.try_acquire().unwrap().is_none());
        }
        drop((a, b));
        assert_eq!(channel.drain().unwrap(), 2);
    }

    #[test]
    fn makeflags_without_jobserver_is_unthrottled() {
        assert!(Client::from_makeflags(" -j8 -k").unwrap().is_none());
    }

    #[test]
    fn stale_fifo_descriptor_is_unthrottled() {
        let flags = " -j2 --jobserver-auth=fifo:/nonexistent/jobpool.fifo";
        assert!(Client::from_makeflags(flags).unwrap().is_none());
    }

    #[test]
    fn malformed_descriptor_is_an_error() {
        let err = Client::from_makeflags(" -j2 --jobserver-auth=sem_name").unwrap_err();
        assert!(matches!(err, PoolError::InvalidDescriptor(_)));
    }

    #[test]
    fn run_job_without_pool_runs_directly() {
        assert_eq!(run_job(None, || 41 + 1).unwrap(), 42);
    }

    #[test]
    fn run_job_degrades_after_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let channel = fifo_pool(&dir, 1);
        let client = Client::connect(&channel.descriptor()).unwrap();
        let _token = client.acquire().unwrap().into_token();
        channel.destroy().unwrap();

        assert_eq!(run_job(Some(&client), || "ran").unwrap(), "ran");
    }

    #[tokio::test]
    async fn async_acquire_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let channel = fifo_pool(&dir, 1);
        let desc = channel.descriptor();
        let holder = Client::connect(&desc).unwrap();
        let waiter = Client::connect(&desc).unwrap();

        let held = holder.acquire().unwrap();
        let pending = tokio::spawn(async move { waiter.acquire_async().await.map(|a| a.token()) });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());
        drop(held);

        let token = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(token.byte(), crate::config::SEED_TOKEN);
        assert_eq!(channel.drain().unwrap(), 1);
    }

    #[tokio::test]
    async fn async_acquire_observes_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let channel = fifo_pool(&dir, 1);
        let client = Client::connect(&channel.descriptor()).unwrap();
        let _token = client.acquire().unwrap().into_token();

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.acquire_async().await.map(Acquired::into_token) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.destroy().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PoolError::ChannelClosed)));
    }
}
