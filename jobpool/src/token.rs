//! Tokens and the guard that gives them back.
//!
//! An [`Acquired`] returns its token to the pool when dropped, so a job that
//! panics or bails out early with `?` still gives its slot back. Transitions:
//! - `Acquired` → released via `release()` (reports the error) or drop (logs it)
//! - `Acquired` → bare [`Token`] via `into_token()`: the caller now owns the
//!   obligation to call [`Client::release`](crate::Client::release)

use crate::client::Client;
use crate::error::Result;

/// One unit of permission to run a job.
///
/// Carries the byte read from the channel, which must be written back
/// unchanged: some jobserver implementations care about its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u8);

impl Token {
    pub fn new(byte: u8) -> Self {
        Self(byte)
    }

    pub fn byte(self) -> u8 {
        self.0
    }
}

/// A token held by this process, released on drop.
#[must_use = "dropping an Acquired releases its token immediately"]
pub struct Acquired {
    client: Client,
    token: Token,
    released: bool,
}

impl Acquired {
    pub(crate) fn new(client: Client, token: Token) -> Self {
        Self {
            client,
            token,
            released: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Return the token now and report failures instead of logging them.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.client.release(self.token)
    }

    /// Stop tracking the token. It will NOT be returned on drop.
    pub fn into_token(mut self) -> Token {
        self.released = true;
        self.token
    }
}

impl std::fmt::Debug for Acquired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquired")
            .field("token", &self.token)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for Acquired {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.client.release(self.token) {
            tracing::error!(error = %e, "Failed to return token to pool");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{TokenChannel, create_channel};
    use crate::config::ChannelKind;

    fn seeded(dir: &tempfile::TempDir, n: usize) -> (TokenChannel, Client) {
        let kind = ChannelKind::Fifo {
            path: dir.path().join("tokens"),
        };
        let channel = create_channel(&kind).unwrap();
        channel.seed(n).unwrap();
        let client = Client::connect(&channel.descriptor()).unwrap();
        (channel, client)
    }

    #[test]
    fn drop_returns_token() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, client) = seeded(&dir, 1);

        {
            let _held = client.acquire().unwrap();
            assert!(client.try_acquire().unwrap().is_none());
        }

        assert_eq!(channel.drain().unwrap(), 1);
    }

    #[test]
    fn into_token_leaves_release_to_caller() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, client) = seeded(&dir, 1);

        let token = client.acquire().unwrap().into_token();
        assert_eq!(channel.drain().unwrap(), 0);

        client.release(token).unwrap();
        assert_eq!(channel.drain().unwrap(), 1);
    }

    #[test]
    fn explicit_release_happens_once() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, client) = seeded(&dir, 2);

        let held = client.acquire().unwrap();
        held.release().unwrap();
        assert_eq!(channel.drain().unwrap(), 2);
    }

    #[test]
    fn token_byte_is_echoed() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, client) = seeded(&dir, 0);

        client.release(Token::new(b'z')).unwrap();
        let held = client.acquire().unwrap();
        assert_eq!(held.token().byte(), b'z');
        drop(held);

        // The same byte goes back into the channel.
        let reader = match &channel {
            TokenChannel::Fifo(c) => c.reader().unwrap(),
            TokenChannel::Pipe(_) => unreachable!(),
        };
        assert_eq!(crate::fd::try_read_token(reader).unwrap(), Some(b'z'));
    }
}
