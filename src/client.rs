use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tracing::debug;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::connection::Connection;
use crate::frame::Frame;
use crate::target::ConnectionTarget;
use crate::ClientError;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub target: ConnectionTarget,
    /// Largest reply accepted before the stream is considered corrupt.
    pub max_frame_size: usize,
    /// Bound on TCP connect. The handshake and commands are never timed out by the client.
    pub connect_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn new(target: ConnectionTarget) -> Self {
        Self {
            target,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: None,
        }
    }

    pub fn from_url(url: &str) -> Result<Self, ClientError> {
        Ok(Self::new(ConnectionTarget::parse(url)?))
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

/// Remaining lifetime of a key, as reported by TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// Seconds until the key expires.
    Expires(u64),
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<Connection, ClientError>>>;

enum State {
    Idle,
    /// Every caller arriving while a connect is in flight awaits this same attempt.
    Connecting(ConnectAttempt),
    Connected(Connection),
    Closed,
}

/// A client for a RESP key-value store over a single connection.
///
/// Cloning is cheap and every clone shares the connection. The connection is opened on first use
/// and reopened on the next call after it is lost. Commands from concurrent callers are pipelined
/// over the one socket.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    state: Mutex<State>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Client {
        Client {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::Idle),
            }),
        }
    }

    pub fn from_url(url: &str) -> Result<Client, ClientError> {
        Ok(Client::new(ClientConfig::from_url(url)?))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Opens the connection unless one is already live or being opened.
    pub async fn ensure_connected(&self) -> Result<(), ClientError> {
        self.connection().await.map(|_| ())
    }

    async fn connection(&self) -> Result<Connection, ClientError> {
        let attempt = {
            let mut state = self.inner.state();

            let in_flight = match &*state {
                State::Closed => return Err(ClientError::Closed),
                State::Connected(conn) if !conn.is_closed() => return Ok(conn.clone()),
                State::Connecting(attempt) => Some(attempt.clone()),
                State::Idle | State::Connected(_) => None,
            };

            match in_flight {
                Some(attempt) => attempt,
                None => {
                    let config = self.inner.config.clone();
                    let attempt = async move { Connection::open(&config).await }
                        .boxed()
                        .shared();
                    *state = State::Connecting(attempt.clone());
                    attempt
                }
            }
        };

        let result = attempt.clone().await;

        let mut state = self.inner.state();
        if matches!(&*state, State::Closed) {
            if let Ok(conn) = &result {
                conn.shutdown();
            }
            return Err(ClientError::Closed);
        }

        // Only the first waiter to return records the outcome.
        if matches!(&*state, State::Connecting(current) if current.ptr_eq(&attempt)) {
            *state = match &result {
                Ok(conn) => State::Connected(conn.clone()),
                Err(err) => {
                    debug!("connect failed: {}", err);
                    State::Idle
                }
            };
        }

        result
    }

    /// Sends one command and waits for its reply. Error replies come back as
    /// [`ClientError::Server`].
    ///
    /// There is no timeout. A caller that stops waiting does not withdraw the command: it has been
    /// or will be executed and its reply is discarded.
    pub async fn send_command<I, T>(&self, parts: I) -> Result<Frame, ClientError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let command = Frame::command(parts);
        let conn = self.connection().await?;
        let reply = conn.send(command)?;

        reply.await.map_err(|_| ClientError::ConnectionLost)?
    }

    /// Drops the connection, failing everything still pending with [`ClientError::Closed`]. Later
    /// calls fail the same way.
    pub fn close(&self) {
        let mut state = self.inner.state();
        if let State::Connected(conn) = &*state {
            conn.shutdown();
        }
        *state = State::Closed;
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        match self.send_command(["PING"]).await? {
            Frame::Simple(s) if s == "PONG" => Ok(()),
            frame => Err(ClientError::UnexpectedReply(frame)),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, ClientError> {
        match self.send_command(["GET", key]).await? {
            Frame::Bulk(bytes) => Ok(Some(bytes)),
            Frame::NullBulkString => Ok(None),
            frame => Err(ClientError::UnexpectedReply(frame)),
        }
    }

    pub async fn set(&self, key: &str, value: &[u8]) -> Result<(), ClientError> {
        let reply = self.send_command([&b"SET"[..], key.as_bytes(), value]).await?;
        expect_ok(reply)
    }

    /// SET with an expiry in seconds.
    pub async fn set_ex(&self, key: &str, value: &[u8], seconds: u64) -> Result<(), ClientError> {
        let seconds = seconds.to_string();
        let reply = self
            .send_command([
                &b"SET"[..],
                key.as_bytes(),
                value,
                &b"EX"[..],
                seconds.as_bytes(),
            ])
            .await?;
        expect_ok(reply)
    }

    /// Deletes the given keys and returns how many existed.
    pub async fn del(&self, keys: &[&str]) -> Result<i64, ClientError> {
        let mut parts = Vec::with_capacity(keys.len() + 1);
        parts.push("DEL");
        parts.extend_from_slice(keys);

        expect_integer(self.send_command(parts).await?)
    }

    pub async fn incr(&self, key: &str) -> Result<i64, ClientError> {
        expect_integer(self.send_command(["INCR", key]).await?)
    }

    /// Sets a timeout on the key. Returns false when the key does not exist.
    pub async fn expire(&self, key: &str, seconds: u64) -> Result<bool, ClientError> {
        let seconds = seconds.to_string();
        let reply = self
            .send_command(["EXPIRE", key, seconds.as_str()])
            .await?;
        Ok(expect_integer(reply)? == 1)
    }

    pub async fn ttl(&self, key: &str) -> Result<KeyTtl, ClientError> {
        match expect_integer(self.send_command(["TTL", key]).await?)? {
            -2 => Ok(KeyTtl::Missing),
            -1 => Ok(KeyTtl::Persistent),
            seconds if seconds >= 0 => Ok(KeyTtl::Expires(seconds as u64)),
            other => Err(ClientError::UnexpectedReply(Frame::Integer(other))),
        }
    }
}

fn expect_ok(frame: Frame) -> Result<(), ClientError> {
    match frame {
        Frame::Simple(s) if s == "OK" => Ok(()),
        frame => Err(ClientError::UnexpectedReply(frame)),
    }
}

fn expect_integer(frame: Frame) -> Result<i64, ClientError> {
    match frame {
        Frame::Integer(i) => Ok(i),
        frame => Err(ClientError::UnexpectedReply(frame)),
    }
}
