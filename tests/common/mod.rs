#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tokio_util::codec::FramedRead;

use kvgate::codec::FrameCodec;
use kvgate::frame::{self, Decoded, Frame};

/// An in-memory RESP store that understands the commands the client sends: AUTH, SELECT, PING,
/// GET, SET [EX], DEL, INCR, EXPIRE and TTL. Keys expire lazily against a clock that tests can
/// move forward with `advance`.
pub struct TestServer {
    pub addr: SocketAddr,
    state: Arc<State>,
}

struct State {
    keys: Mutex<HashMap<(u32, String), Value>>,
    clock_offset: Mutex<Duration>,
    username: Option<String>,
    password: Option<String>,
    connections: AtomicUsize,
    commands: Mutex<Vec<String>>,
    kill: broadcast::Sender<()>,
}

struct Value {
    data: Bytes,
    expires_at: Option<Instant>,
}

impl TestServer {
    pub async fn start() -> TestServer {
        TestServer::start_with_auth(None, None).await
    }

    pub async fn start_with_auth(username: Option<&str>, password: Option<&str>) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (kill, _) = broadcast::channel(1);

        let state = Arc::new(State {
            keys: Mutex::new(HashMap::new()),
            clock_offset: Mutex::new(Duration::ZERO),
            username: username.map(String::from),
            password: password.map(String::from),
            connections: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            kill,
        });

        tokio::spawn({
            let state = state.clone();
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    state.connections.fetch_add(1, Ordering::SeqCst);
                    let killed = state.kill.subscribe();
                    tokio::spawn(handle_connection(socket, state.clone(), killed));
                }
            }
        });

        TestServer { addr, state }
    }

    pub fn url(&self) -> String {
        format!("redis://{}", self.addr)
    }

    /// Number of TCP connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Every command received, arguments joined by spaces.
    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }

    pub fn count_commands(&self, prefix: &str) -> usize {
        self.commands()
            .iter()
            .filter(|command| command.starts_with(prefix))
            .count()
    }

    /// Drops every open connection without replying.
    pub fn kill_connections(&self) {
        let _ = self.state.kill.send(());
    }

    /// Moves the store's clock forward.
    pub fn advance(&self, by: Duration) {
        *self.state.clock_offset.lock().unwrap() += by;
    }

    pub fn get(&self, db: u32, key: &str) -> Option<Bytes> {
        let now = self.state.now();
        let mut keys = self.state.keys.lock().unwrap();
        live(&mut keys, db, key, now).map(|value| value.data.clone())
    }

    /// Writes a key directly, bypassing any client.
    pub fn put(&self, db: u32, key: &str, data: &str, ttl: Option<Duration>) {
        let now = self.state.now();
        self.state.keys.lock().unwrap().insert(
            (db, key.to_string()),
            Value {
                data: Bytes::copy_from_slice(data.as_bytes()),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
    }

    /// Remaining TTL in whole seconds, rounded up. `None` when the key is missing or persistent.
    pub fn ttl(&self, db: u32, key: &str) -> Option<u64> {
        let now = self.state.now();
        let mut keys = self.state.keys.lock().unwrap();
        live(&mut keys, db, key, now)
            .and_then(|value| value.expires_at)
            .map(|at| (at - now).as_millis().div_ceil(1000) as u64)
    }
}

impl State {
    fn now(&self) -> Instant {
        Instant::now() + *self.clock_offset.lock().unwrap()
    }

    fn execute(&self, args: &[Bytes], session: &mut Session) -> Frame {
        let name = String::from_utf8_lossy(&args[0]).to_uppercase();
        let arg = |i: usize| String::from_utf8_lossy(&args[i]).to_string();

        if name == "AUTH" {
            let (username, password) = match args.len() {
                2 => ("default".to_string(), arg(1)),
                3 => (arg(1), arg(2)),
                _ => return wrong_args(&name),
            };
            let expected_username = self.username.as_deref().unwrap_or("default");
            if self.password.as_deref() == Some(password.as_str()) && username == expected_username
            {
                session.authenticated = true;
                return ok();
            }
            return Frame::Error(
                "WRONGPASS invalid username-password pair or user is disabled.".to_string(),
            );
        }

        if self.password.is_some() && !session.authenticated {
            return Frame::Error("NOAUTH Authentication required.".to_string());
        }

        let now = self.now();
        let db = session.db;
        let mut keys = self.keys.lock().unwrap();

        match (name.as_str(), args.len()) {
            ("PING", 1) => Frame::Simple("PONG".to_string()),
            ("SELECT", 2) => match arg(1).parse::<u32>() {
                Ok(index) if index < 16 => {
                    session.db = index;
                    ok()
                }
                _ => Frame::Error("ERR DB index is out of range".to_string()),
            },
            ("GET", 2) => match live(&mut keys, db, &arg(1), now) {
                Some(value) => Frame::Bulk(value.data.clone()),
                None => Frame::NullBulkString,
            },
            ("SET", 3) | ("SET", 5) => {
                let expires_at = if args.len() == 5 {
                    match (arg(3).to_uppercase().as_str(), arg(4).parse::<u64>()) {
                        ("EX", Ok(seconds)) if seconds > 0 => {
                            Some(now + Duration::from_secs(seconds))
                        }
                        _ => return Frame::Error("ERR syntax error".to_string()),
                    }
                } else {
                    None
                };
                keys.insert(
                    (db, arg(1)),
                    Value {
                        data: args[2].clone(),
                        expires_at,
                    },
                );
                ok()
            }
            ("DEL", n) if n >= 2 => {
                let mut removed = 0;
                for i in 1..n {
                    if live(&mut keys, db, &arg(i), now).is_some() {
                        keys.remove(&(db, arg(i)));
                        removed += 1;
                    }
                }
                Frame::Integer(removed)
            }
            ("INCR", 2) => {
                let key = arg(1);
                let current = match live(&mut keys, db, &key, now) {
                    Some(value) => match std::str::from_utf8(&value.data)
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok())
                    {
                        Some(n) => n,
                        None => {
                            return Frame::Error(
                                "ERR value is not an integer or out of range".to_string(),
                            )
                        }
                    },
                    None => 0,
                };
                let next = current + 1;
                // INCR keeps whatever expiry the key already has.
                let expires_at = keys.get(&(db, key.clone())).and_then(|v| v.expires_at);
                keys.insert(
                    (db, key),
                    Value {
                        data: Bytes::from(next.to_string()),
                        expires_at,
                    },
                );
                Frame::Integer(next)
            }
            ("EXPIRE", 3) => {
                let key = arg(1);
                let Ok(seconds) = arg(2).parse::<i64>() else {
                    return Frame::Error("ERR value is not an integer or out of range".to_string());
                };
                if live(&mut keys, db, &key, now).is_none() {
                    return Frame::Integer(0);
                }
                if seconds <= 0 {
                    keys.remove(&(db, key));
                } else if let Some(value) = keys.get_mut(&(db, key)) {
                    value.expires_at = Some(now + Duration::from_secs(seconds as u64));
                }
                Frame::Integer(1)
            }
            ("TTL", 2) => match live(&mut keys, db, &arg(1), now) {
                None => Frame::Integer(-2),
                Some(Value {
                    expires_at: None, ..
                }) => Frame::Integer(-1),
                Some(Value {
                    expires_at: Some(at),
                    ..
                }) => Frame::Integer((*at - now).as_millis().div_ceil(1000) as i64),
            },
            (
                "PING" | "SELECT" | "GET" | "SET" | "DEL" | "INCR" | "EXPIRE" | "TTL",
                _,
            ) => wrong_args(&name),
            _ => Frame::Error(format!("ERR unknown command '{}'", name)),
        }
    }
}

struct Session {
    authenticated: bool,
    db: u32,
}

/// Returns the key's value unless it has expired, in which case it is removed.
fn live<'a>(
    keys: &'a mut HashMap<(u32, String), Value>,
    db: u32,
    key: &str,
    now: Instant,
) -> Option<&'a Value> {
    let id = (db, key.to_string());
    let expired = keys
        .get(&id)
        .and_then(|value| value.expires_at)
        .is_some_and(|at| at <= now);
    if expired {
        keys.remove(&id);
    }
    keys.get(&id)
}

fn ok() -> Frame {
    Frame::Simple("OK".to_string())
}

fn wrong_args(name: &str) -> Frame {
    Frame::Error(format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_lowercase()
    ))
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<State>,
    mut killed: broadcast::Receiver<()>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut frames = FramedRead::new(reader, FrameCodec::default());
    let mut session = Session {
        authenticated: false,
        db: 0,
    };

    loop {
        let frame = tokio::select! {
            _ = killed.recv() => return,
            frame = frames.next() => match frame {
                Some(Ok(frame)) => frame,
                _ => return,
            },
        };

        let args = match frame {
            Frame::Array(parts) if !parts.is_empty() => parts
                .into_iter()
                .map(|part| match part {
                    Frame::Bulk(bytes) => bytes,
                    other => Bytes::from(other.to_string()),
                })
                .collect::<Vec<_>>(),
            _ => return,
        };

        state.commands.lock().unwrap().push(
            args.iter()
                .map(|arg| String::from_utf8_lossy(arg).to_string())
                .collect::<Vec<_>>()
                .join(" "),
        );

        let reply = state.execute(&args, &mut session);
        if writer.write_all(&reply.serialize()).await.is_err() {
            return;
        }
    }
}

/// A listener with nothing behind it: tests accept and drive the socket by hand.
pub async fn scripted_listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("redis://{}", listener.local_addr().unwrap());
    (listener, url)
}

/// Reads exactly one command from a socket driven by hand.
pub async fn read_command(socket: &mut TcpStream, buffer: &mut BytesMut) -> Option<Frame> {
    loop {
        match frame::decode(&buffer[..]).unwrap() {
            Decoded::Complete { frame, consumed } => {
                let _ = buffer.split_to(consumed);
                return Some(frame);
            }
            Decoded::Incomplete => {
                if socket.read_buf(buffer).await.ok()? == 0 {
                    return None;
                }
            }
        }
    }
}

/// A URL for a port nobody listens on.
pub async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("redis://{}", addr)
}
