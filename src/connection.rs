use std::collections::VecDeque;
use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::client::ClientConfig;
use crate::codec::FrameCodec;
use crate::frame::Frame;
use crate::target::{Auth, ConnectionTarget};
use crate::ClientError;

type Reply = Result<Frame, ClientError>;

/// A command waiting to be written, and where its reply goes.
struct Request {
    frame: Frame,
    reply: oneshot::Sender<Reply>,
}

/// Handle to a live connection. The socket itself is owned by a background task; handles only
/// queue requests to it.
#[derive(Debug, Clone)]
pub(crate) struct Connection {
    requests: mpsc::UnboundedSender<Request>,
    shutdown: CancellationToken,
}

impl Connection {
    /// Connects, authenticates and selects the database, then hands the socket to the connection
    /// task. Any failure drops the socket.
    pub(crate) async fn open(config: &ClientConfig) -> Result<Connection, ClientError> {
        let target = &config.target;
        debug!(store = %target, "connecting");

        let connect = TcpStream::connect((target.host.as_str(), target.port));
        let stream = match config.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| ClientError::ConnectTimeout)??,
            None => connect.await?,
        };
        stream.set_nodelay(true).ok();
        let peer = stream.peer_addr()?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, FrameCodec::new(config.max_frame_size));
        let mut writer = FramedWrite::new(write_half, FrameCodec::new(config.max_frame_size));

        handshake(target, &mut reader, &mut writer).await?;
        debug!(%peer, "connected");

        let (requests, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(run(peer, reader, writer, receiver, shutdown.clone()));

        Ok(Connection { requests, shutdown })
    }

    /// Queues a command. The receiver resolves once the matching reply is decoded or the
    /// connection dies.
    pub(crate) fn send(&self, frame: Frame) -> Result<oneshot::Receiver<Reply>, ClientError> {
        let (reply, receiver) = oneshot::channel();
        self.requests
            .send(Request { frame, reply })
            .map_err(|_| ClientError::ConnectionLost)?;
        Ok(receiver)
    }

    /// True once the connection task has exited.
    pub(crate) fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn handshake(
    target: &ConnectionTarget,
    reader: &mut FramedRead<OwnedReadHalf, FrameCodec>,
    writer: &mut FramedWrite<OwnedWriteHalf, FrameCodec>,
) -> Result<(), ClientError> {
    if let Some(auth) = target.auth() {
        let command = match auth {
            Auth::Password(password) => Frame::command(["AUTH", password]),
            Auth::UsernamePassword(username, password) => {
                Frame::command(["AUTH", username, password])
            }
        };
        debug!("authenticating");
        expect_ok(round_trip(reader, writer, command).await?)?;
    }

    if let Some(db) = target.select() {
        let db = db.to_string();
        debug!(db = %db, "selecting database");
        expect_ok(round_trip(reader, writer, Frame::command(["SELECT", db.as_str()])).await?)?;
    }

    Ok(())
}

/// Writes one command and reads its reply. Only used before the connection task exists.
async fn round_trip(
    reader: &mut FramedRead<OwnedReadHalf, FrameCodec>,
    writer: &mut FramedWrite<OwnedWriteHalf, FrameCodec>,
    command: Frame,
) -> Result<Frame, ClientError> {
    writer.send(command).await?;

    match reader.next().await {
        Some(frame) => frame,
        None => Err(ClientError::ConnectionLost),
    }
}

fn expect_ok(frame: Frame) -> Result<(), ClientError> {
    match frame {
        Frame::Simple(s) if s == "OK" => Ok(()),
        Frame::Error(msg) => Err(ClientError::Handshake(msg)),
        frame => Err(ClientError::UnexpectedReply(frame)),
    }
}

/// Owns the socket, the decode buffer (inside `reader`) and the pipeline of pending replies.
///
/// The connection is not multiplexed, so the Nth reply belongs to the Nth command written. Replies
/// are matched by position only. Writes happen on their own task so that replies keep being read
/// while a large command is still going out.
#[instrument(name = "connection", skip_all, fields(peer = %peer))]
async fn run(
    peer: SocketAddr,
    mut reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut requests: mpsc::UnboundedReceiver<Request>,
    shutdown: CancellationToken,
) {
    let mut pending: VecDeque<oneshot::Sender<Reply>> = VecDeque::new();
    let (outgoing, commands) = mpsc::unbounded_channel();
    let mut writes = tokio::spawn(write_commands(writer, commands));

    let cause = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break ClientError::Closed,
            request = requests.recv() => {
                // Every handle is gone.
                let Some(request) = request else {
                    break ClientError::Closed;
                };

                trace!("sending command: {}", request.frame);

                // Queued before the write so a failed write rejects it along with the rest.
                pending.push_back(request.reply);
                if outgoing.send(request.frame).is_err() {
                    break ClientError::ConnectionLost;
                }
            }
            written = &mut writes => {
                // The writer only stops on its own when the socket fails.
                break match written {
                    Ok(Err(err)) => err,
                    _ => ClientError::ConnectionLost,
                };
            }
            frame = reader.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => break err,
                    None => break ClientError::ConnectionLost,
                };

                let Some(reply) = pending.pop_front() else {
                    warn!("reply without a pending command: {}", frame);
                    break ClientError::UnexpectedReply(frame);
                };

                let result = match frame {
                    Frame::Error(msg) => Err(ClientError::Server(msg)),
                    frame => Ok(frame),
                };

                // The caller may have stopped waiting, the reply is dropped then.
                let _ = reply.send(result);
            }
        }
    };

    requests.close();
    // Dropping the write half closes our side of the socket.
    writes.abort();

    let error = match cause {
        ClientError::Closed => ClientError::Closed,
        cause => {
            debug!(pending = pending.len(), "connection lost: {}", cause);
            ClientError::ConnectionLost
        }
    };

    for reply in pending.drain(..) {
        let _ = reply.send(Err(error.clone()));
    }
    while let Ok(request) = requests.try_recv() {
        let _ = request.reply.send(Err(error.clone()));
    }

    debug!("connection closed");
}

/// Writes commands in the order they are queued. Returns only when the socket fails or the queue
/// is closed.
async fn write_commands(
    mut writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut commands: mpsc::UnboundedReceiver<Frame>,
) -> Result<(), ClientError> {
    while let Some(command) = commands.recv().await {
        writer.send(command).await?;
    }
    Ok(())
}
