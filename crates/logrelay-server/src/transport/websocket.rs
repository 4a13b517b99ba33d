//! WebSocket listeners and per-connection plumbing using tokio-tungstenite.
//!
//! Every accepted socket is split in two: a writer task that drains an
//! unbounded channel into the sink, and a [`WebSocketReader`] driven by the
//! connection handler. The relay only ever talks to a socket through its
//! [`ConnectionHandle`], so fan-out is a non-blocking enqueue.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use logrelay_core::{RelayError, RelayResult, PING};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

/// Unique id of one accepted socket, used to tell a stale close apart from
/// the connection that replaced it.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// What a connection's writer task can be asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Cloneable sending side of a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    remote: SocketAddr,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    /// Wrap an outbound channel, assigning a fresh connection id.
    pub fn new(remote: SocketAddr, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            tx,
        }
    }

    /// A handle plus the receiving end of its channel.
    pub fn channel(remote: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(remote, tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Queue a text frame. Fails only once the writer task is gone.
    pub fn send_text(&self, text: impl Into<String>) -> RelayResult<()> {
        self.tx
            .send(Outbound::Text(text.into()))
            .map_err(|_| RelayError::Transport(format!("connection {} is closed", self.id)))
    }

    /// Ask the writer to send a close frame and shut the socket.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// Repeating `ping` sender bound to one connection.
///
/// Cancelling is idempotent and also happens on drop.
#[derive(Debug, Default)]
pub struct KeepaliveTimer {
    task: Option<AbortHandle>,
}

impl KeepaliveTimer {
    /// Start sending `ping` every `period`, first one after one period.
    pub fn start(conn: ConnectionHandle, period: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                if conn.send_text(PING).is_err() {
                    debug!(conn = conn.id(), "keepalive stopped: connection closed");
                    break;
                }
            }
        });
        Self {
            task: Some(task.abort_handle()),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for KeepaliveTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Bind a TCP listener for one of the relay endpoints.
pub async fn bind(addr: SocketAddr) -> RelayResult<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| RelayError::Transport(format!("WS bind failed on {addr}: {e}")))?;
    info!(addr = %listener.local_addr()?, "WebSocket listener started");
    Ok(listener)
}

/// Perform the WebSocket upgrade, capturing the request path.
pub async fn accept_with_path(
    stream: TcpStream,
) -> RelayResult<(WebSocketStream<TcpStream>, String)> {
    let mut path = String::new();
    let ws_stream = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            Ok(response)
        },
    )
    .await
    .map_err(|e| RelayError::Transport(format!("WS handshake failed: {e}")))?;
    Ok((ws_stream, path))
}

/// Receiving half of an accepted connection.
pub struct WebSocketReader {
    stream: SplitStream<WebSocketStream<TcpStream>>,
    writer_done: oneshot::Receiver<()>,
}

impl WebSocketReader {
    /// Next text frame, or `None` once either side closed the connection.
    ///
    /// Binary frames are skipped. Protocol pings are answered by tungstenite.
    pub async fn next_text(&mut self) -> RelayResult<Option<String>> {
        loop {
            tokio::select! {
                _ = &mut self.writer_done => return Ok(None),
                msg = self.stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Err(RelayError::Transport(format!("WS recv failed: {e}")));
                    }
                },
            }
        }
    }
}

/// Split an upgraded socket into a [`ConnectionHandle`] and its reader.
pub fn serve(
    ws_stream: WebSocketStream<TcpStream>,
    remote: SocketAddr,
) -> (ConnectionHandle, WebSocketReader) {
    let (sink, stream) = ws_stream.split();
    let (handle, rx) = ConnectionHandle::channel(remote);
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(run_writer(handle.id(), sink, rx, done_tx));
    (
        handle,
        WebSocketReader {
            stream,
            writer_done: done_rx,
        },
    )
}

async fn run_writer(
    id: ConnectionId,
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    done: oneshot::Sender<()>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Text(text) => {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(conn = id, error = %e, "WS send failed");
                    break;
                }
            }
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
    let _ = done.send(());
    debug!(conn = id, "writer finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[tokio::test]
    async fn handles_get_distinct_ids() {
        let (a, _rx_a) = ConnectionHandle::channel(addr());
        let (b, _rx_b) = ConnectionHandle::channel(addr());
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn send_after_receiver_dropped_fails() {
        let (handle, rx) = ConnectionHandle::channel(addr());
        handle.send_text("hello").unwrap();
        drop(rx);
        assert!(handle.send_text("again").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_until_cancelled() {
        let (handle, mut rx) = ConnectionHandle::channel(addr());
        let mut timer = KeepaliveTimer::start(handle, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(rx.recv().await, Some(Outbound::Text(PING.into())));
        assert_eq!(rx.recv().await, Some(Outbound::Text(PING.into())));

        timer.cancel();
        timer.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }
}
