//! Core server: accepts device and inspector sockets and drives the hub.
//!
//! Owns both listeners, the shared [`RelayHub`] and the background
//! maintenance tasks. A tripped rate limit is reported back to [`run`] over a
//! channel; `run` then closes every socket, drops both listeners and returns
//! the error.
//!
//! [`run`]: LogRelayServer::run

use crate::config::ServerConfig;
use crate::relay::hub::now;
use crate::relay::{RelayHub, Route};
use crate::storage::{DiskLog, PersistentTokenStore};
use crate::transport::websocket::{self, WebSocketReader};
use crate::transport::ConnectionHandle;
use logrelay_core::path::{parse_device_path, parse_inspector_route, split_password};
use logrelay_core::{InspectorCommand, InspectorRoute, RelayError, RelayResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How often `list` inspectors get a fresh roster.
pub const LIST_INTERVAL: Duration = Duration::from_secs(3);
/// How often expired tokens and stale limiter timestamps are dropped.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// How often the message counters start over.
pub const COUNTER_RESET_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

type SharedHub = Arc<Mutex<RelayHub>>;

/// State shared by every connection task.
#[derive(Clone)]
struct RelayContext {
    hub: SharedHub,
    fatal_tx: mpsc::UnboundedSender<RelayError>,
}

/// The log relay server instance.
pub struct LogRelayServer {
    hub: SharedHub,
    device_listener: TcpListener,
    inspector_listener: TcpListener,
}

impl LogRelayServer {
    /// Restore persisted tokens and bind both endpoints.
    pub async fn bind(config: ServerConfig) -> RelayResult<Self> {
        let (store, restored) =
            PersistentTokenStore::initialize_with_path(&config.persistent_store).await;

        let disk_log = if config.disk_logging {
            info!(dir = %config.log_dir.display(), "disk logging enabled");
            Some(DiskLog::spawn(&config.log_dir))
        } else {
            None
        };

        let mut hub = RelayHub::new(config.hub_settings(), &config.limits, disk_log, Some(store));
        hub.restore(restored);

        let device_addr = resolve(&config.host, config.device_port).await?;
        let inspector_addr = resolve(&config.host, config.inspector_port).await?;
        let device_listener = websocket::bind(device_addr).await?;
        let inspector_listener = websocket::bind(inspector_addr).await?;

        Ok(Self {
            hub: Arc::new(Mutex::new(hub)),
            device_listener,
            inspector_listener,
        })
    }

    pub fn device_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.device_listener.local_addr()?)
    }

    pub fn inspector_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.inspector_listener.local_addr()?)
    }

    /// Accept connections until a fatal error. Never returns `Ok`.
    pub async fn run(self) -> RelayResult<()> {
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let ctx = RelayContext {
            hub: self.hub.clone(),
            fatal_tx,
        };

        let sweeper = spawn_sweeper(self.hub.clone());
        let counter_reset = spawn_counter_reset(self.hub.clone());

        info!(
            device = %self.device_addr()?,
            inspector = %self.inspector_addr()?,
            "logrelay-server ready"
        );

        let fatal = loop {
            tokio::select! {
                accepted = self.device_listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            let result = ctx.handle_device(stream, remote).await;
                            ctx.finish(remote, "device", result);
                        });
                    }
                    Err(e) => warn!(error = %e, "device accept failed"),
                },
                accepted = self.inspector_listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            let result = ctx.handle_inspector(stream, remote).await;
                            ctx.finish(remote, "inspector", result);
                        });
                    }
                    Err(e) => warn!(error = %e, "inspector accept failed"),
                },
                Some(err) = fatal_rx.recv() => break err,
            }
        };

        error!(error = %fatal, "fatal error, shutting down");
        sweeper.abort();
        counter_reset.abort();
        let closed = self.hub.lock().await.close_all();
        info!(tokens = closed, "closed all tokens");
        Err(fatal)
    }
}

impl RelayContext {
    /// Log the outcome of a connection task, escalating fatal errors.
    fn finish(&self, remote: SocketAddr, side: &str, result: RelayResult<()>) {
        match result {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                let _ = self.fatal_tx.send(e);
            }
            Err(e) => warn!(remote = %remote, side, error = %e, "connection rejected"),
        }
    }

    async fn handle_device(&self, stream: TcpStream, remote: SocketAddr) -> RelayResult<()> {
        let (ws, path) = websocket::accept_with_path(stream).await?;
        let (conn, mut reader) = websocket::serve(ws, remote);
        debug!(remote = %remote, path = %path, conn = conn.id(), "device socket");

        let connected = match parse_device_path(&path) {
            Ok(device_path) => self.hub.lock().await.connect_device(device_path, conn.clone()),
            Err(e) => Err(e),
        };
        let token_id = match connected {
            Ok(id) => id,
            Err(e) => {
                conn.close();
                return Err(e);
            }
        };

        let result = self.device_loop(&token_id, &conn, &mut reader).await;
        self.hub.lock().await.disconnect_device(&token_id, conn.id());
        result
    }

    async fn device_loop(
        &self,
        token_id: &str,
        conn: &ConnectionHandle,
        reader: &mut WebSocketReader,
    ) -> RelayResult<()> {
        loop {
            let frame = match reader.next_text().await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => {
                    debug!(token = %token_id, conn = conn.id(), error = %e, "device read failed");
                    return Ok(());
                }
            };

            let routed = self.hub.lock().await.device_message(token_id, conn.id(), &frame);
            if let Some(Route::Dropped(reason)) = routed? {
                debug!(token = %token_id, ?reason, "device frame dropped");
            }
        }
    }

    async fn handle_inspector(&self, stream: TcpStream, remote: SocketAddr) -> RelayResult<()> {
        let (ws, path) = websocket::accept_with_path(stream).await?;
        let (conn, mut reader) = websocket::serve(ws, remote);
        debug!(remote = %remote, path = %path, conn = conn.id(), "inspector socket");

        let route = match self.authorize_inspector(&path).await {
            Ok(route) => route,
            Err(e) => {
                conn.close();
                return Err(e);
            }
        };

        if route.command == Some(InspectorCommand::List) {
            self.list_loop(&conn, &mut reader).await;
            conn.close();
            return Ok(());
        }

        let connected = self.hub.lock().await.connect_inspector(&route, conn.clone());
        let token_id = match connected {
            Ok(id) => id,
            Err(e) => {
                conn.close();
                return Err(e);
            }
        };

        let result = self.inspector_loop(&token_id, &conn, &mut reader).await;
        self.hub.lock().await.disconnect_inspector(&token_id, conn.id());
        result
    }

    /// Check the password segment (if one is configured) and parse the rest.
    async fn authorize_inspector(&self, path: &str) -> RelayResult<InspectorRoute> {
        let mut hub = self.hub.lock().await;
        let rest = if hub.settings().password.is_some() {
            let (supplied, rest) = split_password(path);
            hub.authorize(supplied)?;
            rest
        } else {
            path
        };
        drop(hub);
        parse_inspector_route(rest)
    }

    async fn inspector_loop(
        &self,
        token_id: &str,
        conn: &ConnectionHandle,
        reader: &mut WebSocketReader,
    ) -> RelayResult<()> {
        loop {
            let frame = match reader.next_text().await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => {
                    debug!(token = %token_id, conn = conn.id(), error = %e, "inspector read failed");
                    return Ok(());
                }
            };

            let forwarded = self.hub.lock().await.inspector_message(token_id, &frame)?;
            if !forwarded {
                debug!(token = %token_id, "eval request not delivered");
            }
        }
    }

    /// Push the token roster every [`LIST_INTERVAL`] until the socket closes.
    async fn list_loop(&self, conn: &ConnectionHandle, reader: &mut WebSocketReader) {
        info!(remote = %conn.remote(), conn = conn.id(), "list inspector connected");
        let mut ticker = tokio::time::interval(LIST_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let listing = {
                        let mut hub = self.hub.lock().await;
                        let (now, now_ms) = now();
                        hub.sweep(now, now_ms);
                        hub.listing(now_ms)
                    };
                    let json = match serde_json::to_string(&listing) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, "cannot encode token list");
                            continue;
                        }
                    };
                    if conn.send_text(json).is_err() {
                        break;
                    }
                }
                msg = reader.next_text() => match msg {
                    Ok(Some(_)) => debug!(conn = conn.id(), "ignoring message from list inspector"),
                    Ok(None) | Err(_) => break,
                },
            }
        }
        info!(conn = conn.id(), "list inspector disconnected");
    }
}

/// Every [`SWEEP_INTERVAL`]: prune limiter windows and evict expired tokens.
fn spawn_sweeper(hub: SharedHub) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let (now, now_ms) = now();
            let mut hub = hub.lock().await;
            hub.prune_rate_limits(now);
            let evicted = hub.sweep(now, now_ms);
            info!(evicted = evicted.len(), remaining = hub.registry().size(), "sweep done");
        }
    })
}

/// Every [`COUNTER_RESET_INTERVAL`]: zero the message counters.
fn spawn_counter_reset(hub: SharedHub) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(COUNTER_RESET_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            hub.lock().await.reset_message_counters();
            debug!("message counters reset");
        }
    })
}

async fn resolve(host: &str, port: u16) -> RelayResult<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| RelayError::Config(format!("cannot resolve {host}:{port}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use logrelay_core::{RateLimitKind, ACK, PING};
    use serde_json::Value;
    use std::path::Path;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_config(dir: &Path) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            device_port: 0,
            inspector_port: 0,
            persistent_store: dir.join("persistent-tokens.json"),
            log_dir: dir.join("logs"),
            ..ServerConfig::default()
        }
    }

    struct Running {
        device: SocketAddr,
        inspector: SocketAddr,
        task: JoinHandle<RelayResult<()>>,
    }

    async fn start(config: ServerConfig) -> Running {
        let server = LogRelayServer::bind(config).await.unwrap();
        let device = server.device_addr().unwrap();
        let inspector = server.inspector_addr().unwrap();
        Running {
            device,
            inspector,
            task: tokio::spawn(server.run()),
        }
    }

    async fn connect(addr: SocketAddr, path: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
        ws
    }

    /// Next text frame that is not a keepalive, or `None` once closed.
    async fn recv(ws: &mut Client) -> Option<String> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for a frame");
            match msg {
                Some(Ok(Message::Text(text))) if text == PING => continue,
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn send(ws: &mut Client, text: &str) {
        ws.send(Message::Text(text.into())).await.unwrap();
    }

    #[tokio::test]
    async fn scenario_a_line_reaches_waiting_inspector() {
        let dir = tempfile::tempdir().unwrap();
        let relay = start(test_config(dir.path())).await;

        let mut inspector = connect(relay.inspector, "/abc123").await;
        assert_eq!(recv(&mut inspector).await.as_deref(), Some(ACK));

        let mut device = connect(relay.device, "/abc123").await;
        assert_eq!(recv(&mut device).await.as_deref(), Some(ACK));
        send(&mut device, "Init v1 1000 1700000000000").await;
        send(&mut device, "1000.00 [log] hello").await;

        let init: Value = serde_json::from_str(&recv(&mut inspector).await.unwrap()).unwrap();
        assert_eq!(init["type"], "Init");
        assert_eq!(init["value"]["timestamp"], 1000.0);
        assert_eq!(init["value"]["history"], serde_json::json!([]));
        assert_eq!(recv(&mut inspector).await.as_deref(), Some("1000.00 [log] hello"));
        relay.task.abort();
    }

    #[tokio::test]
    async fn scenario_b_late_inspector_catches_up() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            history_size: 2,
            ..test_config(dir.path())
        };
        let relay = start(config).await;

        let mut first = connect(relay.inspector, "/hist").await;
        recv(&mut first).await;
        let mut device = connect(relay.device, "/hist").await;
        recv(&mut device).await;

        send(&mut device, "Init v1 5 1700000000000").await;
        for line in ["l1", "l2", "l3"] {
            send(&mut device, line).await;
        }
        // Once the first inspector saw l3 the history is settled.
        recv(&mut first).await;
        for line in ["l1", "l2", "l3"] {
            assert_eq!(recv(&mut first).await.as_deref(), Some(line));
        }

        let mut late = connect(relay.inspector, "/hist").await;
        assert_eq!(recv(&mut late).await.as_deref(), Some(ACK));
        let init: Value = serde_json::from_str(&recv(&mut late).await.unwrap()).unwrap();
        assert_eq!(init["value"]["history"], serde_json::json!(["l2", "l3"]));
        assert_eq!(init["value"]["maxHistorySize"], 2);

        send(&mut device, "l4").await;
        assert_eq!(recv(&mut late).await.as_deref(), Some("l4"));
        relay.task.abort();
    }

    #[tokio::test]
    async fn scenario_c_third_wrong_password_stops_the_relay() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig {
            password: Some("pw".into()),
            ..test_config(dir.path())
        };
        config.limits.wrong_password = 2;
        let relay = start(config).await;

        for _ in 0..2 {
            let mut inspector = connect(relay.inspector, "/bad/tok").await;
            assert_eq!(recv(&mut inspector).await, None);
        }
        assert!(!relay.task.is_finished());

        let mut inspector = connect(relay.inspector, "/bad/tok").await;
        assert_eq!(recv(&mut inspector).await, None);

        let result = tokio::time::timeout(Duration::from_secs(5), relay.task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(RelayError::RateLimitExceeded(RateLimitKind::WrongPassword))
        ));
        assert!(connect_async(format!("ws://{}/pw/tok", relay.inspector)).await.is_err());
        assert!(connect_async(format!("ws://{}/!notoken/pw", relay.device)).await.is_err());
    }

    #[tokio::test]
    async fn device_message_flood_stops_the_relay() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.limits.device_message = 2;
        let relay = start(config).await;

        let mut device = connect(relay.device, "/!notoken").await;
        assert_eq!(recv(&mut device).await.as_deref(), Some(ACK));
        for line in ["one", "two", "three"] {
            send(&mut device, line).await;
        }

        let result = tokio::time::timeout(Duration::from_secs(5), relay.task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(RelayError::RateLimitExceeded(RateLimitKind::DeviceMessage))
        ));
        assert!(connect_async(format!("ws://{}/!notoken", relay.device)).await.is_err());
        assert!(connect_async(format!("ws://{}/abc", relay.inspector)).await.is_err());
    }

    #[tokio::test]
    async fn scenario_d_new_device_replaces_old_one() {
        let dir = tempfile::tempdir().unwrap();
        let relay = start(test_config(dir.path())).await;

        let mut inspector = connect(relay.inspector, "/t1").await;
        recv(&mut inspector).await;

        let mut first = connect(relay.device, "/t1").await;
        assert_eq!(recv(&mut first).await.as_deref(), Some(ACK));
        let mut second = connect(relay.device, "/t1").await;
        assert_eq!(recv(&mut second).await.as_deref(), Some(ACK));
        assert_eq!(recv(&mut first).await, None);

        send(&mut second, "Init v1 1 1700000000000").await;
        send(&mut second, "from second").await;
        recv(&mut inspector).await;
        assert_eq!(recv(&mut inspector).await.as_deref(), Some("from second"));
        relay.task.abort();
    }

    #[tokio::test]
    async fn unknown_token_and_bad_paths_are_closed() {
        let dir = tempfile::tempdir().unwrap();
        let relay = start(test_config(dir.path())).await;

        let mut device = connect(relay.device, "/missing").await;
        assert_eq!(recv(&mut device).await, None);

        let mut inspector = connect(relay.inspector, "/BadToken").await;
        assert_eq!(recv(&mut inspector).await, None);

        let mut inspector = connect(relay.inspector, "/!bogus/abc").await;
        assert_eq!(recv(&mut inspector).await, None);

        let mut inspector = connect(relay.inspector, "/abc/18446744073709551615").await;
        assert_eq!(recv(&mut inspector).await, None);
        relay.task.abort();
    }

    #[tokio::test]
    async fn inspector_password_is_required() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            password: Some("pw".into()),
            ..test_config(dir.path())
        };
        let relay = start(config).await;

        let mut wrong = connect(relay.inspector, "/nope/tok").await;
        assert_eq!(recv(&mut wrong).await, None);

        let mut right = connect(relay.inspector, "/pw/tok").await;
        assert_eq!(recv(&mut right).await.as_deref(), Some(ACK));

        let mut device = connect(relay.device, "/!notoken/nope").await;
        assert_eq!(recv(&mut device).await, None);
        let mut device = connect(relay.device, "/!notoken/pw").await;
        assert_eq!(recv(&mut device).await.as_deref(), Some(ACK));
        relay.task.abort();
    }

    #[tokio::test]
    async fn eval_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let relay = start(test_config(dir.path())).await;

        let mut inspector = connect(relay.inspector, "/ev").await;
        recv(&mut inspector).await;
        let mut device = connect(relay.device, "/ev").await;
        recv(&mut device).await;
        send(&mut device, "Init v1 1 1700000000000").await;
        recv(&mut inspector).await;

        let request = r#"{"type":"eval","value":{"id":"1","instruction":"1+1"}}"#;
        send(&mut inspector, "not an eval").await;
        send(&mut inspector, request).await;
        assert_eq!(recv(&mut device).await.as_deref(), Some(request));

        let reply = r#"{"type":"eval-result","value":{"id":"1","result":"2"}}"#;
        send(&mut device, reply).await;
        assert_eq!(recv(&mut inspector).await.as_deref(), Some(reply));
        relay.task.abort();
    }

    #[tokio::test]
    async fn persisted_token_survives_restart_and_is_listed() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("persistent-tokens.json");

        let relay = start(test_config(dir.path())).await;
        let mut inspector = connect(relay.inspector, "/!persist/keep").await;
        assert_eq!(recv(&mut inspector).await.as_deref(), Some(ACK));

        let store = PersistentTokenStore::new(&store_path);
        for _ in 0..100 {
            if !store.read_records().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        relay.task.abort();
        drop(inspector);

        let relay = start(test_config(dir.path())).await;
        let mut list = connect(relay.inspector, "/!list").await;
        let roster: Value = serde_json::from_str(&recv(&mut list).await.unwrap()).unwrap();
        assert_eq!(roster["isNoTokenEnabled"], true);
        let tokens = roster["tokenList"].as_array().unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0]["tokenId"], "keep");
        assert_eq!(tokens[0]["isPersistent"], true);
        assert!(tokens[0]["msUntilExpiration"].as_i64().unwrap() > 0);

        // The restored token accepts its device right away.
        let mut device = connect(relay.device, "/keep").await;
        assert_eq!(recv(&mut device).await.as_deref(), Some(ACK));
        relay.task.abort();
    }
}
