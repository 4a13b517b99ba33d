//! Classification and fan-out of device frames.
//!
//! Each frame yields up to three variants: what inspectors receive, what goes
//! to the disk log, and what is appended to the token's history. Nothing is
//! fanned out to inspectors before the token's `Init` handshake.

use crate::session::TokenMetadata;
use crate::storage::DiskLog;
use logrelay_core::{
    disk_init_frame, inspector_init_frame, is_eval_reply, is_init_frame, parse_init, PONG,
};
use tracing::{debug, warn};

/// Why a frame was not relayed at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    TooLong,
    Pong,
    MalformedInit,
}

/// The variants of one device frame. `None` means "not sent there".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Forwarding {
    pub to_inspectors: Option<String>,
    pub to_disk: Option<String>,
    pub to_history: Option<String>,
}

impl Forwarding {
    fn everywhere(frame: &str) -> Self {
        Self {
            to_inspectors: Some(frame.to_string()),
            to_disk: Some(frame.to_string()),
            to_history: Some(frame.to_string()),
        }
    }
}

/// Outcome of routing one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Dropped(DropReason),
    Forward(Forwarding),
}

/// Number of UTF-16 code units in `text`, the unit device size caps use.
pub fn utf16_len(text: &str) -> usize {
    text.chars().map(char::len_utf16).sum()
}

/// Routes device frames for every token.
#[derive(Debug, Clone)]
pub struct MessageRouter {
    max_log_length: usize,
    disk_log: Option<DiskLog>,
}

impl MessageRouter {
    pub fn new(max_log_length: usize, disk_log: Option<DiskLog>) -> Self {
        Self {
            max_log_length,
            disk_log,
        }
    }

    /// Classify a frame. A valid `Init` updates the token's handshake data.
    pub fn classify(&self, token: &mut TokenMetadata, frame: &str) -> Route {
        if utf16_len(frame) > self.max_log_length {
            return Route::Dropped(DropReason::TooLong);
        }

        if frame == PONG {
            return Route::Dropped(DropReason::Pong);
        }

        if is_init_frame(frame) {
            let init = match parse_init(frame) {
                Ok(init) => init,
                Err(e) => {
                    warn!(token = %token.id, error = %e, "bad Init format");
                    return Route::Dropped(DropReason::MalformedInit);
                }
            };
            token.set_init_data(init);

            let to_inspectors = token
                .init_snapshot()
                .and_then(|snapshot| inspector_init_frame(&snapshot).ok());
            let to_disk = disk_init_frame(&init).ok();
            return Route::Forward(Forwarding {
                to_inspectors,
                to_disk,
                to_history: None,
            });
        }

        if is_eval_reply(frame) {
            return Route::Forward(Forwarding {
                to_inspectors: Some(frame.to_string()),
                ..Forwarding::default()
            });
        }

        Route::Forward(Forwarding::everywhere(frame))
    }

    /// Apply a routing decision to the token: history, disk, then inspectors.
    pub fn deliver(&self, token: &mut TokenMetadata, forwarding: Forwarding) {
        if let Some(line) = forwarding.to_history {
            token.push_history(line);
        }

        if let (Some(disk), Some(line)) = (&self.disk_log, forwarding.to_disk) {
            disk.append(&token.log_suffix, &line);
        }

        if let Some(frame) = forwarding.to_inspectors {
            if token.init_data().is_some() {
                token.fan_out(&frame);
            } else {
                debug!(token = %token.id, "holding back frame until Init");
            }
        }
    }

    /// Classify and deliver one device frame.
    pub fn route(&self, token: &mut TokenMetadata, frame: &str) -> Route {
        let route = self.classify(token, frame);
        if let Route::Forward(forwarding) = &route {
            self.deliver(token, forwarding.clone());
        }
        route
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AttachedConnection, TokenType};
    use crate::transport::websocket::Outbound;
    use crate::transport::{ConnectionHandle, KeepaliveTimer};
    use serde_json::{json, Value};
    use tokio::sync::mpsc::UnboundedReceiver;

    const INIT: &str = "Init v1 1000 1700000000000";

    fn token_with_inspector(history: usize) -> (TokenMetadata, UnboundedReceiver<Outbound>) {
        let mut token = TokenMetadata::new(TokenType::EphemeralFromInspector, "abc123", history, 60_000);
        let (handle, rx) = ConnectionHandle::channel("127.0.0.1:9".parse().unwrap());
        token.add_inspector(AttachedConnection::new(handle, KeepaliveTimer::default()));
        (token, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            frames.push(text);
        }
        frames
    }

    #[test]
    fn utf16_length_counts_surrogate_pairs() {
        assert_eq!(utf16_len("abc"), 3);
        assert_eq!(utf16_len("é"), 1);
        assert_eq!(utf16_len("😀"), 2);
    }

    #[tokio::test]
    async fn oversized_frames_are_dropped_everywhere() {
        let router = MessageRouter::new(5, None);
        let (mut token, mut rx) = token_with_inspector(10);
        router.route(&mut token, INIT);
        drain(&mut rx);

        assert_eq!(router.route(&mut token, "123456"), Route::Dropped(DropReason::TooLong));
        assert_eq!(router.route(&mut token, "😀😀😀"), Route::Dropped(DropReason::TooLong));
        assert!(token.history().snapshot().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn pong_is_dropped() {
        let router = MessageRouter::new(3000, None);
        let (mut token, _rx) = token_with_inspector(10);
        assert_eq!(router.route(&mut token, "pong"), Route::Dropped(DropReason::Pong));
    }

    #[tokio::test]
    async fn lines_before_init_are_buffered_but_not_forwarded() {
        let router = MessageRouter::new(3000, None);
        let (mut token, mut rx) = token_with_inspector(10);

        router.route(&mut token, "early line");
        assert_eq!(token.history().snapshot(), vec!["early line"]);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn init_resets_history_and_opens_the_gate() {
        let router = MessageRouter::new(3000, None);
        let (mut token, mut rx) = token_with_inspector(10);
        router.route(&mut token, "early line");

        let route = router.route(&mut token, INIT);
        let Route::Forward(forwarding) = route else {
            panic!("Init was dropped");
        };
        assert_eq!(forwarding.to_history, None);
        let disk: Value = serde_json::from_str(forwarding.to_disk.as_deref().unwrap()).unwrap();
        assert_eq!(
            disk,
            json!({"type": "Init", "value": {"timestamp": 1000.0, "dateMs": 1_700_000_000_000.0}})
        );

        router.route(&mut token, "1000.00 [log] hello");
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        let init: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(init["type"], "Init");
        assert_eq!(init["value"]["history"], json!([]));
        assert_eq!(init["value"]["maxHistorySize"], 10);
        assert_eq!(frames[1], "1000.00 [log] hello");
        assert_eq!(token.history().snapshot(), vec!["1000.00 [log] hello"]);
    }

    #[tokio::test]
    async fn malformed_init_is_dropped() {
        let router = MessageRouter::new(3000, None);
        let (mut token, mut rx) = token_with_inspector(10);
        router.route(&mut token, "kept");
        assert_eq!(
            router.route(&mut token, "Init v1 soon 1700000000000"),
            Route::Dropped(DropReason::MalformedInit)
        );
        assert!(token.init_data().is_none());
        assert_eq!(token.history().snapshot().len(), 1);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn eval_replies_only_reach_inspectors() {
        let router = MessageRouter::new(3000, None);
        let (mut token, mut rx) = token_with_inspector(10);
        router.route(&mut token, INIT);
        drain(&mut rx);

        let reply = r#"{"type":"eval-result","value":{"id":"7","result":"2"}}"#;
        let route = router.route(&mut token, reply);
        assert_eq!(
            route,
            Route::Forward(Forwarding {
                to_inspectors: Some(reply.to_string()),
                to_disk: None,
                to_history: None,
            })
        );
        assert_eq!(drain(&mut rx), vec![reply.to_string()]);
        assert!(token.history().snapshot().is_empty());
    }

    #[tokio::test]
    async fn other_json_is_a_plain_line() {
        let router = MessageRouter::new(3000, None);
        let (mut token, _rx) = token_with_inspector(10);
        let line = r#"{"type":"metrics","value":1}"#;
        assert_eq!(router.route(&mut token, line), Route::Forward(Forwarding::everywhere(line)));
    }

    #[tokio::test]
    async fn history_keeps_the_latest_lines() {
        let router = MessageRouter::new(3000, None);
        let (mut token, _rx) = token_with_inspector(2);
        router.route(&mut token, INIT);
        for line in ["one", "two", "three"] {
            router.route(&mut token, line);
        }
        assert_eq!(token.init_snapshot().unwrap().history, vec!["two", "three"]);
    }

    #[tokio::test]
    async fn disk_receives_lines_and_lean_init() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskLog::spawn(dir.path());
        let router = MessageRouter::new(3000, Some(disk.clone()));
        let (mut token, _rx) = token_with_inspector(10);

        router.route(&mut token, "before");
        router.route(&mut token, INIT);
        router.route(&mut token, r#"{"type":"eval-error","value":{"id":"1"}}"#);
        router.route(&mut token, "after");
        disk.flush().await;

        let path = dir.path().join(crate::storage::disk_log::log_file_name(
            chrono::Utc::now().date_naive(),
            "abc123",
        ));
        let lines: Vec<String> = std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "before");
        assert!(lines[1].starts_with(r#"{"type":"Init""#));
        assert!(!lines[1].contains("history"));
        assert_eq!(lines[2], "after");
    }
}
