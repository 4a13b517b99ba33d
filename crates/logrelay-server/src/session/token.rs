//! Per-token session state: participants, handshake data, history, expiry.

use super::history::HistoryBuffer;
use crate::transport::{ConnectionHandle, ConnectionId, KeepaliveTimer};
use logrelay_core::messages::{InitSnapshot, TokenListEntry};
use logrelay_core::InitData;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, warn};

/// How a token came to exist, and whether it outlives its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    /// Minted for a device that connected on `!notoken`.
    EphemeralFromDevice,
    /// Pre-registered by an inspector joining an unknown id.
    EphemeralFromInspector,
    /// Kept until its wall-clock expiration, even with nobody attached.
    Persistent,
}

/// Milliseconds since the Unix epoch.
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A live socket attached to a token together with its keepalive.
#[derive(Debug)]
pub struct AttachedConnection {
    conn: ConnectionHandle,
    keepalive: KeepaliveTimer,
}

impl AttachedConnection {
    pub fn new(conn: ConnectionHandle, keepalive: KeepaliveTimer) -> Self {
        Self { conn, keepalive }
    }

    /// Attach `conn` and start pinging it every `period`.
    pub fn with_keepalive(conn: ConnectionHandle, period: Duration) -> Self {
        let keepalive = KeepaliveTimer::start(conn.clone(), period);
        Self::new(conn, keepalive)
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.conn
    }

    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// Stop the keepalive; the socket is already gone.
    fn release(mut self) {
        self.keepalive.cancel();
    }

    /// Stop the keepalive and close the socket.
    fn close(mut self) {
        self.keepalive.cancel();
        self.conn.close();
    }
}

/// State of one device-to-inspectors channel.
#[derive(Debug)]
pub struct TokenMetadata {
    pub id: String,
    pub token_type: TokenType,
    /// Monotonic creation time.
    pub created_at: Instant,
    /// Wall-clock creation time, in Unix milliseconds.
    pub created_date: u64,
    /// Lifetime of the token, in milliseconds.
    pub expiration_delay: u64,
    /// Suffix of this token's disk log file name.
    pub log_suffix: String,
    device: Option<AttachedConnection>,
    inspectors: Vec<AttachedConnection>,
    init_data: Option<InitData>,
    history: HistoryBuffer,
}

impl TokenMetadata {
    pub fn new(
        token_type: TokenType,
        id: impl Into<String>,
        history_size: usize,
        expiration_delay: u64,
    ) -> Self {
        Self::created_on(
            token_type,
            id,
            history_size,
            expiration_delay,
            Instant::now(),
            unix_ms(),
        )
    }

    /// Build a token with explicit creation clocks (restored tokens, tests).
    pub fn created_on(
        token_type: TokenType,
        id: impl Into<String>,
        history_size: usize,
        expiration_delay: u64,
        created_at: Instant,
        created_date: u64,
    ) -> Self {
        let id = id.into();
        Self {
            log_suffix: id.clone(),
            id,
            token_type,
            created_at,
            created_date,
            expiration_delay,
            device: None,
            inspectors: Vec::new(),
            init_data: None,
            history: HistoryBuffer::new(history_size),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.token_type == TokenType::Persistent
    }

    /// Promote to persistent. There is no way back.
    pub fn mark_persistent(&mut self) {
        self.token_type = TokenType::Persistent;
    }

    pub fn device(&self) -> Option<&ConnectionHandle> {
        self.device.as_ref().map(AttachedConnection::handle)
    }

    /// Attach a device, closing any incumbent first.
    ///
    /// Returns the id of the evicted connection, if there was one.
    pub fn attach_device(&mut self, device: AttachedConnection) -> Option<ConnectionId> {
        let evicted = self.device.take().map(|old| {
            let id = old.id();
            old.close();
            id
        });
        self.device = Some(device);
        evicted
    }

    /// Clear the device slot if `conn` still owns it.
    ///
    /// A close event from a socket that was already evicted is a no-op.
    pub fn detach_device(&mut self, conn: ConnectionId) -> bool {
        match self.device.take() {
            Some(current) if current.id() == conn => {
                current.release();
                true
            }
            other => {
                self.device = other;
                false
            }
        }
    }

    /// Forward a frame to the attached device.
    pub fn send_to_device(&self, frame: &str) -> bool {
        match &self.device {
            Some(device) => match device.handle().send_text(frame) {
                Ok(()) => true,
                Err(e) => {
                    warn!(token = %self.id, error = %e, "failed to forward to device");
                    false
                }
            },
            None => false,
        }
    }

    pub fn add_inspector(&mut self, inspector: AttachedConnection) {
        self.inspectors.push(inspector);
    }

    /// Remove an inspector and cancel its keepalive.
    pub fn remove_inspector(&mut self, conn: ConnectionId) -> bool {
        match self.inspectors.iter().position(|i| i.id() == conn) {
            Some(index) => {
                self.inspectors.remove(index).release();
                true
            }
            None => false,
        }
    }

    pub fn inspector_count(&self) -> usize {
        self.inspectors.len()
    }

    /// Send a frame to every inspector in attach order.
    ///
    /// A failing inspector is logged and skipped. Returns how many succeeded.
    pub fn fan_out(&self, frame: &str) -> usize {
        let mut delivered = 0;
        for inspector in &self.inspectors {
            match inspector.handle().send_text(frame) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(token = %self.id, conn = inspector.id(), error = %e, "failed to forward to inspector");
                }
            }
        }
        delivered
    }

    /// Nobody is attached.
    pub fn is_idle(&self) -> bool {
        self.device.is_none() && self.inspectors.is_empty()
    }

    /// An idle ephemeral token is torn down as soon as its last socket leaves.
    pub fn should_remove_when_idle(&self) -> bool {
        !self.is_persistent() && self.is_idle()
    }

    /// Close every socket and stop every keepalive.
    pub fn close_all(&mut self) {
        if let Some(device) = self.device.take() {
            device.close();
        }
        for inspector in self.inspectors.drain(..) {
            inspector.close();
        }
        debug!(token = %self.id, "closed all connections");
    }

    pub fn init_data(&self) -> Option<InitData> {
        self.init_data
    }

    /// Record the device handshake. Always clears history.
    pub fn set_init_data(&mut self, init: InitData) {
        self.init_data = Some(init);
        self.history.clear();
    }

    pub fn push_history(&mut self, line: String) {
        self.history.push(line);
    }

    pub fn history(&self) -> &HistoryBuffer {
        &self.history
    }

    /// The `Init` payload for a late-joining inspector, if the handshake happened.
    pub fn init_snapshot(&self) -> Option<InitSnapshot> {
        self.init_data.map(|init| {
            InitSnapshot::new(init, self.history.snapshot(), self.history.capacity())
        })
    }

    /// Wall-clock expiration, in Unix milliseconds.
    pub fn expiration_date(&self) -> u64 {
        self.created_date.saturating_add(self.expiration_delay)
    }

    /// Negative once the expiration date has passed. Clamped to the `i64` range.
    pub fn ms_until_expiration(&self, now_ms: u64) -> i64 {
        let remaining = i128::from(self.expiration_date()) - i128::from(now_ms);
        remaining.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
    }

    /// Persistent tokens expire on the wall clock, the others on the monotonic one.
    pub fn is_expired(&self, now: Instant, now_ms: u64) -> bool {
        if self.is_persistent() {
            now_ms >= self.expiration_date()
        } else {
            now.saturating_duration_since(self.created_at)
                > Duration::from_millis(self.expiration_delay)
        }
    }

    /// One row of the `list` roster.
    pub fn listing_entry(&self, now_ms: u64) -> TokenListEntry {
        TokenListEntry {
            token_id: self.id.clone(),
            date: self.created_date,
            timestamp: self.init_data.map(|init| init.timestamp),
            is_persistent: self.is_persistent(),
            ms_until_expiration: self.ms_until_expiration(now_ms),
        }
    }
}
