//! Rolling 24-hour abuse counters.
//!
//! Connection and password events are kept as timestamps that fall out of the
//! window; message events are plain counters reset by a daily timer. Every
//! check records first and compares second, so a limit of `L` lets `L` events
//! through and trips on the next one. Tripping is fatal for the whole relay.

use logrelay_core::{RateLimitKind, RelayError, RelayResult};
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error};

/// Length of the rolling window.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Thresholds of the five counters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_wrong_password_limit")]
    pub wrong_password: u64,
    #[serde(default = "default_connection_limit")]
    pub inspector_connection: u64,
    #[serde(default = "default_connection_limit")]
    pub device_connection: u64,
    #[serde(default = "default_device_message_limit")]
    pub device_message: u64,
    #[serde(default = "default_inspector_message_limit")]
    pub inspector_message: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            wrong_password: default_wrong_password_limit(),
            inspector_connection: default_connection_limit(),
            device_connection: default_connection_limit(),
            device_message: default_device_message_limit(),
            inspector_message: default_inspector_message_limit(),
        }
    }
}

fn default_wrong_password_limit() -> u64 {
    100
}
fn default_connection_limit() -> u64 {
    1_000
}
fn default_device_message_limit() -> u64 {
    10_000_000
}
fn default_inspector_message_limit() -> u64 {
    100_000
}

/// Timestamps of recent events inside a sliding window.
#[derive(Debug)]
struct EventWindow {
    limit: u64,
    window: Duration,
    events: VecDeque<Instant>,
}

impl EventWindow {
    fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            events: VecDeque::new(),
        }
    }

    fn record(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.events.push_back(now);
        self.events.len() as u64 <= self.limit
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.events.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn len(&self) -> u64 {
        self.events.len() as u64
    }
}

/// Plain event counter, reset externally.
#[derive(Debug)]
struct EventCounter {
    limit: u64,
    count: u64,
}

impl EventCounter {
    fn new(limit: u64) -> Self {
        Self { limit, count: 0 }
    }

    fn record(&mut self) -> bool {
        self.count = self.count.saturating_add(1);
        self.count <= self.limit
    }
}

/// The relay's five abuse counters.
#[derive(Debug)]
pub struct RateLimiter {
    wrong_password: EventWindow,
    inspector_connections: EventWindow,
    device_connections: EventWindow,
    device_messages: EventCounter,
    inspector_messages: EventCounter,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            wrong_password: EventWindow::new(config.wrong_password, RATE_LIMIT_WINDOW),
            inspector_connections: EventWindow::new(
                config.inspector_connection,
                RATE_LIMIT_WINDOW,
            ),
            device_connections: EventWindow::new(config.device_connection, RATE_LIMIT_WINDOW),
            device_messages: EventCounter::new(config.device_message),
            inspector_messages: EventCounter::new(config.inspector_message),
        }
    }

    /// Record one event of `kind`; fails once its threshold is exceeded.
    pub fn record(&mut self, kind: RateLimitKind) -> RelayResult<()> {
        self.record_at(kind, Instant::now())
    }

    pub fn record_at(&mut self, kind: RateLimitKind, now: Instant) -> RelayResult<()> {
        let allowed = match kind {
            RateLimitKind::WrongPassword => self.wrong_password.record(now),
            RateLimitKind::InspectorConnection => self.inspector_connections.record(now),
            RateLimitKind::DeviceConnection => self.device_connections.record(now),
            RateLimitKind::DeviceMessage => self.device_messages.record(),
            RateLimitKind::InspectorMessage => self.inspector_messages.record(),
        };
        if allowed {
            Ok(())
        } else {
            error!(kind = %kind, count = self.count(kind), "rate limit exceeded");
            Err(RelayError::RateLimitExceeded(kind))
        }
    }

    /// Current value of a counter.
    pub fn count(&self, kind: RateLimitKind) -> u64 {
        match kind {
            RateLimitKind::WrongPassword => self.wrong_password.len(),
            RateLimitKind::InspectorConnection => self.inspector_connections.len(),
            RateLimitKind::DeviceConnection => self.device_connections.len(),
            RateLimitKind::DeviceMessage => self.device_messages.count,
            RateLimitKind::InspectorMessage => self.inspector_messages.count,
        }
    }

    /// Drop connection and password events older than the window.
    pub fn prune(&mut self, now: Instant) {
        self.wrong_password.prune(now);
        self.inspector_connections.prune(now);
        self.device_connections.prune(now);
    }

    /// Daily reset of the message counters.
    pub fn reset_message_counters(&mut self) {
        debug!(
            device = self.device_messages.count,
            inspector = self.inspector_messages.count,
            "resetting message counters"
        );
        self.device_messages.count = 0;
        self.inspector_messages.count = 0;
    }
}
