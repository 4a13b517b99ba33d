//! The relay's shared state and every connection event applied to it.
//!
//! One [`RelayHub`] owns the registry, the rate limiter, the router and the
//! persistent store. Connection handlers lock it for the duration of a single
//! event and never await while holding it, so events are applied one at a
//! time and fan-out to a token's inspectors keeps arrival order.

use super::router::{MessageRouter, Route};
use crate::auth::{password_matches, RateLimitConfig, RateLimiter};
use crate::session::{
    sweep_expired, unix_ms, AttachedConnection, SessionRegistry, TokenMetadata, TokenType,
};
use crate::storage::{address_suffix, DiskLog, PersistedToken, PersistentTokenStore};
use crate::transport::{ConnectionHandle, ConnectionId};
use logrelay_core::messages::TokenListing;
use logrelay_core::path::validate_token_id;
use logrelay_core::{
    decode_inspector_request, inspector_init_frame, DevicePath, InspectorCommand, InspectorRoute,
    RateLimitKind, RelayError, RelayResult, ACK,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Keepalive period of every device and inspector connection.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(10);

/// Behaviour knobs of the hub, resolved from the server configuration.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub password: Option<String>,
    pub history_size: usize,
    /// Default token lifetime, in milliseconds.
    pub max_token_duration_ms: u64,
    /// Longest relayed device frame, in UTF-16 code units.
    pub max_log_length: usize,
    pub no_token_mode: bool,
    pub keepalive_period: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            password: None,
            history_size: 1000,
            max_token_duration_ms: 24 * 60 * 60 * 1000,
            max_log_length: 3000,
            no_token_mode: true,
            keepalive_period: KEEPALIVE_PERIOD,
        }
    }
}

/// Shared relay state.
pub struct RelayHub {
    settings: HubSettings,
    registry: SessionRegistry,
    limiter: RateLimiter,
    router: MessageRouter,
    store: Option<PersistentTokenStore>,
}

impl RelayHub {
    pub fn new(
        settings: HubSettings,
        limits: &RateLimitConfig,
        disk_log: Option<DiskLog>,
        store: Option<PersistentTokenStore>,
    ) -> Self {
        Self {
            router: MessageRouter::new(settings.max_log_length, disk_log),
            settings,
            registry: SessionRegistry::new(),
            limiter: RateLimiter::new(limits),
            store,
        }
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Register tokens restored from the persistent store.
    pub fn restore(&mut self, tokens: Vec<TokenMetadata>) {
        for token in tokens {
            if self.registry.find_index(&token.id).is_some() {
                warn!(token = %token.id, "duplicate persisted token ignored");
                continue;
            }
            self.registry.insert(token);
        }
    }

    /// Check a supplied password, counting failures.
    pub fn authorize(&mut self, supplied: Option<&str>) -> RelayResult<()> {
        if password_matches(self.settings.password.as_deref(), supplied) {
            return Ok(());
        }
        self.limiter.record(RateLimitKind::WrongPassword)?;
        Err(RelayError::WrongPassword)
    }

    pub fn prune_rate_limits(&mut self, now: Instant) {
        self.limiter.prune(now);
    }

    pub fn reset_message_counters(&mut self) {
        self.limiter.reset_message_counters();
    }

    /// Attach a device socket. Returns the id of the token it joined.
    ///
    /// Sends `ack` and starts the keepalive on success. Errors leave the
    /// registry untouched; the caller closes the socket.
    pub fn connect_device(&mut self, path: DevicePath, conn: ConnectionHandle) -> RelayResult<String> {
        let token_id = match path {
            DevicePath::NoToken { password } => {
                if !self.settings.no_token_mode {
                    return Err(RelayError::InvalidPath("!notoken mode is disabled".into()));
                }
                self.authorize(password.as_deref())?;
                self.limiter.record(RateLimitKind::DeviceConnection)?;

                let id = self.unused_token_id();
                let token = self.registry.create(
                    TokenType::EphemeralFromDevice,
                    id.clone(),
                    self.settings.history_size,
                    self.settings.max_token_duration_ms,
                );
                token.log_suffix = address_suffix(&conn.remote().ip());
                id
            }
            DevicePath::Token(id) => {
                self.limiter.record(RateLimitKind::DeviceConnection)?;
                if self.registry.find_index(&id).is_none() {
                    return Err(RelayError::TokenNotFound(id));
                }
                id
            }
        };

        let keepalive = self.settings.keepalive_period;
        let token = self
            .registry
            .find_mut(&token_id)
            .ok_or_else(|| RelayError::TokenNotFound(token_id.clone()))?;

        if let Some(evicted) =
            token.attach_device(AttachedConnection::with_keepalive(conn.clone(), keepalive))
        {
            info!(token = %token_id, evicted, conn = conn.id(), "replaced device");
        }
        if let Err(e) = conn.send_text(ACK) {
            debug!(token = %token_id, error = %e, "device ack failed");
        }
        info!(token = %token_id, remote = %conn.remote(), conn = conn.id(), "device connected");
        Ok(token_id)
    }

    /// A device socket closed.
    pub fn disconnect_device(&mut self, token_id: &str, conn: ConnectionId) {
        let Some(token) = self.registry.find_mut(token_id) else {
            debug!(token = %token_id, conn, "device closed after token removal");
            return;
        };
        if !token.detach_device(conn) {
            debug!(token = %token_id, conn, "stale device close ignored");
            return;
        }
        info!(token = %token_id, conn, "device disconnected");
        self.registry.remove_if_idle(token_id);
    }

    /// One text frame from a device.
    pub fn device_message(
        &mut self,
        token_id: &str,
        conn: ConnectionId,
        frame: &str,
    ) -> RelayResult<Option<Route>> {
        self.limiter.record(RateLimitKind::DeviceMessage)?;

        let Some(token) = self.registry.find_mut(token_id) else {
            return Ok(None);
        };
        if token.device().map(ConnectionHandle::id) != Some(conn) {
            debug!(token = %token_id, conn, "frame from a replaced device ignored");
            return Ok(None);
        }
        Ok(Some(self.router.route(token, frame)))
    }

    /// Attach an inspector socket (plain join or `persist`).
    ///
    /// Sends `ack`, then a catch-up `Init` snapshot if the device already did
    /// its handshake. Returns the token id.
    pub fn connect_inspector(
        &mut self,
        route: &InspectorRoute,
        conn: ConnectionHandle,
    ) -> RelayResult<String> {
        self.limiter.record(RateLimitKind::InspectorConnection)?;

        let token_id = route
            .token_id
            .clone()
            .ok_or_else(|| RelayError::InvalidPath("missing token id".into()))?;
        validate_token_id(&token_id)?;

        if self.registry.find_index(&token_id).is_none() {
            self.registry.create(
                TokenType::EphemeralFromInspector,
                token_id.clone(),
                self.settings.history_size,
                self.settings.max_token_duration_ms,
            );
        }

        let keepalive = self.settings.keepalive_period;
        let token = self
            .registry
            .find_mut(&token_id)
            .ok_or_else(|| RelayError::TokenNotFound(token_id.clone()))?;

        if let Some(delay) = route.expiration_override {
            debug!(token = %token_id, delay_ms = delay, "expiration override");
            token.expiration_delay = delay;
        }

        token.add_inspector(AttachedConnection::with_keepalive(conn.clone(), keepalive));
        if let Err(e) = conn.send_text(ACK) {
            debug!(token = %token_id, error = %e, "inspector ack failed");
        }

        if let Some(snapshot) = token.init_snapshot() {
            match inspector_init_frame(&snapshot) {
                Ok(frame) => {
                    if let Err(e) = conn.send_text(frame) {
                        debug!(token = %token_id, error = %e, "catch-up Init failed");
                    }
                }
                Err(e) => warn!(token = %token_id, error = %e, "cannot encode catch-up Init"),
            }
        }

        if route.command == Some(InspectorCommand::Persist) {
            token.mark_persistent();
            match &self.store {
                Some(store) => {
                    store.add_token(PersistedToken::from_token(token));
                }
                None => warn!(token = %token_id, "persist requested without a store"),
            }
        }

        info!(
            token = %token_id,
            remote = %conn.remote(),
            conn = conn.id(),
            inspectors = token.inspector_count(),
            "inspector connected"
        );
        Ok(token_id)
    }

    /// An inspector socket closed.
    pub fn disconnect_inspector(&mut self, token_id: &str, conn: ConnectionId) {
        let Some(token) = self.registry.find_mut(token_id) else {
            debug!(token = %token_id, conn, "inspector closed after token removal");
            return;
        };
        if token.remove_inspector(conn) {
            info!(token = %token_id, conn, "inspector disconnected");
            self.registry.remove_if_idle(token_id);
        }
    }

    /// One text frame from an inspector. Only `eval` requests are relayed.
    ///
    /// Returns whether the request reached a device.
    pub fn inspector_message(&mut self, token_id: &str, frame: &str) -> RelayResult<bool> {
        self.limiter.record(RateLimitKind::InspectorMessage)?;

        if let Err(e) = decode_inspector_request(frame) {
            warn!(token = %token_id, error = %e, "dropping malformed inspector message");
            return Ok(false);
        }
        match self.registry.find(token_id) {
            Some(token) => Ok(token.send_to_device(frame)),
            None => Ok(false),
        }
    }

    /// Evict expired tokens.
    pub fn sweep(&mut self, now: Instant, now_ms: u64) -> Vec<String> {
        sweep_expired(&mut self.registry, now, now_ms)
    }

    /// The roster pushed to `list` inspectors.
    pub fn listing(&self, now_ms: u64) -> TokenListing {
        TokenListing {
            is_no_token_enabled: self.settings.no_token_mode,
            token_list: self
                .registry
                .iter()
                .map(|token| token.listing_entry(now_ms))
                .collect(),
        }
    }

    /// Close every socket and forget every token. Used on fatal shutdown.
    pub fn close_all(&mut self) -> usize {
        let mut tokens = self.registry.drain_where(|_| true);
        for token in &mut tokens {
            token.close_all();
        }
        tokens.len()
    }

    fn unused_token_id(&self) -> String {
        loop {
            let id = generate_token_id();
            if self.registry.find_index(&id).is_none() {
                return id;
            }
        }
    }
}

/// Generate a random token id (hex-encoded, 8 bytes = 16 lowercase chars).
pub fn generate_token_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

/// Current clocks, for callers outside tests.
pub fn now() -> (Instant, u64) {
    (Instant::now(), unix_ms())
}
