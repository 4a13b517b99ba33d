//! Durable store for persistent tokens.
//!
//! The whole store is one JSON array rewritten on every addition:
//!
//! ```json
//! [{"tokenId": "...", "date": 0, "expirationDate": 0,
//!   "initData": null, "history": {"history": [], "maxHistorySize": 0}}]
//! ```
//!
//! Writes are best-effort: they run in a spawned task and failures are only
//! logged. Concurrent additions are not coalesced, so the last writer wins.

use crate::session::{unix_ms, TokenMetadata, TokenType};
use logrelay_core::{InitData, RelayResult};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// History section of a stored token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StoredHistory {
    pub history: Vec<String>,
    pub max_history_size: usize,
}

/// One record of the store file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedToken {
    pub token_id: String,
    pub date: u64,
    pub expiration_date: u64,
    pub init_data: Option<InitData>,
    pub history: StoredHistory,
}

impl PersistedToken {
    /// Snapshot a live token.
    pub fn from_token(token: &TokenMetadata) -> Self {
        Self {
            token_id: token.id.clone(),
            date: token.created_date,
            expiration_date: token.expiration_date(),
            init_data: token.init_data(),
            history: StoredHistory {
                history: token.history().snapshot(),
                max_history_size: token.history().capacity(),
            },
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiration_date <= now_ms
    }

    /// Rebuild a persistent token, replaying its handshake and history.
    ///
    /// The monotonic creation time is backdated by the wall-clock age so that
    /// age-based checks keep working across restarts.
    pub fn into_token(self, now: Instant, now_ms: u64) -> TokenMetadata {
        let age = Duration::from_millis(now_ms.saturating_sub(self.date));
        let created_at = now.checked_sub(age).unwrap_or(now);
        let mut token = TokenMetadata::created_on(
            TokenType::Persistent,
            self.token_id,
            self.history.max_history_size,
            self.expiration_date.saturating_sub(self.date),
            created_at,
            self.date,
        );
        if let Some(init) = self.init_data {
            token.set_init_data(init);
        }
        for line in self.history.history {
            token.push_history(line);
        }
        token
    }
}

/// Reads and rewrites the persistent token file.
#[derive(Debug, Clone)]
pub struct PersistentTokenStore {
    path: PathBuf,
}

impl PersistentTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Open the store at `path` and restore its non-expired tokens.
    pub async fn initialize_with_path(path: impl Into<PathBuf>) -> (Self, Vec<TokenMetadata>) {
        let store = Self::new(path);
        let tokens = store.load_tokens_at(Instant::now(), unix_ms()).await;
        (store, tokens)
    }

    /// Restore every record still valid at `now_ms`.
    pub async fn load_tokens_at(&self, now: Instant, now_ms: u64) -> Vec<TokenMetadata> {
        let records = self.read_records().await;
        let total = records.len();
        let tokens: Vec<TokenMetadata> = records
            .into_iter()
            .filter(|record| !record.is_expired(now_ms))
            .map(|record| record.into_token(now, now_ms))
            .collect();
        info!(
            path = %self.path.display(),
            restored = tokens.len(),
            expired = total - tokens.len(),
            "loaded persistent tokens"
        );
        tokens
    }

    /// Read the raw records. Missing or malformed files read as empty.
    pub async fn read_records(&self) -> Vec<PersistedToken> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no persistent token file yet");
                return Vec::new();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot read persistent tokens");
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<PersistedToken>>(&content) {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "malformed persistent token file, ignoring its contents"
                );
                Vec::new()
            }
        }
    }

    /// Add `record` in the background. Errors are logged, never returned.
    pub fn add_token(&self, record: PersistedToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let token_id = record.token_id.clone();
            if let Err(e) = store.add_token_at(record, unix_ms()).await {
                error!(
                    path = %store.path.display(),
                    token = %token_id,
                    error = %e,
                    "failed to persist token"
                );
            }
        })
    }

    /// Rewrite the store with `record` added and stale entries dropped.
    pub async fn add_token_at(&self, record: PersistedToken, now_ms: u64) -> RelayResult<()> {
        let mut records = self.read_records().await;
        records.retain(|r| !r.is_expired(now_ms) && r.token_id != record.token_id);
        let token_id = record.token_id.clone();
        records.push(record);

        let json = serde_json::to_string(&records)?;
        self.write_file(&json).await?;
        info!(token = %token_id, stored = records.len(), "token persisted");
        Ok(())
    }

    async fn write_file(&self, contents: &str) -> RelayResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
