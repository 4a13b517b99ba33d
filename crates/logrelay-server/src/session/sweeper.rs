//! Token expiry pass run by the periodic sweep and by `list` inspectors.

use super::registry::SessionRegistry;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Evict every expired token, force-closing its device and inspectors.
///
/// Returns the ids of the evicted tokens. Close handlers of the evicted
/// sockets fire later and find nothing to do.
pub fn sweep_expired(registry: &mut SessionRegistry, now: Instant, now_ms: u64) -> Vec<String> {
    let expired = registry.drain_where(|token| token.is_expired(now, now_ms));
    let mut removed = Vec::with_capacity(expired.len());

    for mut token in expired {
        warn!(
            token = %token.id,
            persistent = token.is_persistent(),
            age_ms = now.saturating_duration_since(token.created_at).as_millis() as u64,
            "token expired"
        );
        token.close_all();
        removed.push(token.id);
    }

    if !removed.is_empty() {
        debug!(count = removed.len(), remaining = registry.size(), "sweep removed tokens");
    }
    removed
}
