//! Device clock handshake.
//!
//! A device opens its stream with `Init v1 <monotonic-ms> <wallclock-ms>`.
//! Until that line arrives nothing it sends is relayed live to inspectors.

use crate::error::{RelayError, RelayResult};
use crate::messages::{InitData, HANDSHAKE_VERSION, INIT_PREFIX};

/// Whether a frame claims to be a handshake (it may still be malformed).
pub fn is_init_frame(frame: &str) -> bool {
    frame.starts_with(INIT_PREFIX)
}

/// Parse a full `Init v1 <monotonic> <wallclock>` line.
pub fn parse_init(frame: &str) -> RelayResult<InitData> {
    let mut parts = frame.split(' ');
    if parts.next() != Some(INIT_PREFIX.trim_end()) {
        return Err(RelayError::InvalidHandshake("missing Init prefix".into()));
    }

    let version = parts
        .next()
        .ok_or_else(|| RelayError::InvalidHandshake("missing version".into()))?;
    if version != HANDSHAKE_VERSION {
        return Err(RelayError::InvalidHandshake(format!(
            "unsupported version: {version}"
        )));
    }

    let timestamp = parse_clock(parts.next(), "monotonic")?;
    let date_ms = parse_clock(parts.next(), "wall clock")?;

    if parts.next().is_some() {
        return Err(RelayError::InvalidHandshake("trailing fields".into()));
    }

    Ok(InitData { timestamp, date_ms })
}

/// Digits with an optional fractional part: `[0-9]+(\.[0-9]+)?`.
fn is_plain_decimal(raw: &str) -> bool {
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    match raw.split_once('.') {
        Some((whole, fraction)) => all_digits(whole) && all_digits(fraction),
        None => all_digits(raw),
    }
}

fn parse_clock(field: Option<&str>, name: &str) -> RelayResult<f64> {
    let raw = field.ok_or_else(|| RelayError::InvalidHandshake(format!("missing {name} clock")))?;
    let bad = || RelayError::InvalidHandshake(format!("bad {name} clock: {raw:?}"));
    if !is_plain_decimal(raw) {
        return Err(bad());
    }
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(bad()),
    }
}
