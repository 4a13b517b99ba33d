//! Authentication and abuse limiting.

pub mod rate_limit;

pub use rate_limit::{RateLimitConfig, RateLimiter};

/// Whether a supplied password satisfies the configured one.
///
/// With no password configured every connection is accepted.
pub fn password_matches(configured: Option<&str>, supplied: Option<&str>) -> bool {
    match configured {
        None => true,
        Some(expected) => supplied == Some(expected),
    }
}
