//! Session management: tokens, their history, the registry and expiry.

pub mod history;
pub mod registry;
pub mod sweeper;
pub mod token;

pub use registry::SessionRegistry;
pub use sweeper::sweep_expired;
pub use token::{unix_ms, AttachedConnection, TokenMetadata, TokenType};
