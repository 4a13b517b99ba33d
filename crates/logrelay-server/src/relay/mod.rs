//! Relay core: per-frame routing and the shared hub every connection drives.

pub mod hub;
pub mod router;

pub use hub::{HubSettings, RelayHub, KEEPALIVE_PERIOD};
pub use router::Route;
