//! On-disk state: persistent tokens and per-token log files.

pub mod disk_log;
pub mod persistent;

pub use disk_log::{address_suffix, DiskLog};
pub use persistent::{PersistedToken, PersistentTokenStore};
