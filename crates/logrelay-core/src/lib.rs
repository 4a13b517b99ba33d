//! logrelay-core: Shared protocol library for the log relay.
//!
//! Provides the wire message types, JSON envelope codec, the device clock
//! handshake parser and the connect-path grammars of both relay endpoints.

pub mod codec;
pub mod error;
pub mod handshake;
pub mod messages;
pub mod path;

// Re-export commonly used items at crate root.
pub use codec::{decode_inspector_request, disk_init_frame, inspector_init_frame, is_eval_reply};
pub use error::{RateLimitKind, RelayError, RelayResult};
pub use handshake::{is_init_frame, parse_init};
pub use messages::{InitData, InitSnapshot, InspectorRequest, ACK, PING, PONG};
pub use path::{DevicePath, InspectorCommand, InspectorRoute};
