//! Socket transport: WebSocket listeners, connection handles and keepalives.

pub mod websocket;

pub use websocket::{ConnectionHandle, ConnectionId, KeepaliveTimer};
