//! Wire message types shared by devices, inspectors and the relay.
//!
//! Devices and inspectors speak plain text frames. Most frames are opaque log
//! lines relayed verbatim; the structured ones are JSON envelopes of the form
//! `{"type": ..., "value": ...}` defined here.

use serde::{Deserialize, Serialize};

/// Keepalive probe sent by the relay every 10 seconds.
pub const PING: &str = "ping";
/// Keepalive reply expected from devices.
pub const PONG: &str = "pong";
/// Sent once to every accepted device and inspector connection.
pub const ACK: &str = "ack";

/// Prefix of the device clock handshake line.
pub const INIT_PREFIX: &str = "Init ";
/// The only handshake version understood by this relay.
pub const HANDSHAKE_VERSION: &str = "v1";

/// Envelope type tag of the init snapshot.
pub const INIT_TYPE: &str = "Init";
/// Envelope type tag of an inspector evaluation request.
pub const EVAL_TYPE: &str = "eval";
/// Envelope type tags of a device evaluation reply.
pub const EVAL_RESULT_TYPE: &str = "eval-result";
pub const EVAL_ERROR_TYPE: &str = "eval-error";

/// Clock reference a device announces in its `Init` handshake.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitData {
    /// Device monotonic clock, in milliseconds.
    pub timestamp: f64,
    /// Device wall clock, in milliseconds since the Unix epoch.
    pub date_ms: f64,
}

/// `Init` payload sent to inspectors: the clock reference plus buffered history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitSnapshot {
    pub timestamp: f64,
    pub date_ms: f64,
    pub history: Vec<String>,
    pub max_history_size: usize,
}

impl InitSnapshot {
    pub fn new(init: InitData, history: Vec<String>, max_history_size: usize) -> Self {
        Self {
            timestamp: init.timestamp,
            date_ms: init.date_ms,
            history,
            max_history_size,
        }
    }
}

/// An instruction an inspector asks the device to evaluate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvalInstruction {
    /// Correlation id echoed back in the device's `eval-result`/`eval-error`.
    pub id: String,
    pub instruction: String,
}

/// Messages an inspector may send to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", deny_unknown_fields)]
pub enum InspectorRequest {
    #[serde(rename = "eval")]
    Eval(EvalInstruction),
}

/// One row of the `list` roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenListEntry {
    pub token_id: String,
    /// Wall-clock creation time, in milliseconds since the Unix epoch.
    pub date: u64,
    /// Monotonic timestamp of the device handshake, if one happened.
    pub timestamp: Option<f64>,
    pub is_persistent: bool,
    pub ms_until_expiration: i64,
}

/// Periodic payload pushed to `list` inspectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenListing {
    pub is_no_token_enabled: bool,
    pub token_list: Vec<TokenListEntry>,
}
