//! JSON text framing for the structured relay messages.
//!
//! Wire format: `{"type": "<tag>", "value": <payload>}`

use crate::error::RelayResult;
use crate::messages::{
    InitData, InitSnapshot, InspectorRequest, EVAL_ERROR_TYPE, EVAL_RESULT_TYPE, INIT_TYPE,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct Envelope<'a, T> {
    #[serde(rename = "type")]
    kind: &'a str,
    value: T,
}

#[derive(Deserialize)]
struct TypeTag {
    #[serde(rename = "type")]
    kind: String,
}

/// Encode a payload into a `{"type", "value"}` envelope.
pub fn envelope_encode<T: Serialize>(kind: &str, value: &T) -> RelayResult<String> {
    Ok(serde_json::to_string(&Envelope { kind, value })?)
}

/// The `Init` frame sent to inspectors, carrying the buffered history.
pub fn inspector_init_frame(snapshot: &InitSnapshot) -> RelayResult<String> {
    envelope_encode(INIT_TYPE, snapshot)
}

/// The leaner `Init` frame written to disk logs (no history).
pub fn disk_init_frame(init: &InitData) -> RelayResult<String> {
    envelope_encode(INIT_TYPE, init)
}

/// Decode an inspector frame. Anything but a well-formed `eval` request fails.
pub fn decode_inspector_request(frame: &str) -> RelayResult<InspectorRequest> {
    Ok(serde_json::from_str(frame)?)
}

/// Whether a device frame is a JSON `eval-result`/`eval-error` reply.
pub fn is_eval_reply(frame: &str) -> bool {
    if !frame.starts_with('{') {
        return false;
    }
    match serde_json::from_str::<TypeTag>(frame) {
        Ok(tag) => tag.kind == EVAL_RESULT_TYPE || tag.kind == EVAL_ERROR_TYPE,
        Err(_) => false,
    }
}
