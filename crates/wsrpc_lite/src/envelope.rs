//! Wire envelope building and parsing.
//!
//! One envelope serializes as a single JSON object, two or more as a JSON
//! array. Decoding applies the same rule in reverse: a lone object is
//! treated as a one-element array.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WireError;

/// Protocol tag sent on every request.
pub const JSONRPC_VERSION: &str = "2.0";

/// Distinguishes single-shot calls from server-push streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    #[serde(rename = "CALL")]
    Call,
    #[serde(rename = "STREAM")]
    Stream,
}

/// One request or response unit, exchanged over either transport.
///
/// Requests carry `kind`, `method` and optionally `params`/`header`;
/// responses carry `result` or `error` and may omit everything else but
/// `id`. Unknown fields (such as the server-generated job id) are
/// ignored on decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jsonrpc: String,
    pub id: u64,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Kind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Opaque continuation cursor. Servers attach it to stream events;
    /// re-submissions echo the latest observed value back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Envelope {
    /// Build a request envelope under the given id.
    pub fn request(
        id: u64,
        kind: Kind,
        method: impl Into<String>,
        params: Option<Value>,
        header: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            kind: Some(kind),
            method: Some(method.into()),
            params,
            header,
            result: None,
            error: None,
        }
    }

    /// Whether the envelope carries the end-of-stream sentinel.
    pub fn is_terminal(&self) -> bool {
        self.error.as_ref().is_some_and(WireError::is_terminal)
    }
}

/// Serialize one envelope as a single object, several as an array.
pub fn encode_group(group: &[Envelope]) -> serde_json::Result<String> {
    match group {
        [single] => serde_json::to_string(single),
        many => serde_json::to_string(many),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<Envelope>),
    One(Envelope),
}

/// Decode an inbound payload: either one envelope or an array of them.
pub fn decode_payload(data: &str) -> serde_json::Result<Vec<Envelope>> {
    match serde_json::from_str(data)? {
        OneOrMany::Many(group) => Ok(group),
        OneOrMany::One(envelope) => Ok(vec![envelope]),
    }
}
