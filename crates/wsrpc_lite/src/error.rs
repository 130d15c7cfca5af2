use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The `error` object carried inside a response envelope.
///
/// This is the server's wire shape, not a client-side failure. Code
/// [`WireError::CODE_EOF`] is the end-of-stream sentinel: it signals
/// normal completion of a stream, not an application failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("wsrpc: {code}, message={message}")]
pub struct WireError {
    pub code: i64,
    pub message: String,
    /// Optional error payload, carried only by some server errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl WireError {
    /// End of contents in a stream request. Not a failure.
    pub const CODE_EOF: i64 = 205;
    /// The request was malformed or missing required fields.
    pub const CODE_INVALID_REQUEST: i64 = -32600;
    /// No handler registered for the requested method.
    pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
    /// A handler-originated server error.
    pub const CODE_SERVER_ERROR: i64 = -32000;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// The sentinel ending a stream without error.
    pub fn eof() -> Self {
        Self::new(Self::CODE_EOF, "EOF")
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(Self::CODE_INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            Self::CODE_METHOD_NOT_FOUND,
            format!("method not found: {method}"),
        )
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(Self::CODE_SERVER_ERROR, message)
    }

    /// Whether this is the stream-completion sentinel rather than a
    /// failure.
    pub fn is_terminal(&self) -> bool {
        self.code == Self::CODE_EOF
    }
}

/// Errors surfaced when submitting requests to the client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The endpoint could not be turned into socket and stateless URLs.
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),

    /// A submission contained no calls.
    #[error("empty submission")]
    EmptySubmission,

    /// An outgoing envelope group failed to serialize.
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// The stateless HTTP client could not be built.
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),

    /// The client worker has shut down.
    #[error("client closed")]
    Closed,
}

/// Errors completing one submitted call.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CallError {
    /// The server answered with an error envelope.
    #[error(transparent)]
    Rpc(#[from] WireError),

    /// The client shut down before a response arrived.
    #[error("client closed before a response arrived")]
    Closed,
}
