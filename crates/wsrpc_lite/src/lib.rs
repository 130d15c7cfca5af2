//! A bidirectional RPC client that multiplexes single-shot calls and
//! server-push streams over one persistent websocket, degrading
//! permanently to a polled stateless HTTP transport when the socket
//! proves unreliable.
//!
//! Streams survive the failover: every event carries an opaque
//! continuation header, and on the stateless path the client re-issues
//! the still-open requests of a submission together, each echoing its
//! own latest cursor, so the server can resume where it left off.
//!
//! All protocol state is owned by a single worker task; callers talk to
//! it through [`WsrpcClient`], a cheap-to-clone handle.

mod batch;
pub mod client;
pub mod envelope;
pub mod error;
mod outbox;
mod registry;
mod transport;

pub use client::{
    CallHandle, CallSpec, ClientConfig, StreamHandle, StreamUpdate, WsrpcClient,
};
pub use envelope::{Envelope, Kind, decode_payload, encode_group};
pub use error::{CallError, ClientError, WireError};
pub use transport::ConnectionState;
