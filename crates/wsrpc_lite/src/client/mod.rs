//! Client-side API for wsrpc_lite.
//!
//! `WsrpcClient` is a cheap-to-clone handle onto one client instance;
//! all protocol state lives on a single worker task that every clone
//! talks to through a command channel.
//!
//! # Example
//!
//! ```ignore
//! use wsrpc_lite::{CallSpec, ClientConfig, StreamUpdate, WsrpcClient};
//!
//! let client = WsrpcClient::new(ClientConfig::new("localhost:8080/ws"))?;
//!
//! // Single-shot call
//! let reply = client
//!     .call(CallSpec::new("square").with_params(7.into()))
//!     .await?
//!     .await?;
//!
//! // Server-push stream
//! let mut ticks = client.stream(CallSpec::new("countdown")).await?;
//! while let Some(update) = ticks.next_update().await {
//!     match update {
//!         StreamUpdate::Event(env) => println!("{:?}", env.result),
//!         StreamUpdate::Error(err) => eprintln!("{err}"),
//!         StreamUpdate::Complete(_) => break,
//!     }
//! }
//! ```

mod config;
mod handle;
mod worker;

pub use config::ClientConfig;
pub use handle::{CallHandle, CallSpec, StreamHandle, StreamUpdate};

use tokio::sync::{mpsc, oneshot, watch};

use crate::error::ClientError;
use crate::transport::ConnectionState;
use worker::{Command, Worker};

/// Handle to one wsrpc client instance.
///
/// Clones share the same connection and state. The worker stops when
/// every clone (and every outstanding stream handle) is gone, or on
/// [`WsrpcClient::shutdown`].
#[derive(Clone)]
pub struct WsrpcClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl WsrpcClient {
    /// Spawn a client against the configured endpoint.
    ///
    /// With `disable_websocket` set the persistent socket is skipped and
    /// the stateless transport polls from the start.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let (commands, state) = Worker::spawn(config)?;
        Ok(Self { commands, state })
    }

    /// Submit one call. The returned handle resolves independently with
    /// the decoded response envelope.
    pub async fn call(&self, call: CallSpec) -> Result<CallHandle, ClientError> {
        let mut handles = self.call_batch(vec![call]).await?;
        handles.pop().ok_or(ClientError::Closed)
    }

    /// Submit several calls as one atomic group. Each handle resolves or
    /// rejects independently.
    pub async fn call_batch(&self, calls: Vec<CallSpec>) -> Result<Vec<CallHandle>, ClientError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Call {
                calls,
                ack: ack_tx,
            })
            .map_err(|_| ClientError::Closed)?;
        ack_rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Open one server-push stream.
    pub async fn stream(&self, call: CallSpec) -> Result<StreamHandle, ClientError> {
        let mut handles = self.stream_batch(vec![call]).await?;
        handles.pop().ok_or(ClientError::Closed)
    }

    /// Open several streams as one batch. The batch is re-submitted as a
    /// group after a transport failover so every member keeps receiving
    /// events.
    pub async fn stream_batch(
        &self,
        calls: Vec<CallSpec>,
    ) -> Result<Vec<StreamHandle>, ClientError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Stream {
                calls,
                commands: self.commands.clone(),
                ack: ack_tx,
            })
            .map_err(|_| ClientError::Closed)?;
        ack_rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Current connection lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch for connection state transitions.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stop the worker. Outstanding calls resolve with
    /// [`crate::CallError::Closed`]; open streams end without a terminal
    /// update.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}
