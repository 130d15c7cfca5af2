//! Caller-facing request descriptions and completion handles.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::worker::Command;
use crate::envelope::Envelope;
use crate::error::{CallError, WireError};
use crate::registry::CallReply;

/// One request to submit: a method name plus optional params and an
/// optional continuation header to resume from.
#[derive(Debug, Clone, Default)]
pub struct CallSpec {
    pub method: String,
    pub params: Option<Value>,
    pub header: Option<Value>,
}

impl CallSpec {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
            header: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_header(mut self, header: Value) -> Self {
        self.header = Some(header);
        self
    }
}

/// Completion handle for one submitted call.
///
/// Resolves with the response envelope, or rejects with the wire error
/// the server answered with. A call with no response stays pending
/// until the client shuts down.
pub struct CallHandle {
    pub(crate) id: u64,
    pub(crate) reply: oneshot::Receiver<CallReply>,
}

impl CallHandle {
    /// The envelope id assigned to this call.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for CallHandle {
    type Output = Result<Envelope, CallError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.reply).poll(cx) {
            Poll::Ready(Ok(Ok(envelope))) => Poll::Ready(Ok(envelope)),
            Poll::Ready(Ok(Err(err))) => Poll::Ready(Err(CallError::Rpc(err))),
            Poll::Ready(Err(_)) => Poll::Ready(Err(CallError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// One delivery on a stream.
#[derive(Debug, Clone)]
pub enum StreamUpdate {
    /// A server-pushed event envelope.
    Event(Envelope),
    /// A non-terminal error; the stream stays open.
    Error(WireError),
    /// The end-of-stream sentinel. Nothing follows.
    Complete(Envelope),
}

/// Receiving half of one stream request.
///
/// Yields zero or more `Event`/`Error` updates followed by exactly one
/// `Complete`, then ends. Dropping the handle cancels the stream.
pub struct StreamHandle {
    pub(crate) id: u64,
    pub(crate) batch_id: Option<u64>,
    pub(crate) updates: mpsc::UnboundedReceiver<StreamUpdate>,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
}

impl StreamHandle {
    /// The envelope id assigned to this stream.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The batch this stream was submitted in, if it was part of a
    /// multi-call submission.
    pub fn batch_id(&self) -> Option<u64> {
        self.batch_id
    }

    /// Cooperatively cancel the stream. The resolver and its batch
    /// membership are removed; no further updates are delivered.
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel { id: self.id });
    }

    /// Next update, `None` once the stream completed or was canceled.
    pub async fn next_update(&mut self) -> Option<StreamUpdate> {
        self.updates.recv().await
    }
}

impl Stream for StreamHandle {
    type Item = StreamUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.updates.poll_recv(cx)
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        // Canceling an already-completed id is a no-op in the worker.
        let _ = self.commands.send(Command::Cancel { id: self.id });
    }
}
