//! Correlation registry: maps outstanding request ids to resolvers.
//!
//! An id is live from submission until its resolver completes or is
//! canceled. Call resolvers are single-shot; stream resolvers live until
//! the terminal sentinel or an explicit cancellation.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use crate::batch::PollState;
use crate::client::StreamUpdate;
use crate::envelope::Envelope;
use crate::error::WireError;

pub(crate) type CallReply = Result<Envelope, WireError>;

pub(crate) struct CallResolver {
    pub reply: oneshot::Sender<CallReply>,
}

pub(crate) struct StreamResolver {
    pub batch_id: Option<u64>,
    /// The request envelope to replay on the stateless path. Its header
    /// tracks the latest observed continuation cursor for this id.
    pub last_payload: Envelope,
    pub updates: mpsc::UnboundedSender<StreamUpdate>,
    /// Poll bookkeeping for un-batched streams; batched members are
    /// tracked on their batch instead.
    pub poll: PollState,
}

pub(crate) enum Resolver {
    Call(CallResolver),
    Stream(StreamResolver),
}

#[derive(Default)]
pub(crate) struct Registry {
    next_id: u64,
    entries: HashMap<u64, Resolver>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id and store the resolver built for it.
    ///
    /// Ids are monotonic within a connection epoch. Allocation skips ids
    /// still live from before an epoch reset so keys stay unique.
    pub fn register_with(&mut self, make: impl FnOnce(u64) -> Resolver) -> u64 {
        loop {
            self.next_id += 1;
            if !self.entries.contains_key(&self.next_id) {
                break;
            }
        }
        let id = self.next_id;
        self.entries.insert(id, make(id));
        id
    }

    /// Restart id numbering for a fresh socket connection.
    pub fn reset_ids(&mut self) {
        self.next_id = 0;
    }

    pub fn get(&self, id: u64) -> Option<&Resolver> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Resolver> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<Resolver> {
        self.entries.remove(&id)
    }

    /// Ids of stream resolvers that belong to no batch. These are polled
    /// individually on the stateless path.
    pub fn solo_stream_ids(&self) -> Vec<u64> {
        self.entries
            .iter()
            .filter_map(|(id, resolver)| match resolver {
                Resolver::Stream(stream) if stream.batch_id.is_none() => Some(*id),
                _ => None,
            })
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
