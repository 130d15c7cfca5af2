//! Batch tracking for multi-call stream submissions.
//!
//! A batch groups the envelope ids of stream requests submitted together
//! so they can be re-issued as one group after a transport failover.
//! Membership only shrinks; an emptied batch is discarded.

use std::collections::HashMap;

/// Where a re-submittable poll unit (a batch, or a lone un-batched
/// stream) currently sits. At most one poll per unit is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum PollState {
    /// Nothing queued or awaiting a response for the unit.
    #[default]
    Idle,
    /// The unit's envelope group is sitting in the outbox.
    Queued,
    /// The group was handed to a transport attempt; a response may still
    /// arrive.
    InFlight,
}

#[derive(Debug)]
struct Batch {
    members: Vec<u64>,
    poll: PollState,
}

#[derive(Debug, Default)]
pub(crate) struct BatchTracker {
    next_id: u64,
    batches: HashMap<u64, Batch>,
}

impl BatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a batch over the given member ids. Only submissions with more
    /// than one stream request are batched.
    pub fn open(&mut self, members: Vec<u64>) -> u64 {
        self.next_id += 1;
        self.batches.insert(
            self.next_id,
            Batch {
                members,
                poll: PollState::Idle,
            },
        );
        self.next_id
    }

    /// Drop a member whose resolver reached a terminal or canceled state.
    /// The batch is discarded once its last member is gone.
    pub fn remove_member(&mut self, batch_id: u64, id: u64) {
        let Some(batch) = self.batches.get_mut(&batch_id) else {
            return;
        };
        batch.members.retain(|member| *member != id);
        if batch.members.is_empty() {
            self.batches.remove(&batch_id);
        }
    }

    /// Remaining member ids, in submission order.
    pub fn members(&self, batch_id: u64) -> Option<&[u64]> {
        self.batches.get(&batch_id).map(|b| b.members.as_slice())
    }

    pub fn poll(&self, batch_id: u64) -> Option<PollState> {
        self.batches.get(&batch_id).map(|b| b.poll)
    }

    pub fn set_poll(&mut self, batch_id: u64, poll: PollState) {
        if let Some(batch) = self.batches.get_mut(&batch_id) {
            batch.poll = poll;
        }
    }

    /// Ids of all open batches.
    pub fn ids(&self) -> Vec<u64> {
        self.batches.keys().copied().collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.batches.len()
    }
}
