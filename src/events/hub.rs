//! Event hub broadcasting committed deltas to subscribers.

use crate::commit::{Delta, DeltaListener};
use crate::error::Result;
use crossbeam_channel::{bounded, Sender, TrySendError};
use std::cell::RefCell;
use std::rc::Rc;

use super::types::{DropReason, EventFilter, SubscriptionHandle, SubscriptionId};

/// Default per-subscriber buffer size.
const DEFAULT_BUFFER_SIZE: usize = 1024;

struct Subscription {
    id: SubscriptionId,
    filter: EventFilter,
    sender: Sender<Delta>,
}

impl Subscription {
    /// Try to deliver; a full buffer or gone receiver drops the
    /// subscriber rather than blocking the committing thread.
    fn try_send(&self, delta: Delta) -> std::result::Result<(), DropReason> {
        match self.sender.try_send(delta) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DropReason::BufferFull),
            Err(TrySendError::Disconnected(_)) => Err(DropReason::Disconnected),
        }
    }
}

/// Broadcasts committed deltas over bounded channels.
///
/// Wrap in `Rc<RefCell<..>>` to keep a subscription handle after
/// installing the hub into a listener chain.
pub struct EventHub {
    subscriptions: Vec<Subscription>,
    next_id: u64,
    buffer_size: usize,
}

impl EventHub {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            subscriptions: Vec::new(),
            next_id: 1,
            buffer_size,
        }
    }

    /// Create a subscription; events matching `filter` arrive on the
    /// returned receiver.
    pub fn subscribe(&mut self, filter: EventFilter) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        let (sender, receiver) = bounded(self.buffer_size);
        self.subscriptions.push(Subscription { id, filter, sender });
        SubscriptionHandle { id, receiver }
    }

    /// Cancel a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscriptions.retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn broadcast(&mut self, delta: &Delta) {
        self.subscriptions.retain(|sub| {
            if !sub.filter.matches(delta) {
                return true;
            }
            match sub.try_send(delta.clone()) {
                Ok(()) => true,
                Err(reason) => {
                    tracing::debug!(id = sub.id.0, ?reason, "dropping subscriber");
                    false
                }
            }
        });
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaListener for EventHub {
    fn accept_deltas(
        &mut self,
        deletes: &[Delta],
        updates: &[Delta],
        inserts: &[Delta],
    ) -> Result<()> {
        for delta in deletes.iter().chain(updates).chain(inserts) {
            self.broadcast(delta);
        }
        Ok(())
    }
}

impl DeltaListener for Rc<RefCell<EventHub>> {
    fn accept_deltas(
        &mut self,
        deletes: &[Delta],
        updates: &[Delta],
        inserts: &[Delta],
    ) -> Result<()> {
        self.borrow_mut().accept_deltas(deletes, updates, inserts)
    }
}
