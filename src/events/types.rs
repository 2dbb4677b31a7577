//! Subscription types for delta events.

use crate::commit::{Delta, DeltaOp};
use crate::schema::EntityTypeId;
use crossbeam_channel::Receiver;
use std::fmt;

/// Unique identifier for a subscription.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

/// Why a subscriber was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The bounded buffer was full when an event arrived.
    BufferFull,
    /// The receiving side went away.
    Disconnected,
}

/// Filter criteria for a subscription.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    /// Only these entities (None = all).
    pub entities: Option<Vec<EntityTypeId>>,
    /// Only these operations (None = all).
    pub ops: Option<Vec<DeltaOp>>,
}

impl EventFilter {
    /// Every delta of every entity.
    pub fn all() -> Self {
        Self::default()
    }

    /// Deltas of one entity.
    pub fn entity(entity: EntityTypeId) -> Self {
        Self {
            entities: Some(vec![entity]),
            ops: None,
        }
    }

    /// Only the given operations.
    pub fn with_ops(mut self, ops: Vec<DeltaOp>) -> Self {
        self.ops = Some(ops);
        self
    }

    pub(crate) fn matches(&self, delta: &Delta) -> bool {
        if let Some(entities) = &self.entities {
            if !entities.contains(&delta.entity) {
                return false;
            }
        }
        if let Some(ops) = &self.ops {
            if !ops.contains(&delta.op) {
                return false;
            }
        }
        true
    }
}

/// Handle for receiving subscribed deltas.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub receiver: Receiver<Delta>,
}
