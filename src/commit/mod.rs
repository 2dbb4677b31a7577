//! Commit listeners and the delta model.
//!
//! At every outermost commit the store hands its finalized change list to
//! one [`CommitListener`]. [`ReleaseDeltaListener`] discards the undo
//! frames; [`TransformDeltaListener`] derives logical
//! insert/update/delete [`Delta`]s and feeds a [`DeltaListener`];
//! [`ApplyDeltaListener`] replays a delta stream onto a second store.
//! Chains compose: transform → fanout → (events, apply).

mod apply;
mod transform;

pub use apply::ApplyDeltaListener;
pub use transform::TransformDeltaListener;

use crate::error::Result;
use crate::records::{field_bit, BitPlane};
use crate::schema::EntityTypeId;
use crate::store::{RowId, StoreCore};
use crate::types::Value;
use serde::{Deserialize, Serialize};

/// Receives the finalized change list of every outermost commit.
///
/// Invoked exactly once per commit, synchronously, with rows in
/// first-touch order (the list is empty when nothing changed). The
/// listener owns finalization: it must detach each row's frame and
/// release dead rows. An error propagates to the committing caller and
/// undoes whatever the listener had not consumed, so listeners should
/// fail before consuming, or not at all.
pub trait CommitListener {
    fn commit(&mut self, core: &mut StoreCore, changes: &[RowId]) -> Result<()>;
}

/// Classification of a committed row's net change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeltaOp {
    Insert,
    Update,
    Delete,
}

/// A classified snapshot of one committed row's changes.
///
/// `values` carries the post-commit value for every changed field plus,
/// unconditionally, the identity-key fields, since downstream consumers rely
/// on key presence for correlation, so it is a hard requirement, not an
/// optimization. `diff` marks the changed bits and `mask` is the
/// post-commit presence plane.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub entity: EntityTypeId,
    pub op: DeltaOp,
    pub values: Vec<Value>,
    pub diff: BitPlane,
    pub mask: BitPlane,
}

impl Delta {
    /// Post-commit value of a field ordinal.
    pub fn value(&self, ordinal: usize) -> &Value {
        &self.values[ordinal]
    }

    /// Whether the field changed in this delta.
    pub fn changed(&self, ordinal: usize) -> bool {
        self.diff.test(field_bit(ordinal))
    }

    /// Whether the field holds a value after the commit.
    pub fn is_set(&self, ordinal: usize) -> bool {
        self.mask.test(field_bit(ordinal))
    }
}

/// Receives the classified delta lists of one commit.
///
/// Each list preserves first-touch order; any list may be empty. Called
/// from inside the committing store's commit path; a failure is logged
/// by [`TransformDeltaListener`] and never undoes the primary commit.
pub trait DeltaListener {
    fn accept_deltas(
        &mut self,
        deletes: &[Delta],
        updates: &[Delta],
        inserts: &[Delta],
    ) -> Result<()>;
}

/// Discards every row's accumulated undo frame. Used when no downstream
/// consumer cares about deltas.
pub struct ReleaseDeltaListener;

impl CommitListener for ReleaseDeltaListener {
    fn commit(&mut self, core: &mut StoreCore, changes: &[RowId]) -> Result<()> {
        for &row in changes {
            let frame = core.detach_frame(row)?;
            core.recycle_frame(frame);
            core.release_if_dead(row);
        }
        Ok(())
    }
}

/// Forwards one delta stream to several listeners.
#[derive(Default)]
pub struct FanoutDeltaListener {
    children: Vec<Box<dyn DeltaListener>>,
}

impl FanoutDeltaListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, child: Box<dyn DeltaListener>) -> &mut Self {
        self.children.push(child);
        self
    }
}

impl DeltaListener for FanoutDeltaListener {
    fn accept_deltas(
        &mut self,
        deletes: &[Delta],
        updates: &[Delta],
        inserts: &[Delta],
    ) -> Result<()> {
        let mut first_err = None;
        for child in &mut self.children {
            if let Err(e) = child.accept_deltas(deletes, updates, inserts) {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
