//! Records and their stacked-diff mutation protocol.
//!
//! A record owns its current field values, a presence plane, and a stack of
//! undo frames, one per distinct transaction nesting level that has
//! mutated it. The stack depth never exceeds the number of enclosing
//! levels; each frame's presence snapshot is the state one level up.

pub mod bits;
pub mod delta;

pub use bits::{field_bit, BitPlane, EXISTS_BIT};
pub use delta::DeltaFrame;

use crate::pool::Pool;
use crate::schema::KeyDef;
use crate::types::Value;

/// One logical row.
#[derive(Debug)]
pub struct Record {
    pub(crate) values: Vec<Value>,
    pub(crate) mask: BitPlane,
    pub(crate) frames: Vec<DeltaFrame>,
}

impl Record {
    pub(crate) fn blank(field_count: usize) -> Self {
        Self {
            values: vec![Value::Null; field_count],
            mask: BitPlane::with_bits(field_count + 1),
            frames: Vec::new(),
        }
    }

    /// Whether the row is currently live.
    pub fn exists(&self) -> bool {
        self.mask.test(EXISTS_BIT)
    }

    /// Current value of a field ordinal; `Null` when unset.
    pub fn value(&self, ordinal: usize) -> &Value {
        &self.values[ordinal]
    }

    /// Level of the most recent frame, `None` for a clean record.
    pub(crate) fn level(&self) -> Option<usize> {
        self.frames.last().map(|f| f.level)
    }

    pub(crate) fn clean(&self) -> bool {
        self.frames.is_empty()
    }

    /// Dead and clean: eligible to return to its table slot.
    pub(crate) fn releasable(&self) -> bool {
        self.frames.is_empty() && !self.exists()
    }

    /// Push a frame if `level` has not touched this row yet. Returns true
    /// when a frame was pushed; the caller then appends the row to the
    /// level's change list.
    pub(crate) fn touch(&mut self, level: usize, pool: &mut Pool<DeltaFrame>) -> bool {
        if self.level() == Some(level) {
            return false;
        }
        debug_assert!(self.level().map_or(true, |l| l < level));
        let mut frame = pool.get();
        frame.arm(level, self.values.len(), &self.mask);
        self.frames.push(frame);
        true
    }

    /// Record the pre-change state of `bit` in the top frame. A field
    /// dirtied twice at one level keeps its original backup.
    pub(crate) fn backup_bit(&mut self, bit: usize) {
        let frame = self.frames.last_mut().expect("touched record has a frame");
        if !frame.diff.test(bit) {
            if bit != EXISTS_BIT {
                frame.backup[bit - 1] = self.values[bit - 1].clone();
            }
            frame.diff.set(bit);
        }
    }

    /// Value of a field ordinal as of entry into the top frame.
    pub(crate) fn prior_value(&self, ordinal: usize) -> &Value {
        match self.frames.last() {
            Some(f) if f.diff.test(field_bit(ordinal)) => &f.backup[ordinal],
            _ => &self.values[ordinal],
        }
    }

    /// Whether the row was live on entry into the top frame.
    pub(crate) fn existed_before(&self) -> bool {
        match self.frames.last() {
            Some(f) => f.mask.test(EXISTS_BIT),
            None => self.exists(),
        }
    }

    /// Current values of a key's fields, in key order.
    pub(crate) fn key_tuple(&self, key: &KeyDef) -> Vec<Value> {
        key.fields
            .iter()
            .map(|&f| self.values[f as usize].clone())
            .collect()
    }

    /// Values of a key's fields as of entry into the top frame.
    pub(crate) fn prior_key_tuple(&self, key: &KeyDef) -> Vec<Value> {
        key.fields
            .iter()
            .map(|&f| self.prior_value(f as usize).clone())
            .collect()
    }

    /// Undo the top frame: restore every diffed value and the presence
    /// snapshot, then pop and return the frame for recycling.
    pub(crate) fn rollback_top(&mut self) -> DeltaFrame {
        let mut frame = self.frames.pop().expect("rollback requires a frame");
        for ordinal in 0..self.values.len() {
            if frame.diff.test(field_bit(ordinal)) {
                self.values[ordinal] = std::mem::take(&mut frame.backup[ordinal]);
            }
        }
        self.mask.clone_from(&frame.mask);
        frame
    }

    /// Finalize the top frame into the parent level.
    ///
    /// If the frame below was pushed at `parent_level`, merge: the parent
    /// keeps its older backups, adopts backups for fields it had not
    /// dirtied, and ORs the diff bits up; the child frame is popped and
    /// returned for recycling. Otherwise the top frame is retagged to the
    /// parent level and the full diff history survives (`None`).
    pub(crate) fn fold_into_parent(&mut self, parent_level: usize) -> Option<DeltaFrame> {
        let n = self.frames.len();
        if n >= 2 && self.frames[n - 2].level == parent_level {
            let mut child = self.frames.pop().expect("len checked");
            let parent = self.frames.last_mut().expect("len checked");
            for ordinal in 0..child.backup.len() {
                let bit = field_bit(ordinal);
                if child.diff.test(bit) && !parent.diff.test(bit) {
                    parent.backup[ordinal] = std::mem::take(&mut child.backup[ordinal]);
                }
            }
            parent.diff.union(&child.diff);
            Some(child)
        } else {
            let frame = self.frames.last_mut().expect("committed record has a frame");
            frame.level = parent_level;
            None
        }
    }

    /// Detach the top frame without undoing it (commit finalization).
    pub(crate) fn take_frame(&mut self) -> DeltaFrame {
        self.frames.pop().expect("finalized record has a frame")
    }
}
