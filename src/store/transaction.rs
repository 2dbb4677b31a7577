//! Transaction guards.
//!
//! A transaction is a guard over one nesting level. Opening a nested
//! transaction mutably borrows its parent, so only the innermost level is
//! ever reachable and commit/rollback order is enforced by the borrow
//! checker rather than by a runtime current-transaction pointer.

use crate::error::Result;
use crate::schema::{EntityTypeId, FieldId};
use crate::store::{RowId, Store, Table, TxLevel};
use crate::types::Value;

/// An active transaction level.
///
/// Exactly one of [`commit`](Transaction::commit),
/// [`final_commit`](Transaction::final_commit) or
/// [`rollback`](Transaction::rollback) ends it; dropping an un-ended
/// transaction rolls it back.
pub struct Transaction<'a> {
    store: &'a mut Store,
    level: usize,
    ended: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(store: &'a mut Store, level: usize) -> Self {
        Self {
            store,
            level,
            ended: false,
        }
    }

    /// Open a nested transaction. The child borrows this transaction until
    /// it ends.
    pub fn begin(&mut self, defer_index: bool) -> Transaction<'_> {
        self.store.levels.push(TxLevel::new(defer_index));
        let level = self.store.levels.len() - 1;
        tracing::debug!(level, defer_index, "begin nested transaction");
        Transaction {
            store: &mut *self.store,
            level,
            ended: false,
        }
    }

    /// Nesting depth of this transaction, root = 0.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Create a row, applying field defaults for anything not supplied.
    pub fn create(
        &mut self,
        entity: EntityTypeId,
        values: Vec<(FieldId, Value)>,
    ) -> Result<RowId> {
        self.store.tx_create(self.level, entity, values)
    }

    /// Set a field to a new value.
    pub fn set(&mut self, row: RowId, field: FieldId, value: impl Into<Value>) -> Result<()> {
        self.store.tx_set(self.level, row, field, value.into())
    }

    /// Clear a nullable field.
    pub fn clear(&mut self, row: RowId, field: FieldId) -> Result<()> {
        self.store.tx_clear(self.level, row, field)
    }

    /// Remove a row; removing an already-removed row is a no-op.
    pub fn remove(&mut self, row: RowId) -> Result<()> {
        self.store.tx_remove(self.level, row)
    }

    /// Current value of a field; `Null` when unset.
    pub fn get(&self, row: RowId, field: FieldId) -> Result<Value> {
        self.store.get(row, field)
    }

    /// Whether the row handle refers to a live row.
    pub fn exists(&self, row: RowId) -> bool {
        self.store.exists(row)
    }

    /// Read view over one entity's rows.
    pub fn table(&self, entity: EntityTypeId) -> Table<'_> {
        self.store.table(entity)
    }

    /// First phase of a two-phase commit. For a deferring transaction this
    /// runs the batch reindex; a failure here leaves the transaction open
    /// so the caller decides between retry and rollback.
    pub fn prepare_commit(&mut self) -> Result<()> {
        self.store.tx_prepare(self.level)
    }

    /// Second phase of a two-phase commit. Runs the prepare phase first if
    /// it has not happened, rolling back on its failure.
    pub fn final_commit(mut self) -> Result<()> {
        let result = self.store.tx_final(self.level);
        self.ended = true;
        result
    }

    /// Commit this transaction: prepare then finalize.
    pub fn commit(self) -> Result<()> {
        self.final_commit()
    }

    /// Undo every change made at this level.
    pub fn rollback(mut self) {
        self.store.tx_rollback(self.level);
        self.ended = true;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.ended {
            tracing::debug!(level = self.level, "implicit rollback on drop");
            self.store.tx_rollback(self.level);
        }
    }
}
