//! The store: tables, transaction stack and commit orchestration.

pub mod table;
pub mod transaction;

pub use table::Table;
pub use transaction::Transaction;

use crate::commit::{CommitListener, ReleaseDeltaListener};
use crate::error::{Result, StoreError};
use crate::index::KeyIndex;
use crate::pool::Pool;
use crate::records::{field_bit, DeltaFrame, Record, EXISTS_BIT};
use crate::schema::{EntityTypeId, FieldId, Schema};
use crate::types::Value;
use std::fmt;
use std::sync::Arc;

/// Handle to one row. Slots are recycled; the generation counter catches
/// handles cached across a release.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowId {
    pub(crate) entity: u16,
    pub(crate) slot: u32,
    pub(crate) gen: u32,
}

impl RowId {
    pub fn entity(&self) -> EntityTypeId {
        EntityTypeId(self.entity)
    }
}

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowId({}:{}#{})", self.entity, self.slot, self.gen)
    }
}

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Undo frames retained for recycling.
    pub frame_pool_capacity: usize,
    /// Free row slots retained per table for reuse.
    pub row_slot_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            frame_pool_capacity: 1024,
            row_slot_capacity: 1024,
        }
    }
}

struct RowSlot {
    gen: u32,
    rec: Option<Record>,
}

pub(crate) struct TableData {
    slots: Vec<RowSlot>,
    free: Vec<u32>,
    pub(crate) indexes: Vec<KeyIndex>,
}

/// One transaction nesting level.
pub(crate) struct TxLevel {
    pub(crate) changes: Vec<RowId>,
    pub(crate) defer: bool,
    pub(crate) prepared: bool,
}

impl TxLevel {
    pub(crate) fn new(defer: bool) -> Self {
        Self {
            changes: Vec::new(),
            defer,
            prepared: false,
        }
    }
}

/// Schema, tables and pools: everything below the transaction stack.
///
/// Commit listeners receive `&mut StoreCore` so they can read finalized
/// rows, detach and recycle their undo frames, and release dead rows.
pub struct StoreCore {
    schema: Arc<Schema>,
    pub(crate) tables: Vec<TableData>,
    frames: Pool<DeltaFrame>,
    row_slot_capacity: usize,
}

impl StoreCore {
    fn new(schema: Arc<Schema>, config: &StoreConfig) -> Self {
        let tables = schema
            .entities()
            .map(|(_, def)| TableData {
                slots: Vec::new(),
                free: Vec::new(),
                indexes: def
                    .keys()
                    .iter()
                    .map(|k| KeyIndex::new(def.name(), k.name(), k.unique()))
                    .collect(),
            })
            .collect();
        Self {
            schema,
            tables,
            frames: Pool::new(config.frame_pool_capacity),
            row_slot_capacity: config.row_slot_capacity,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub(crate) fn shared_schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    /// The record behind a row handle.
    pub fn record(&self, row: RowId) -> Result<&Record> {
        let slot = self
            .tables
            .get(row.entity as usize)
            .and_then(|t| t.slots.get(row.slot as usize))
            .ok_or(StoreError::RowMissing(row))?;
        if slot.gen != row.gen {
            return Err(StoreError::RowMissing(row));
        }
        slot.rec.as_ref().ok_or(StoreError::RowMissing(row))
    }

    fn parts_mut(&mut self, row: RowId) -> Result<(&mut Record, &mut Pool<DeltaFrame>)> {
        let StoreCore { tables, frames, .. } = self;
        let slot = tables
            .get_mut(row.entity as usize)
            .and_then(|t| t.slots.get_mut(row.slot as usize))
            .ok_or(StoreError::RowMissing(row))?;
        if slot.gen != row.gen {
            return Err(StoreError::RowMissing(row));
        }
        let rec = slot.rec.as_mut().ok_or(StoreError::RowMissing(row))?;
        Ok((rec, frames))
    }

    /// Detach the finalized undo frame of a committed row.
    pub fn detach_frame(&mut self, row: RowId) -> Result<DeltaFrame> {
        let (rec, _) = self.parts_mut(row)?;
        Ok(rec.take_frame())
    }

    /// Return a detached frame to the frame pool.
    pub fn recycle_frame(&mut self, frame: DeltaFrame) {
        self.frames.put(frame);
    }

    /// Release the row's slot if it is dead and clean.
    pub fn release_if_dead(&mut self, row: RowId) {
        if let Ok(rec) = self.record(row) {
            if rec.releasable() {
                self.release_slot(row);
            }
        }
    }

    fn release_slot(&mut self, row: RowId) {
        let capacity = self.row_slot_capacity;
        let table = &mut self.tables[row.entity as usize];
        let slot = &mut table.slots[row.slot as usize];
        slot.rec = None;
        slot.gen = slot.gen.wrapping_add(1);
        if table.free.len() < capacity {
            table.free.push(row.slot);
        }
    }

    pub(crate) fn row_id(&self, entity: EntityTypeId, slot: u32) -> RowId {
        RowId {
            entity: entity.0,
            slot,
            gen: self.tables[entity.0 as usize].slots[slot as usize].gen,
        }
    }

    // --- Mutation protocol ---

    pub(crate) fn create_row(
        &mut self,
        level: usize,
        entity: EntityTypeId,
        values: Vec<(FieldId, Value)>,
        defer: bool,
        changes: &mut Vec<RowId>,
    ) -> Result<RowId> {
        let schema = self.shared_schema();
        if entity.0 as usize >= self.tables.len() {
            return Err(StoreError::UnknownEntity(format!("#{}", entity.0)));
        }
        let def = schema.entity_def(entity);
        if !def.instantiable() {
            return Err(StoreError::NotInstantiable(def.name().to_string()));
        }

        let field_count = def.fields().len();
        let mut init = vec![Value::Null; field_count];
        let mut supplied = vec![false; field_count];
        for (field, value) in values {
            if field.entity != entity.0 {
                return Err(StoreError::UnknownField {
                    entity: def.name().to_string(),
                    field: format!("ordinal {}", field.index),
                });
            }
            let fdef = &def.fields()[field.ordinal()];
            if value.kind() != Some(fdef.kind()) {
                return Err(StoreError::KindMismatch {
                    field: fdef.name().to_string(),
                    expected: fdef.kind(),
                    got: value.kind(),
                });
            }
            init[field.ordinal()] = value;
            supplied[field.ordinal()] = true;
        }
        for (i, fdef) in def.fields().iter().enumerate() {
            if supplied[i] {
                continue;
            }
            if let Some(default) = fdef.default_value() {
                init[i] = default.clone();
                supplied[i] = true;
            } else if !fdef.nullable() {
                return Err(StoreError::RequiredField {
                    field: fdef.name().to_string(),
                });
            }
        }

        let StoreCore { tables, frames, .. } = self;
        let table = &mut tables[entity.0 as usize];
        let slot = match table.free.pop() {
            Some(s) => s,
            None => {
                table.slots.push(RowSlot { gen: 0, rec: None });
                (table.slots.len() - 1) as u32
            }
        };
        let row = RowId {
            entity: entity.0,
            slot,
            gen: table.slots[slot as usize].gen,
        };

        let mut rec = Record::blank(field_count);
        let pushed = rec.touch(level, frames);
        debug_assert!(pushed);
        changes.push(row);
        rec.backup_bit(EXISTS_BIT);
        rec.mask.set(EXISTS_BIT);
        for (i, value) in init.into_iter().enumerate() {
            if supplied[i] {
                rec.backup_bit(field_bit(i));
                rec.values[i] = value;
                rec.mask.set(field_bit(i));
            }
        }

        let mut tuples = Vec::new();
        if !defer {
            for (ki, key) in def.keys().iter().enumerate() {
                tuples.push((ki, rec.key_tuple(key)));
            }
        }
        table.slots[slot as usize].rec = Some(rec);
        for (ki, tuple) in tuples {
            table.indexes[ki].add(tuple, slot)?;
        }

        Ok(row)
    }

    pub(crate) fn set_value(
        &mut self,
        level: usize,
        row: RowId,
        field: FieldId,
        value: Value,
        defer: bool,
        changes: &mut Vec<RowId>,
    ) -> Result<()> {
        let schema = self.shared_schema();
        let def = schema.entity_def(EntityTypeId(row.entity));
        if field.entity != row.entity {
            return Err(StoreError::UnknownField {
                entity: def.name().to_string(),
                field: format!("ordinal {}", field.index),
            });
        }
        let fdef = schema.field_def(field);
        if value.kind() != Some(fdef.kind()) {
            return Err(StoreError::KindMismatch {
                field: fdef.name().to_string(),
                expected: fdef.kind(),
                got: value.kind(),
            });
        }

        let rec = self.record(row)?;
        if !rec.exists() {
            return Err(StoreError::RowRemoved(row));
        }
        if !fdef.mutable() && !is_new(rec) {
            return Err(StoreError::Immutable {
                field: fdef.name().to_string(),
            });
        }

        let ordinal = field.ordinal();
        let unchanged = rec.value(ordinal) == &value;

        // Unindex under current values before mutating; skipped entirely
        // when the new value equals the old.
        let mut ops = Vec::new();
        if !defer && !unchanged {
            for (ki, key) in def.keys().iter().enumerate() {
                if !key.fields.contains(&(ordinal as u16)) {
                    continue;
                }
                let old_tuple = rec.key_tuple(key);
                let mut new_tuple = old_tuple.clone();
                for (j, &f) in key.fields.iter().enumerate() {
                    if f as usize == ordinal {
                        new_tuple[j] = value.clone();
                    }
                }
                ops.push((ki, old_tuple, new_tuple));
            }
            let table = &mut self.tables[row.entity as usize];
            for (ki, old_tuple, _) in &ops {
                table.indexes[*ki].remove(old_tuple, row.slot);
            }
        }

        let (rec, frames) = self.parts_mut(row)?;
        if rec.touch(level, frames) {
            changes.push(row);
        }
        rec.backup_bit(field_bit(ordinal));
        rec.values[ordinal] = value;
        rec.mask.set(field_bit(ordinal));

        let table = &mut self.tables[row.entity as usize];
        for (ki, _, new_tuple) in ops {
            table.indexes[ki].add(new_tuple, row.slot)?;
        }
        Ok(())
    }

    pub(crate) fn clear_value(
        &mut self,
        level: usize,
        row: RowId,
        field: FieldId,
        defer: bool,
        changes: &mut Vec<RowId>,
    ) -> Result<()> {
        let schema = self.shared_schema();
        let def = schema.entity_def(EntityTypeId(row.entity));
        if field.entity != row.entity {
            return Err(StoreError::UnknownField {
                entity: def.name().to_string(),
                field: format!("ordinal {}", field.index),
            });
        }
        let fdef = schema.field_def(field);
        if !fdef.nullable() {
            return Err(StoreError::NotNullable {
                field: fdef.name().to_string(),
            });
        }

        let rec = self.record(row)?;
        if !rec.exists() {
            return Err(StoreError::RowRemoved(row));
        }
        if !fdef.mutable() && !is_new(rec) {
            return Err(StoreError::Immutable {
                field: fdef.name().to_string(),
            });
        }

        let ordinal = field.ordinal();
        if rec.value(ordinal).is_null() {
            return Ok(());
        }

        let mut ops = Vec::new();
        if !defer {
            for (ki, key) in def.keys().iter().enumerate() {
                if !key.fields.contains(&(ordinal as u16)) {
                    continue;
                }
                let old_tuple = rec.key_tuple(key);
                ops.push((ki, old_tuple));
            }
            let table = &mut self.tables[row.entity as usize];
            for (ki, old_tuple) in &ops {
                table.indexes[*ki].remove(old_tuple, row.slot);
            }
        }

        let (rec, frames) = self.parts_mut(row)?;
        if rec.touch(level, frames) {
            changes.push(row);
        }
        rec.backup_bit(field_bit(ordinal));
        rec.values[ordinal] = Value::Null;
        rec.mask.clear(field_bit(ordinal));
        Ok(())
    }

    pub(crate) fn remove_row(
        &mut self,
        level: usize,
        row: RowId,
        defer: bool,
        changes: &mut Vec<RowId>,
    ) -> Result<()> {
        let schema = self.shared_schema();
        let def = schema.entity_def(EntityTypeId(row.entity));

        let rec = self.record(row)?;
        if !rec.exists() {
            // removing an already-removed row is a no-op
            return Ok(());
        }

        if !defer {
            let tuples: Vec<_> = def
                .keys()
                .iter()
                .enumerate()
                .map(|(ki, key)| (ki, rec.key_tuple(key)))
                .collect();
            let table = &mut self.tables[row.entity as usize];
            for (ki, tuple) in tuples {
                table.indexes[ki].remove(&tuple, row.slot);
            }
        }

        let (rec, frames) = self.parts_mut(row)?;
        if rec.touch(level, frames) {
            changes.push(row);
        }
        rec.backup_bit(EXISTS_BIT);
        rec.mask.clear(EXISTS_BIT);
        Ok(())
    }

    /// Undo one row's top frame and restore its index membership.
    ///
    /// The index restoration removes the row under its new values and
    /// re-adds it under its old ones with the uniqueness check bypassed.
    /// Both calls are idempotent, so the same path is correct whether
    /// mutation-time indexing ran, was deferred, or stopped halfway
    /// through a failed prepare-commit reindex.
    pub(crate) fn rollback_row(&mut self, row: RowId) -> Result<()> {
        let schema = self.shared_schema();
        let def = schema.entity_def(EntityTypeId(row.entity));

        let rec = self.record(row)?;
        let exists_now = rec.exists();
        let existed_before = rec.existed_before();
        let mut ops = Vec::new();
        for (ki, key) in def.keys().iter().enumerate() {
            let new_tuple = exists_now.then(|| rec.key_tuple(key));
            let old_tuple = existed_before.then(|| rec.prior_key_tuple(key));
            if new_tuple != old_tuple {
                ops.push((ki, new_tuple, old_tuple));
            }
        }

        let (rec, frames) = self.parts_mut(row)?;
        let frame = rec.rollback_top();
        frames.put(frame);
        let dead = rec.releasable();

        let table = &mut self.tables[row.entity as usize];
        for (ki, new_tuple, old_tuple) in ops {
            if let Some(tuple) = new_tuple {
                table.indexes[ki].remove(&tuple, row.slot);
            }
            if let Some(tuple) = old_tuple {
                table.indexes[ki].add_unchecked(tuple, row.slot);
            }
        }

        if dead {
            self.release_slot(row);
        }
        Ok(())
    }

    pub(crate) fn fold_row(&mut self, row: RowId, parent_level: usize) -> Result<bool> {
        let (rec, frames) = self.parts_mut(row)?;
        match rec.fold_into_parent(parent_level) {
            Some(frame) => {
                frames.put(frame);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Two-pass batch reindex for a deferred commit: unindex every row
    /// first, then re-add every row, so cross-swapped unique values never
    /// collide transiently.
    pub(crate) fn reindex_changes(&mut self, changes: &[RowId]) -> Result<()> {
        let schema = self.shared_schema();

        for &row in changes {
            let def = schema.entity_def(EntityTypeId(row.entity));
            let rec = self.record(row)?;
            let exists_now = rec.exists();
            let existed_before = rec.existed_before();
            let mut removes = Vec::new();
            for (ki, key) in def.keys().iter().enumerate() {
                if !existed_before {
                    continue;
                }
                let old_tuple = rec.prior_key_tuple(key);
                let new_tuple = exists_now.then(|| rec.key_tuple(key));
                if new_tuple.as_ref() != Some(&old_tuple) {
                    removes.push((ki, old_tuple));
                }
            }
            let table = &mut self.tables[row.entity as usize];
            for (ki, tuple) in removes {
                table.indexes[ki].remove(&tuple, row.slot);
            }
        }

        for &row in changes {
            let def = schema.entity_def(EntityTypeId(row.entity));
            let rec = self.record(row)?;
            if !rec.exists() {
                continue;
            }
            let existed_before = rec.existed_before();
            let mut adds = Vec::new();
            for (ki, key) in def.keys().iter().enumerate() {
                let new_tuple = rec.key_tuple(key);
                if existed_before && rec.prior_key_tuple(key) == new_tuple {
                    continue;
                }
                adds.push((ki, new_tuple));
            }
            let table = &mut self.tables[row.entity as usize];
            for (ki, tuple) in adds {
                table.indexes[ki].add(tuple, row.slot)?;
            }
        }
        Ok(())
    }
}

/// A row whose EXISTS flag has never been committed: the bottom frame
/// predates its creation.
fn is_new(rec: &Record) -> bool {
    rec.frames.first().map_or(false, |f| !f.mask.test(EXISTS_BIT))
}

/// The main store.
///
/// Single-threaded by contract: the transaction guard returned by
/// [`Store::begin`] borrows the store mutably, which makes strict stack
/// discipline and single-writer access compile-time properties.
pub struct Store {
    pub(crate) core: StoreCore,
    pub(crate) levels: Vec<TxLevel>,
    listener: Option<Box<dyn CommitListener>>,
}

impl Store {
    pub fn new(schema: Schema) -> Self {
        Self::with_config(schema, StoreConfig::default())
    }

    pub fn with_config(schema: Schema, config: StoreConfig) -> Self {
        Self {
            core: StoreCore::new(schema.into_shared(), &config),
            levels: Vec::new(),
            listener: Some(Box::new(ReleaseDeltaListener)),
        }
    }

    /// Install the listener invoked at every outermost commit. Install
    /// before opening transactions.
    pub fn set_commit_listener(&mut self, listener: Box<dyn CommitListener>) {
        self.listener = Some(listener);
    }

    pub fn schema(&self) -> &Schema {
        self.core.schema()
    }

    pub(crate) fn shared_schema(&self) -> Arc<Schema> {
        self.core.shared_schema()
    }

    /// Open a transaction. `defer_index` batches secondary-index
    /// maintenance into an unindex-all-then-reindex-all pass at
    /// prepare-commit time.
    pub fn begin(&mut self, defer_index: bool) -> Transaction<'_> {
        self.levels.push(TxLevel::new(defer_index));
        let level = self.levels.len() - 1;
        tracing::debug!(level, defer_index, "begin transaction");
        Transaction::new(self, level)
    }

    /// Read view over one entity's rows.
    pub fn table(&self, entity: EntityTypeId) -> Table<'_> {
        Table::new(&self.core, entity)
    }

    /// Current value of a field; `Null` when unset.
    pub fn get(&self, row: RowId, field: FieldId) -> Result<Value> {
        let rec = self.core.record(row)?;
        if field.entity != row.entity {
            let def = self.core.schema().entity_def(EntityTypeId(row.entity));
            return Err(StoreError::UnknownField {
                entity: def.name().to_string(),
                field: format!("ordinal {}", field.index),
            });
        }
        if !rec.exists() {
            return Err(StoreError::RowRemoved(row));
        }
        Ok(rec.value(field.ordinal()).clone())
    }

    /// Whether the row handle refers to a live row.
    pub fn exists(&self, row: RowId) -> bool {
        self.core.record(row).map(|r| r.exists()).unwrap_or(false)
    }

    // --- Transaction plumbing ---

    pub(crate) fn defer_active(&self) -> bool {
        self.levels.iter().any(|l| l.defer)
    }

    fn check_mutable_phase(&self, level: usize) -> Result<()> {
        debug_assert_eq!(level + 1, self.levels.len());
        if self.levels[level].prepared {
            return Err(StoreError::TransactionState(
                "mutation after prepare_commit".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn tx_create(
        &mut self,
        level: usize,
        entity: EntityTypeId,
        values: Vec<(FieldId, Value)>,
    ) -> Result<RowId> {
        self.check_mutable_phase(level)?;
        let defer = self.defer_active();
        let Store { core, levels, .. } = self;
        core.create_row(level, entity, values, defer, &mut levels[level].changes)
    }

    pub(crate) fn tx_set(
        &mut self,
        level: usize,
        row: RowId,
        field: FieldId,
        value: Value,
    ) -> Result<()> {
        self.check_mutable_phase(level)?;
        let defer = self.defer_active();
        let Store { core, levels, .. } = self;
        core.set_value(level, row, field, value, defer, &mut levels[level].changes)
    }

    pub(crate) fn tx_clear(&mut self, level: usize, row: RowId, field: FieldId) -> Result<()> {
        self.check_mutable_phase(level)?;
        let defer = self.defer_active();
        let Store { core, levels, .. } = self;
        core.clear_value(level, row, field, defer, &mut levels[level].changes)
    }

    pub(crate) fn tx_remove(&mut self, level: usize, row: RowId) -> Result<()> {
        self.check_mutable_phase(level)?;
        let defer = self.defer_active();
        let Store { core, levels, .. } = self;
        core.remove_row(level, row, defer, &mut levels[level].changes)
    }

    pub(crate) fn tx_prepare(&mut self, level: usize) -> Result<()> {
        debug_assert_eq!(level + 1, self.levels.len());
        if self.levels[level].prepared {
            return Err(StoreError::TransactionState(
                "transaction already prepared".to_string(),
            ));
        }
        let outer_defer = self.levels[..level].iter().any(|l| l.defer);
        if self.levels[level].defer && !outer_defer {
            let Store { core, levels, .. } = self;
            core.reindex_changes(&levels[level].changes)?;
        }
        self.levels[level].prepared = true;
        Ok(())
    }

    pub(crate) fn tx_final(&mut self, level: usize) -> Result<()> {
        debug_assert_eq!(level + 1, self.levels.len());
        if !self.levels[level].prepared {
            if let Err(e) = self.tx_prepare(level) {
                self.tx_rollback(level);
                return Err(e);
            }
        }

        let lvl = self.levels.pop().expect("level checked");
        if level == 0 {
            let mut listener = self.listener.take().expect("listener installed");
            let result = listener.commit(&mut self.core, &lvl.changes);
            self.listener = Some(listener);
            if let Err(e) = result {
                // Commit is all-or-nothing: undo whatever the listener
                // had not yet consumed, then re-raise.
                for &row in &lvl.changes {
                    if let Ok(rec) = self.core.record(row) {
                        if !rec.clean() {
                            let _ = self.core.rollback_row(row);
                        }
                    }
                    self.core.release_if_dead(row);
                }
                return Err(e);
            }
            tracing::debug!(rows = lvl.changes.len(), "committed root transaction");
            Ok(())
        } else {
            let parent = level - 1;
            if self.levels[parent].changes.is_empty() {
                for &row in &lvl.changes {
                    let folded = self.core.fold_row(row, parent)?;
                    debug_assert!(!folded, "parent with empty change list never touched the row");
                }
                self.levels[parent].changes = lvl.changes;
            } else {
                for &row in &lvl.changes {
                    if !self.core.fold_row(row, parent)? {
                        self.levels[parent].changes.push(row);
                    }
                }
            }
            Ok(())
        }
    }

    pub(crate) fn tx_rollback(&mut self, level: usize) {
        debug_assert_eq!(level + 1, self.levels.len());
        let lvl = self.levels.pop().expect("level checked");
        for &row in &lvl.changes {
            if let Err(e) = self.core.rollback_row(row) {
                tracing::warn!(error = %e, ?row, "rollback skipped an unreachable row");
            }
        }
        tracing::debug!(level, rows = lvl.changes.len(), "rolled back transaction");
    }
}
