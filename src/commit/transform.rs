//! Transformation of finalized change lists into classified deltas.

use crate::commit::{CommitListener, Delta, DeltaListener, DeltaOp};
use crate::error::Result;
use crate::records::{field_bit, DeltaFrame, Record, EXISTS_BIT};
use crate::schema::{EntityDef, EntityTypeId};
use crate::store::{RowId, StoreCore};
use crate::types::Value;

/// Derives insert/update/delete deltas from each committed row and hands
/// them to a downstream [`DeltaListener`].
///
/// A downstream failure is logged and swallowed: the primary commit has
/// already succeeded and must not be undone by a replication consumer.
pub struct TransformDeltaListener {
    downstream: Box<dyn DeltaListener>,
}

impl TransformDeltaListener {
    pub fn new(downstream: Box<dyn DeltaListener>) -> Self {
        Self { downstream }
    }
}

impl CommitListener for TransformDeltaListener {
    fn commit(&mut self, core: &mut StoreCore, changes: &[RowId]) -> Result<()> {
        let schema = core.shared_schema();
        let mut deletes = Vec::new();
        let mut updates = Vec::new();
        let mut inserts = Vec::new();

        for &row in changes {
            let mut frame = core.detach_frame(row)?;
            let def = schema.entity_def(EntityTypeId(row.entity));
            let rec = core.record(row)?;

            normalize_change(def, rec, &mut frame);

            if let Some(delta) = classify(EntityTypeId(row.entity), def, rec, &frame) {
                match delta.op {
                    DeltaOp::Delete => deletes.push(delta),
                    DeltaOp::Update => updates.push(delta),
                    DeltaOp::Insert => inserts.push(delta),
                }
            }

            core.recycle_frame(frame);
            core.release_if_dead(row);
        }

        if deletes.is_empty() && updates.is_empty() && inserts.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.downstream.accept_deltas(&deletes, &updates, &inserts) {
            tracing::error!(error = %e, "delta listener failed; primary commit stands");
        }
        Ok(())
    }
}

/// Reconcile the frame's diffs against the row's current values, erasing
/// a diff whose field reverted to its pre-transaction value.
fn normalize_change(def: &EntityDef, rec: &Record, frame: &mut DeltaFrame) {
    for ordinal in 0..def.fields().len() {
        let bit = field_bit(ordinal);
        if frame.diff().test(bit) && rec.value(ordinal) == frame.backup_value(ordinal) {
            frame.diff.clear(bit);
        }
    }
    if rec.exists() == frame.mask().test(EXISTS_BIT) {
        frame.diff.clear(EXISTS_BIT);
    }
}

/// Classify a normalized frame by its EXISTS diff/mask pair and build the
/// outgoing delta; `None` means the row's net change is nothing durable.
fn classify(
    entity: EntityTypeId,
    def: &EntityDef,
    rec: &Record,
    frame: &DeltaFrame,
) -> Option<Delta> {
    if !frame.diff().any() {
        // net no-op, e.g. create-then-delete within one transaction
        return None;
    }

    let exists_now = rec.exists();
    let exists_diffed = frame.diff().test(EXISTS_BIT);
    let op = match (exists_diffed, exists_now) {
        (false, true) => DeltaOp::Update,
        (false, false) => return None, // never became durable
        (true, false) => DeltaOp::Delete,
        (true, true) => DeltaOp::Insert,
    };

    let field_count = def.fields().len();
    let mut values = vec![Value::Null; field_count];
    let mut diff = frame.diff().clone();

    match op {
        DeltaOp::Insert => {
            // a fresh row ships every present field
            for ordinal in 0..field_count {
                if rec.mask.test(field_bit(ordinal)) {
                    values[ordinal] = rec.value(ordinal).clone();
                    diff.set(field_bit(ordinal));
                }
            }
        }
        DeltaOp::Update => {
            for ordinal in 0..field_count {
                if diff.test(field_bit(ordinal)) {
                    values[ordinal] = rec.value(ordinal).clone();
                }
            }
        }
        DeltaOp::Delete => {}
    }

    // key fields are snapshotted unconditionally so every delta can be
    // correlated downstream
    for ordinal in def.identity_key().field_ordinals() {
        values[ordinal] = rec.value(ordinal).clone();
    }

    Some(Delta {
        entity,
        op,
        values,
        diff,
        mask: rec.mask.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::FanoutDeltaListener;
    use crate::schema::Schema;
    use crate::store::Store;
    use crate::types::ValueKind;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Capture {
        batches: Vec<(Vec<Delta>, Vec<Delta>, Vec<Delta>)>,
    }

    impl DeltaListener for Rc<RefCell<Capture>> {
        fn accept_deltas(
            &mut self,
            deletes: &[Delta],
            updates: &[Delta],
            inserts: &[Delta],
        ) -> Result<()> {
            self.borrow_mut().batches.push((
                deletes.to_vec(),
                updates.to_vec(),
                inserts.to_vec(),
            ));
            Ok(())
        }
    }

    fn schema() -> Schema {
        let mut b = Schema::builder();
        {
            let e = b.entity("item");
            e.field("id", ValueKind::Long).required();
            e.field("qty", ValueKind::Int);
            e.identity_key("pk", &["id"]);
        }
        b.build().unwrap()
    }

    fn capturing_store() -> (Store, Rc<RefCell<Capture>>) {
        let mut store = Store::new(schema());
        let capture = Rc::new(RefCell::new(Capture::default()));
        store.set_commit_listener(Box::new(TransformDeltaListener::new(Box::new(
            capture.clone(),
        ))));
        (store, capture)
    }

    #[test]
    fn test_insert_then_update_then_delete() {
        let (mut store, capture) = capturing_store();
        let item = store.schema().entity("item").unwrap();
        let id = store.schema().field(item, "id").unwrap();
        let qty = store.schema().field(item, "qty").unwrap();

        let mut tx = store.begin(false);
        let row = tx
            .create(item, vec![(id, Value::Long(1)), (qty, Value::Int(5))])
            .unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin(false);
        tx.set(row, qty, Value::Int(6)).unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin(false);
        tx.remove(row).unwrap();
        tx.commit().unwrap();

        let batches = &capture.borrow().batches;
        assert_eq!(batches.len(), 3);

        let (_, _, inserts) = &batches[0];
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].op, DeltaOp::Insert);
        assert_eq!(inserts[0].value(1), &Value::Int(5));

        let (_, updates, _) = &batches[1];
        assert_eq!(updates.len(), 1);
        assert!(updates[0].changed(1));
        assert_eq!(updates[0].value(1), &Value::Int(6));
        // identity key rides along even though it did not change
        assert_eq!(updates[0].value(0), &Value::Long(1));

        let (deletes, _, _) = &batches[2];
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].op, DeltaOp::Delete);
        assert_eq!(deletes[0].value(0), &Value::Long(1));
    }

    #[test]
    fn test_reverted_field_emits_nothing() {
        let (mut store, capture) = capturing_store();
        let item = store.schema().entity("item").unwrap();
        let id = store.schema().field(item, "id").unwrap();
        let qty = store.schema().field(item, "qty").unwrap();

        let mut tx = store.begin(false);
        let row = tx
            .create(item, vec![(id, Value::Long(1)), (qty, Value::Int(5))])
            .unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin(false);
        tx.set(row, qty, Value::Int(9)).unwrap();
        tx.set(row, qty, Value::Int(5)).unwrap();
        tx.commit().unwrap();

        // one batch from the insert; the reverted update produced none
        assert_eq!(capture.borrow().batches.len(), 1);
    }

    #[test]
    fn test_create_then_remove_is_discarded() {
        let (mut store, capture) = capturing_store();
        let item = store.schema().entity("item").unwrap();
        let id = store.schema().field(item, "id").unwrap();

        let mut tx = store.begin(false);
        let row = tx.create(item, vec![(id, Value::Long(7))]).unwrap();
        tx.remove(row).unwrap();
        tx.commit().unwrap();

        assert!(capture.borrow().batches.is_empty());
        assert!(!store.exists(row));
    }

    #[test]
    fn test_downstream_failure_does_not_undo_commit() {
        struct Failing;
        impl DeltaListener for Failing {
            fn accept_deltas(&mut self, _: &[Delta], _: &[Delta], _: &[Delta]) -> Result<()> {
                Err(crate::error::StoreError::Replication("down".to_string()))
            }
        }

        let mut store = Store::new(schema());
        store.set_commit_listener(Box::new(TransformDeltaListener::new(Box::new(Failing))));
        let item = store.schema().entity("item").unwrap();
        let id = store.schema().field(item, "id").unwrap();

        let mut tx = store.begin(false);
        tx.create(item, vec![(id, Value::Long(3))]).unwrap();
        tx.commit().unwrap();

        let table = store.table(item);
        assert!(table.get(&[Value::Long(3)]).unwrap().is_some());
    }

    #[test]
    fn test_fanout_reaches_every_child() {
        let mut store = Store::new(schema());
        let a = Rc::new(RefCell::new(Capture::default()));
        let b = Rc::new(RefCell::new(Capture::default()));
        let mut fanout = FanoutDeltaListener::new();
        fanout.push(Box::new(a.clone()));
        fanout.push(Box::new(b.clone()));
        store.set_commit_listener(Box::new(TransformDeltaListener::new(Box::new(fanout))));

        let item = store.schema().entity("item").unwrap();
        let id = store.schema().field(item, "id").unwrap();

        let mut tx = store.begin(false);
        tx.create(item, vec![(id, Value::Long(1))]).unwrap();
        tx.commit().unwrap();

        assert_eq!(a.borrow().batches.len(), 1);
        assert_eq!(b.borrow().batches.len(), 1);
    }
}
