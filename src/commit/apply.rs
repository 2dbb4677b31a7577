//! Replays committed delta streams onto a second store.

use crate::commit::{Delta, DeltaListener};
use crate::error::{Result, StoreError};
use crate::schema::FieldId;
use crate::store::Store;
use crate::types::Value;
use std::cell::RefCell;
use std::rc::Rc;

/// Applies insert/update/delete deltas to a schema-identical target store
/// inside one transaction per batch.
///
/// Runs synchronously within the source store's commit path; the target
/// is shared so the caller keeps its own handle for queries. Entity and
/// field handles are carried over by ordinal, which is what
/// "schema-identical" buys.
pub struct ApplyDeltaListener {
    target: Rc<RefCell<Store>>,
}

impl ApplyDeltaListener {
    pub fn new(target: Rc<RefCell<Store>>) -> Self {
        Self { target }
    }
}

impl DeltaListener for ApplyDeltaListener {
    fn accept_deltas(
        &mut self,
        deletes: &[Delta],
        updates: &[Delta],
        inserts: &[Delta],
    ) -> Result<()> {
        let mut store = self
            .target
            .try_borrow_mut()
            .map_err(|_| StoreError::Replication("target store is busy".to_string()))?;
        let schema = store.shared_schema();
        let mut tx = store.begin(false);

        for delta in deletes {
            let def = schema.entity_def(delta.entity);
            let tuple: Vec<Value> = def
                .identity_key()
                .field_ordinals()
                .map(|o| delta.value(o).clone())
                .collect();
            let row = tx.table(delta.entity).get(&tuple)?.ok_or_else(|| {
                StoreError::Replication(format!("delete target missing on {}", def.name()))
            })?;
            tx.remove(row)?;
        }

        for delta in updates {
            let def = schema.entity_def(delta.entity);
            let tuple: Vec<Value> = def
                .identity_key()
                .field_ordinals()
                .map(|o| delta.value(o).clone())
                .collect();
            let row = tx.table(delta.entity).get(&tuple)?.ok_or_else(|| {
                StoreError::Replication(format!("update target missing on {}", def.name()))
            })?;
            for ordinal in 0..def.fields().len() {
                if !delta.changed(ordinal) {
                    continue;
                }
                let field = FieldId {
                    entity: delta.entity.0,
                    index: ordinal as u16,
                };
                if delta.is_set(ordinal) {
                    tx.set(row, field, delta.value(ordinal).clone())?;
                } else {
                    tx.clear(row, field)?;
                }
            }
        }

        for delta in inserts {
            let def = schema.entity_def(delta.entity);
            let fields: Vec<(FieldId, Value)> = (0..def.fields().len())
                .filter(|&o| delta.is_set(o))
                .map(|o| {
                    (
                        FieldId {
                            entity: delta.entity.0,
                            index: o as u16,
                        },
                        delta.value(o).clone(),
                    )
                })
                .collect();
            tx.create(delta.entity, fields)?;
        }

        tx.commit()
    }
}
