//! Read views over one entity's rows and key indexes.

use crate::error::{Result, StoreError};
use crate::index::{Direction, KeyFilter, KeyIndex};
use crate::schema::{EntityTypeId, KeyId};
use crate::store::{RowId, StoreCore, TableData};
use crate::types::Value;

/// Read-only view bound to one entity type.
///
/// Row creation and mutation go through the active
/// [`Transaction`](crate::Transaction); the table answers point, range and
/// multi-value lookups against the entity's keys.
pub struct Table<'a> {
    core: &'a StoreCore,
    entity: EntityTypeId,
}

impl<'a> Table<'a> {
    pub(crate) fn new(core: &'a StoreCore, entity: EntityTypeId) -> Self {
        Self { core, entity }
    }

    pub fn entity_type(&self) -> EntityTypeId {
        self.entity
    }

    fn data(&self) -> Result<&'a TableData> {
        self.core
            .tables
            .get(self.entity.0 as usize)
            .ok_or_else(|| StoreError::UnknownEntity(format!("#{}", self.entity.0)))
    }

    fn key_index(&self, key: KeyId) -> Result<&'a KeyIndex> {
        if key.entity != self.entity.0 {
            let def = self.core.schema().entity_def(self.entity);
            return Err(StoreError::UnknownKey {
                entity: def.name().to_string(),
                key: format!("ordinal {}", key.index),
            });
        }
        self.data().map(|d| &d.indexes[key.ordinal()])
    }

    fn key_names(&self, key: KeyId) -> (String, String) {
        let def = self.core.schema().entity_def(self.entity);
        let key_name = def.keys()[key.ordinal()].name().to_string();
        (def.name().to_string(), key_name)
    }

    /// Look up a row by its identity key values.
    pub fn get(&self, tuple: &[Value]) -> Result<Option<RowId>> {
        self.data()?;
        let identity = self.core.schema().identity(self.entity);
        self.get_by(identity, tuple)
    }

    /// Point lookup on a unique key.
    pub fn get_by(&self, key: KeyId, tuple: &[Value]) -> Result<Option<RowId>> {
        let index = self.key_index(key)?;
        Ok(index
            .get(&tuple.to_vec())
            .map(|slot| self.core.row_id(self.entity, slot)))
    }

    /// Rows matching `filter`, ordered by key tuple in `direction`.
    pub fn select(
        &self,
        key: KeyId,
        filter: &KeyFilter,
        direction: Direction,
    ) -> Result<Vec<RowId>> {
        let index = self.key_index(key)?;
        Ok(index
            .select(filter, direction)
            .into_iter()
            .map(|slot| self.core.row_id(self.entity, slot))
            .collect())
    }

    /// Iterate rows matching `filter` in `direction`.
    pub fn iter(
        &self,
        key: KeyId,
        filter: &KeyFilter,
        direction: Direction,
    ) -> Result<impl Iterator<Item = RowId>> {
        Ok(self.select(key, filter, direction)?.into_iter())
    }

    /// First matching row, or `None`.
    pub fn first(
        &self,
        key: KeyId,
        filter: &KeyFilter,
        direction: Direction,
    ) -> Result<Option<RowId>> {
        Ok(self.select(key, filter, direction)?.into_iter().next())
    }

    /// At most one matching row; more than one is an error.
    pub fn optional(&self, key: KeyId, filter: &KeyFilter) -> Result<Option<RowId>> {
        let rows = self.select(key, filter, Direction::Asc)?;
        if rows.len() > 1 {
            let (entity, key) = self.key_names(key);
            return Err(StoreError::NotUnique { entity, key });
        }
        Ok(rows.into_iter().next())
    }

    /// Exactly one matching row; zero or more than one is an error.
    pub fn single(&self, key: KeyId, filter: &KeyFilter) -> Result<RowId> {
        self.optional(key, filter)?.ok_or_else(|| {
            let (entity, key) = self.key_names(key);
            StoreError::NoMatch { entity, key }
        })
    }

    /// Number of live rows, counted through the identity index.
    pub fn count(&self) -> Result<usize> {
        let identity = self.core.schema().identity(self.entity);
        Ok(self.key_index(identity)?.len())
    }
}
