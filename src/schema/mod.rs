//! Schema metadata: entity, field and key descriptors.
//!
//! Descriptors are static and immutable once built; the engine consumes
//! them for dispatch and error messages but never mutates them. A
//! schema-to-source compiler targeting this crate would emit one
//! [`SchemaBuilder`] program per entity model.

use crate::error::{Result, StoreError};
use crate::types::{Value, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Ordinal handle for an entity type within one schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityTypeId(pub(crate) u16);

/// Handle for a field, bound to its entity type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldId {
    pub(crate) entity: u16,
    pub(crate) index: u16,
}

impl FieldId {
    pub fn entity(&self) -> EntityTypeId {
        EntityTypeId(self.entity)
    }

    pub(crate) fn ordinal(&self) -> usize {
        self.index as usize
    }
}

/// Handle for a key, bound to its entity type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId {
    pub(crate) entity: u16,
    pub(crate) index: u16,
}

impl KeyId {
    pub fn entity(&self) -> EntityTypeId {
        EntityTypeId(self.entity)
    }

    pub(crate) fn ordinal(&self) -> usize {
        self.index as usize
    }
}

/// Field descriptor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldDef {
    pub(crate) name: String,
    pub(crate) kind: ValueKind,
    pub(crate) nullable: bool,
    pub(crate) mutable: bool,
    pub(crate) default: Option<Value>,
}

impl FieldDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }

    pub fn mutable(&self) -> bool {
        self.mutable
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }
}

/// Named, ordered set of fields; optionally unique.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyDef {
    pub(crate) name: String,
    pub(crate) fields: Vec<u16>,
    pub(crate) unique: bool,
}

impl KeyDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unique(&self) -> bool {
        self.unique
    }

    pub fn field_ordinals(&self) -> impl Iterator<Item = usize> + '_ {
        self.fields.iter().map(|f| *f as usize)
    }
}

/// Entity type descriptor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityDef {
    pub(crate) name: String,
    pub(crate) instantiable: bool,
    pub(crate) supertypes: Vec<String>,
    pub(crate) fields: Vec<FieldDef>,
    pub(crate) keys: Vec<KeyDef>,
    pub(crate) identity: u16,
}

impl EntityDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instantiable(&self) -> bool {
        self.instantiable
    }

    pub fn supertypes(&self) -> &[String] {
        &self.supertypes
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn keys(&self) -> &[KeyDef] {
        &self.keys
    }

    pub(crate) fn identity_key(&self) -> &KeyDef {
        &self.keys[self.identity as usize]
    }

    /// Bits needed for this entity's planes: one per field plus EXISTS.
    pub(crate) fn plane_bits(&self) -> usize {
        self.fields.len() + 1
    }
}

/// A validated, immutable entity model.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "SchemaDoc")]
pub struct Schema {
    entities: Vec<EntityDef>,
    #[serde(skip)]
    by_name: HashMap<String, u16>,
}

/// Serialized form of [`Schema`]; the name map is rebuilt on load.
#[derive(Deserialize)]
struct SchemaDoc {
    entities: Vec<EntityDef>,
}

impl From<SchemaDoc> for Schema {
    fn from(doc: SchemaDoc) -> Self {
        Schema::from_entities(doc.entities)
    }
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder {
            entities: Vec::new(),
        }
    }

    pub fn entity(&self, name: &str) -> Result<EntityTypeId> {
        self.by_name
            .get(name)
            .map(|i| EntityTypeId(*i))
            .ok_or_else(|| StoreError::UnknownEntity(name.to_string()))
    }

    pub fn entity_def(&self, id: EntityTypeId) -> &EntityDef {
        &self.entities[id.0 as usize]
    }

    pub fn entities(&self) -> impl Iterator<Item = (EntityTypeId, &EntityDef)> {
        self.entities
            .iter()
            .enumerate()
            .map(|(i, e)| (EntityTypeId(i as u16), e))
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn field(&self, entity: EntityTypeId, name: &str) -> Result<FieldId> {
        let def = self.entity_def(entity);
        def.fields
            .iter()
            .position(|f| f.name == name)
            .map(|i| FieldId {
                entity: entity.0,
                index: i as u16,
            })
            .ok_or_else(|| StoreError::UnknownField {
                entity: def.name.clone(),
                field: name.to_string(),
            })
    }

    pub fn key(&self, entity: EntityTypeId, name: &str) -> Result<KeyId> {
        let def = self.entity_def(entity);
        def.keys
            .iter()
            .position(|k| k.name == name)
            .map(|i| KeyId {
                entity: entity.0,
                index: i as u16,
            })
            .ok_or_else(|| StoreError::UnknownKey {
                entity: def.name.clone(),
                key: name.to_string(),
            })
    }

    /// The identity key of an entity; always unique.
    pub fn identity(&self, entity: EntityTypeId) -> KeyId {
        KeyId {
            entity: entity.0,
            index: self.entity_def(entity).identity,
        }
    }

    pub fn field_def(&self, field: FieldId) -> &FieldDef {
        &self.entities[field.entity as usize].fields[field.index as usize]
    }

    pub fn key_def(&self, key: KeyId) -> &KeyDef {
        &self.entities[key.entity as usize].keys[key.index as usize]
    }

    /// Whether `entity` declares `ancestor` among its supertypes,
    /// transitively.
    pub fn is_subtype(&self, entity: EntityTypeId, ancestor: EntityTypeId) -> bool {
        if entity == ancestor {
            return true;
        }
        let target = self.entity_def(ancestor).name.as_str();
        let mut pending: Vec<&str> = self
            .entity_def(entity)
            .supertypes
            .iter()
            .map(String::as_str)
            .collect();
        let mut seen = HashSet::new();
        while let Some(name) = pending.pop() {
            if name == target {
                return true;
            }
            if seen.insert(name) {
                if let Some(i) = self.by_name.get(name) {
                    pending.extend(self.entities[*i as usize].supertypes.iter().map(String::as_str));
                }
            }
        }
        false
    }

    pub(crate) fn into_shared(self) -> Arc<Schema> {
        Arc::new(self)
    }

    fn from_entities(entities: Vec<EntityDef>) -> Self {
        let by_name = entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i as u16))
            .collect();
        Self { entities, by_name }
    }
}

/// Builder for [`Schema`]; validation happens in [`SchemaBuilder::build`].
pub struct SchemaBuilder {
    entities: Vec<EntityDraft>,
}

impl SchemaBuilder {
    /// Start (or continue) declaring an entity.
    pub fn entity(&mut self, name: &str) -> &mut EntityDraft {
        self.entities.push(EntityDraft {
            name: name.to_string(),
            instantiable: true,
            supertypes: Vec::new(),
            fields: Vec::new(),
            keys: Vec::new(),
            identity: None,
        });
        self.entities.last_mut().unwrap()
    }

    pub fn build(self) -> Result<Schema> {
        let mut names = HashSet::new();
        for draft in &self.entities {
            if !names.insert(draft.name.clone()) {
                return Err(StoreError::InvalidSchema(format!(
                    "duplicate entity name: {}",
                    draft.name
                )));
            }
        }

        let mut entities = Vec::with_capacity(self.entities.len());
        for draft in self.entities {
            entities.push(draft.finish(&names)?);
        }

        Ok(Schema::from_entities(entities))
    }
}

/// In-progress entity declaration.
pub struct EntityDraft {
    name: String,
    instantiable: bool,
    supertypes: Vec<String>,
    fields: Vec<FieldDef>,
    keys: Vec<(KeyDef, Vec<String>)>,
    identity: Option<String>,
}

impl EntityDraft {
    /// Declare a field; follow with [`FieldDraft`] calls to refine it.
    pub fn field(&mut self, name: &str, kind: ValueKind) -> FieldDraft<'_> {
        self.fields.push(FieldDef {
            name: name.to_string(),
            kind,
            nullable: true,
            mutable: true,
            default: None,
        });
        FieldDraft {
            def: self.fields.last_mut().unwrap(),
        }
    }

    /// Declare a non-unique key over the named fields.
    pub fn key(&mut self, name: &str, fields: &[&str]) -> &mut Self {
        self.push_key(name, fields, false);
        self
    }

    /// Declare a unique key over the named fields.
    pub fn unique_key(&mut self, name: &str, fields: &[&str]) -> &mut Self {
        self.push_key(name, fields, true);
        self
    }

    /// Declare the identity key; always unique.
    pub fn identity_key(&mut self, name: &str, fields: &[&str]) -> &mut Self {
        self.push_key(name, fields, true);
        self.identity = Some(name.to_string());
        self
    }

    pub fn not_instantiable(&mut self) -> &mut Self {
        self.instantiable = false;
        self
    }

    pub fn supertype(&mut self, name: &str) -> &mut Self {
        self.supertypes.push(name.to_string());
        self
    }

    fn push_key(&mut self, name: &str, fields: &[&str], unique: bool) {
        self.keys.push((
            KeyDef {
                name: name.to_string(),
                fields: Vec::new(),
                unique,
            },
            fields.iter().map(|f| f.to_string()).collect(),
        ));
    }

    fn finish(self, entity_names: &HashSet<String>) -> Result<EntityDef> {
        let invalid = |msg: String| StoreError::InvalidSchema(format!("{}: {}", self.name, msg));

        let mut field_names = HashSet::new();
        for f in &self.fields {
            if !field_names.insert(f.name.clone()) {
                return Err(invalid(format!("duplicate field name: {}", f.name)));
            }
            if let Some(default) = &f.default {
                if default.kind() != Some(f.kind) {
                    return Err(invalid(format!(
                        "default for {} is not a {:?}",
                        f.name, f.kind
                    )));
                }
            }
        }

        for s in &self.supertypes {
            if !entity_names.contains(s) {
                return Err(invalid(format!("unknown supertype: {s}")));
            }
        }

        let mut keys = Vec::with_capacity(self.keys.len());
        let mut key_names = HashSet::new();
        for (mut key, field_names) in self.keys {
            if !key_names.insert(key.name.clone()) {
                return Err(invalid(format!("duplicate key name: {}", key.name)));
            }
            if field_names.is_empty() {
                return Err(invalid(format!("key {} has no fields", key.name)));
            }
            for fname in &field_names {
                let ordinal = self
                    .fields
                    .iter()
                    .position(|f| &f.name == fname)
                    .ok_or_else(|| {
                        invalid(format!("key {} references unknown field {fname}", key.name))
                    })?;
                key.fields.push(ordinal as u16);
            }
            keys.push(key);
        }

        let identity_name = self
            .identity
            .ok_or_else(|| invalid("no identity key declared".to_string()))?;
        let identity = keys
            .iter()
            .position(|k| k.name == identity_name)
            .expect("identity key was pushed") as u16;
        if !keys[identity as usize].unique {
            return Err(invalid(format!("identity key {identity_name} must be unique")));
        }

        // Identity fields must stay correlatable across update deltas.
        let mut fields = self.fields;
        for ordinal in keys[identity as usize].fields.clone() {
            fields[ordinal as usize].mutable = false;
        }

        Ok(EntityDef {
            name: self.name,
            instantiable: self.instantiable,
            supertypes: self.supertypes,
            fields,
            keys,
            identity,
        })
    }
}

/// In-progress field declaration.
pub struct FieldDraft<'a> {
    def: &'a mut FieldDef,
}

impl FieldDraft<'_> {
    /// Non-nullable: the field must hold a value on every live row.
    pub fn required(self) -> Self {
        self.def.nullable = false;
        self
    }

    /// Writable only inside the transaction that creates the row.
    pub fn immutable(self) -> Self {
        self.def.mutable = false;
        self
    }

    /// Value applied on create when the caller supplies none.
    pub fn default_value(self, value: Value) -> Self {
        self.def.default = Some(value);
        self
    }
}
