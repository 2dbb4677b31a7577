//! # Stratum
//!
//! An in-process, schema-typed, transactional object store with delta
//! replication.
//!
//! ## Core Concepts
//!
//! - **Schema**: Static entity/field/key descriptors, built once
//! - **Transactions**: Arbitrarily nested guards with undo-log rollback
//! - **Keys**: Ordered unique and non-unique indexes with point, range
//!   and multi-value lookup
//! - **Deltas**: Committed changes classified into insert/update/delete
//!   streams for replication into a second store
//!
//! ## Example
//!
//! ```ignore
//! use stratum::{Schema, Store, Value, ValueKind};
//!
//! let mut b = Schema::builder();
//! {
//!     let e = b.entity("person");
//!     e.field("id", ValueKind::Long).required();
//!     e.field("name", ValueKind::Str);
//!     e.identity_key("pk", &["id"]);
//! }
//! let schema = b.build()?;
//!
//! let mut store = Store::new(schema);
//! let person = store.schema().entity("person")?;
//! let id = store.schema().field(person, "id")?;
//!
//! let mut tx = store.begin(false);
//! tx.create(person, vec![(id, Value::Long(1))])?;
//! tx.commit()?;
//! ```

pub mod commit;
pub mod error;
pub mod events;
pub mod index;
pub mod pool;
pub mod records;
pub mod schema;
pub mod store;
pub mod types;

// Re-exports
pub use commit::{
    ApplyDeltaListener, CommitListener, Delta, DeltaListener, DeltaOp, FanoutDeltaListener,
    ReleaseDeltaListener, TransformDeltaListener,
};
pub use error::{Result, StoreError};
pub use events::{DropReason, EventFilter, EventHub, SubscriptionHandle, SubscriptionId};
pub use index::{Direction, KeyFilter, KeyTuple};
pub use pool::{Pool, Poolable};
pub use records::{BitPlane, DeltaFrame, Record};
pub use schema::{
    EntityDef, EntityTypeId, FieldDef, FieldId, KeyDef, KeyId, Schema, SchemaBuilder,
};
pub use store::{RowId, Store, StoreConfig, StoreCore, Table, Transaction};
pub use types::{Decimal, EntityId, Timestamp, Value, ValueKind};
