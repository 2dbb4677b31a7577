//! Delta event fan-out for out-of-band consumers.
//!
//! An [`EventHub`] is a [`DeltaListener`](crate::DeltaListener) that
//! broadcasts committed deltas over bounded channels:
//! - Filtering by entity and delta operation
//! - Bounded buffers with slow-subscriber dropping
//! - Receivers may live on other threads; only the channel crosses
//!
//! ```ignore
//! let hub = Rc::new(RefCell::new(EventHub::new()));
//! store.set_commit_listener(Box::new(TransformDeltaListener::new(Box::new(hub.clone()))));
//!
//! let handle = hub.borrow_mut().subscribe(EventFilter::entity(item));
//! // ... commit ...
//! let delta = handle.receiver.try_recv().unwrap();
//! ```

mod hub;
mod types;

pub use hub::EventHub;
pub use types::{DropReason, EventFilter, SubscriptionHandle, SubscriptionId};
