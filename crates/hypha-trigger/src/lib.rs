//! Trigger matching and dispatch.
//!
//! Triggers live in a KV bucket and are indexed by namespace pattern. The
//! [`Dispatcher`] consumes the durable event stream, matches each event
//! against the index (by type/namespace/object-type predicates or by a
//! [`criteria`] expression) and invokes the matched trigger's action on
//! the runtime service.

pub mod criteria;
pub mod dispatcher;
pub mod error;
pub mod index;
pub mod matcher;
pub mod store;
pub mod types;
pub mod view;

pub use criteria::{Criteria, EvalError};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::TriggerError;
pub use index::NamespaceIndex;
pub use matcher::{match_trigger, namespace_matches};
pub use store::TriggerStore;
pub use types::Trigger;
pub use view::event_view;
