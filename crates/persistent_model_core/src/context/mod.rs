//! Object contexts and cross-context save notifications.
//!
//! # Responsibility
//! - Own the identity map of live `DomainObject`s.
//! - Drive save cycles against a `PersistentStore`.
//! - Fan out `ContextDidSave` notifications to sibling contexts.

pub mod notification;
pub mod object_context;

pub use notification::{ContextDidSave, ContextId, SaveNotifier};
pub use object_context::{ContextError, ContextResult, MergeSummary, ObjectContext, SaveSummary};
