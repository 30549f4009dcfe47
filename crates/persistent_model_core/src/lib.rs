//! Object persistence core.
//!
//! An `ObjectContext` keeps one live `DomainObject` per key, tracks which
//! objects changed, and writes them to a `PersistentStore` in batched save
//! cycles. Sibling contexts stay in sync through `ContextDidSave`
//! notifications.

pub mod context;
pub mod db;
pub mod logging;
pub mod model;
pub mod store;

pub use context::{
    ContextDidSave, ContextError, ContextId, ContextResult, MergeSummary, ObjectContext,
    SaveNotifier, SaveSummary,
};
pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use logging::{default_log_level, init_logging, logging_status, LoggingConfig, LoggingError};
pub use model::mapping::KeyMapping;
pub use model::object::DomainObject;
pub use model::record::{now_epoch_ms, DeletePolicy, PersistentRecord, Timestamp};
pub use model::schema::{
    ModelRegistry, ModelSchema, ModelSchemaBuilder, PropertyDescriptor, PropertyError,
    PropertyKind, SchemaError,
};
pub use store::memory_store::MemoryStore;
pub use store::sqlite_store::SqliteStore;
pub use store::{PersistentStore, StoreError, StoreResult};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
