//! Storage adapter contract and its concrete backends.
//!
//! # Responsibility
//! - Define the record CRUD/save contract consumed by `ObjectContext`.
//! - Provide a SQLite backend and an in-process snapshot backend.
//!
//! # Invariants
//! - `create_persistent_object` never overwrites: an existing key is reported
//!   as `StoreError::DuplicateKey` carrying the stored record.
//! - Record `key` and `type` never change once created.
//! - Writes are staged until `save`; a failed `save` keeps them staged.
//! - Implementations serialize their own calls; contexts add no locking.

use crate::db::DbError;
use crate::model::record::{DeletePolicy, PersistentRecord, Timestamp};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod memory_store;
pub mod sqlite_store;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by persistent stores.
#[derive(Debug)]
pub enum StoreError {
    Db(DbError),
    /// A record with this key already exists; carries the stored record.
    DuplicateKey(Box<PersistentRecord>),
    InvalidArgument(String),
    /// The store was closed with `close_store`.
    Closed,
    Io(std::io::Error),
    Snapshot(serde_json::Error),
    InvalidData(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::DuplicateKey(existing) => {
                write!(f, "persistent object already exists: {}", existing.key())
            }
            Self::InvalidArgument(message) => write!(f, "invalid argument: {message}"),
            Self::Closed => write!(f, "persistent store is closed"),
            Self::Io(err) => write!(f, "{err}"),
            Self::Snapshot(err) => write!(f, "invalid store snapshot: {err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted record data: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Snapshot(err) => Some(err),
            Self::DuplicateKey(_) | Self::InvalidArgument(_) | Self::Closed => None,
            Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Snapshot(value)
    }
}

/// Record storage contract used by `ObjectContext`.
pub trait PersistentStore: Send + Sync {
    /// Returns the record for `key`, including staged but unsaved writes.
    fn persistent_object_with_key(&self, key: &str) -> StoreResult<Option<PersistentRecord>>;

    /// Returns every record whose type equals `type_name`, sorted by key.
    fn persistent_objects_of_type(&self, type_name: &str) -> StoreResult<Vec<PersistentRecord>>;

    /// Stages a new empty record.
    ///
    /// Fails with `StoreError::DuplicateKey` when `key` already exists.
    fn create_persistent_object(&self, key: &str, type_name: &str)
        -> StoreResult<PersistentRecord>;

    /// Stages the record's current `data` and `last_update`.
    ///
    /// The key must already be visible (stored or staged by
    /// `create_persistent_object`); otherwise `StoreError::InvalidArgument`.
    fn update_persistent_object(&self, record: &PersistentRecord) -> StoreResult<()>;

    /// Stages removal of `key`; absent keys are a no-op.
    fn delete_persistent_object(&self, key: &str) -> StoreResult<()>;

    /// Immediately removes records older than `older_than` under `policy`.
    ///
    /// `None` matches every type. Returns `false` when the removal failed.
    fn delete_entries_of_type(
        &self,
        type_name: Option<&str>,
        older_than: Timestamp,
        policy: DeletePolicy,
    ) -> bool;

    /// Drops staged writes for `keys` without touching stored records.
    ///
    /// Returns the number of staged writes dropped.
    fn discard_staged(&self, keys: &BTreeSet<String>) -> usize;

    /// Flushes staged writes.
    ///
    /// `false` means the durable state is unknown; staged writes are kept.
    fn save(&self) -> bool;
}

/// Write staged in a store until the next `save`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StagedChange {
    Upsert(PersistentRecord),
    /// Key deleted and created again before the same `save`.
    Replace(PersistentRecord),
    Delete,
}

impl StagedChange {
    /// Staged record visible to reads, `None` when the key is staged for deletion.
    pub(crate) fn visible_record(&self) -> Option<&PersistentRecord> {
        match self {
            Self::Upsert(record) | Self::Replace(record) => Some(record),
            Self::Delete => None,
        }
    }
}

/// Stages a freshly created record, keeping delete-then-create as a replacement.
pub(crate) fn stage_created(
    staged: &mut BTreeMap<String, StagedChange>,
    record: &PersistentRecord,
) {
    let change = match staged.get(record.key()) {
        Some(StagedChange::Delete) => StagedChange::Replace(record.clone()),
        _ => StagedChange::Upsert(record.clone()),
    };
    staged.insert(record.key().to_string(), change);
}

/// Stages new contents for a record, preserving a pending replacement.
pub(crate) fn stage_updated(
    staged: &mut BTreeMap<String, StagedChange>,
    record: &PersistentRecord,
) {
    let change = match staged.get(record.key()) {
        Some(StagedChange::Replace(_)) => StagedChange::Replace(record.clone()),
        _ => StagedChange::Upsert(record.clone()),
    };
    staged.insert(record.key().to_string(), change);
}

/// Requires a visible record for `record.key()` with the same type.
pub(crate) fn ensure_updatable(
    existing: Option<&PersistentRecord>,
    record: &PersistentRecord,
) -> StoreResult<()> {
    match existing {
        None => Err(StoreError::InvalidArgument(format!(
            "record `{}` does not exist; create it before updating",
            record.key()
        ))),
        Some(existing) if existing.type_name() != record.type_name() => {
            Err(StoreError::InvalidArgument(format!(
                "record `{}` has type `{}`; type cannot change to `{}`",
                record.key(),
                existing.type_name(),
                record.type_name()
            )))
        }
        Some(_) => Ok(()),
    }
}

pub(crate) fn validate_record_identity(key: &str, type_name: &str) -> StoreResult<()> {
    if key.trim().is_empty() {
        return Err(StoreError::InvalidArgument(
            "record key must not be empty".to_string(),
        ));
    }
    if type_name.trim().is_empty() {
        return Err(StoreError::InvalidArgument(
            "record type must not be empty".to_string(),
        ));
    }
    Ok(())
}
