//! SQLite-backed persistent store.
//!
//! # Responsibility
//! - Persist records in the `persistent_objects` table.
//! - Stage creates/updates/deletes in memory and flush them in one
//!   transaction on `save`.
//! - Keep a read cache of records loaded from disk.
//!
//! # Invariants
//! - Reads resolve staged changes first, then the cache, then disk.
//! - Every read of a stored record refreshes its `accessed_at`, cached or not.
//! - A failed flush rolls back and keeps every staged change.
//! - `object_type` is written on insert only and never updated.

use crate::db::{open_db, open_db_in_memory};
use crate::model::record::{now_epoch_ms, DeletePolicy, PersistentRecord, Timestamp};
use crate::store::{
    ensure_updatable, stage_created, stage_updated, validate_record_identity, PersistentStore,
    StagedChange, StoreError, StoreResult,
};
use log::{debug, error, info, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

const RECORD_SELECT_SQL: &str = "SELECT
    object_key,
    object_type,
    data,
    last_update
FROM persistent_objects";

const RECORD_UPSERT_SQL: &str = "INSERT INTO persistent_objects (
    object_key,
    object_type,
    data,
    last_update,
    created_at,
    accessed_at
) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
ON CONFLICT(object_key) DO UPDATE SET
    data = excluded.data,
    last_update = excluded.last_update;";

/// Record store over one SQLite connection.
pub struct SqliteStore {
    location: String,
    state: Mutex<SqliteStoreState>,
}

struct SqliteStoreState {
    conn: Option<Connection>,
    cache: HashMap<String, PersistentRecord>,
    staged: BTreeMap<String, StagedChange>,
}

impl SqliteStore {
    /// Opens (and migrates) a database file.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let location = path.as_ref().display().to_string();
        let conn = open_db(path)?;
        Ok(Self::from_connection(location, conn))
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = open_db_in_memory()?;
        Ok(Self::from_connection(":memory:".to_string(), conn))
    }

    fn from_connection(location: String, conn: Connection) -> Self {
        Self {
            location,
            state: Mutex::new(SqliteStoreState {
                conn: Some(conn),
                cache: HashMap::new(),
                staged: BTreeMap::new(),
            }),
        }
    }

    /// Database path, or `:memory:`.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Closes the connection; unsaved staged changes are discarded.
    pub fn close_store(&self) {
        let mut state = self.lock_state();
        if !state.staged.is_empty() {
            warn!(
                "event=store_close module=store status=discard backend=sqlite pending_changes={}",
                state.staged.len()
            );
        }
        state.staged.clear();
        state.cache.clear();

        if let Some(conn) = state.conn.take() {
            match conn.close() {
                Ok(()) => info!("event=store_close module=store status=ok backend=sqlite"),
                Err((_, err)) => error!(
                    "event=store_close module=store status=error backend=sqlite error={err}"
                ),
            }
        }
    }

    /// Drops every cached record; staged changes are kept.
    pub fn clean_cache(&self) {
        let mut state = self.lock_state();
        debug!(
            "event=store_clean_cache module=store status=ok backend=sqlite dropped={}",
            state.cache.len()
        );
        state.cache.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().conn.is_none()
    }

    /// Number of staged writes waiting for `save`.
    pub fn pending_change_count(&self) -> usize {
        self.lock_state().staged.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, SqliteStoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PersistentStore for SqliteStore {
    fn persistent_object_with_key(&self, key: &str) -> StoreResult<Option<PersistentRecord>> {
        let mut state = self.lock_state();
        lookup(&mut state, key)
    }

    fn persistent_objects_of_type(&self, type_name: &str) -> StoreResult<Vec<PersistentRecord>> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let conn = state.conn.as_ref().ok_or(StoreError::Closed)?;

        let mut stmt = conn.prepare(&format!(
            "{RECORD_SELECT_SQL} WHERE object_type = ?1 ORDER BY object_key ASC;"
        ))?;
        let mut rows = stmt.query([type_name])?;
        let mut records = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let record = parse_record_row(row)?;
            records.insert(record.key().to_string(), record);
        }
        drop(rows);
        drop(stmt);

        conn.execute(
            "UPDATE persistent_objects SET accessed_at = ?1 WHERE object_type = ?2;",
            params![now_epoch_ms(), type_name],
        )?;

        for (key, record) in &records {
            if !state.staged.contains_key(key) {
                state.cache.insert(key.clone(), record.clone());
            }
        }

        for (key, change) in &state.staged {
            match change.visible_record() {
                Some(record) if record.type_name() == type_name => {
                    records.insert(key.clone(), record.clone());
                }
                _ => {
                    records.remove(key);
                }
            }
        }

        Ok(records.into_values().collect())
    }

    fn create_persistent_object(
        &self,
        key: &str,
        type_name: &str,
    ) -> StoreResult<PersistentRecord> {
        validate_record_identity(key, type_name)?;
        let mut state = self.lock_state();

        if let Some(existing) = lookup(&mut state, key)? {
            return Err(StoreError::DuplicateKey(Box::new(existing)));
        }

        let record = PersistentRecord::new(key, type_name);
        stage_created(&mut state.staged, &record);
        Ok(record)
    }

    fn update_persistent_object(&self, record: &PersistentRecord) -> StoreResult<()> {
        validate_record_identity(record.key(), record.type_name())?;
        let mut state = self.lock_state();

        let existing = lookup(&mut state, record.key())?;
        ensure_updatable(existing.as_ref(), record)?;
        stage_updated(&mut state.staged, record);
        Ok(())
    }

    fn delete_persistent_object(&self, key: &str) -> StoreResult<()> {
        let mut state = self.lock_state();
        if state.conn.is_none() {
            return Err(StoreError::Closed);
        }
        state.cache.remove(key);
        state.staged.insert(key.to_string(), StagedChange::Delete);
        Ok(())
    }

    fn delete_entries_of_type(
        &self,
        type_name: Option<&str>,
        older_than: Timestamp,
        policy: DeletePolicy,
    ) -> bool {
        let mut state = self.lock_state();
        let Some(conn) = state.conn.as_ref() else {
            error!("event=store_purge module=store status=error backend=sqlite error=closed");
            return false;
        };

        let column = match policy {
            DeletePolicy::ByCreationDate => "created_at",
            DeletePolicy::ByAccessDate => "accessed_at",
            DeletePolicy::ByUpdateDate => "COALESCE(last_update, created_at)",
        };
        let sql = format!(
            "DELETE FROM persistent_objects
             WHERE (?1 IS NULL OR object_type = ?1)
               AND {column} < ?2;"
        );

        match conn.execute(&sql, params![type_name, older_than]) {
            Ok(removed) => {
                state.cache.clear();
                info!(
                    "event=store_purge module=store status=ok backend=sqlite policy={} removed={removed}",
                    policy.as_str()
                );
                true
            }
            Err(err) => {
                error!(
                    "event=store_purge module=store status=error backend=sqlite policy={} error={err}",
                    policy.as_str()
                );
                false
            }
        }
    }

    fn discard_staged(&self, keys: &BTreeSet<String>) -> usize {
        let mut state = self.lock_state();
        let before = state.staged.len();
        state.staged.retain(|key, _| !keys.contains(key));
        let dropped = before - state.staged.len();
        debug!("event=store_discard module=store status=ok backend=sqlite dropped={dropped}");
        dropped
    }

    fn save(&self) -> bool {
        let started_at = Instant::now();
        let mut guard = self.lock_state();
        let state = &mut *guard;

        if state.staged.is_empty() {
            return true;
        }

        let Some(conn) = state.conn.as_mut() else {
            error!("event=store_save module=store status=error backend=sqlite error=closed");
            return false;
        };

        if let Err(err) = flush_staged(conn, &state.staged) {
            error!(
                "event=store_save module=store status=error backend=sqlite pending_changes={} duration_ms={} error={err}",
                state.staged.len(),
                started_at.elapsed().as_millis()
            );
            return false;
        }

        let flushed = state.staged.len();
        for (key, change) in std::mem::take(&mut state.staged) {
            match change {
                StagedChange::Upsert(record) | StagedChange::Replace(record) => {
                    state.cache.insert(key, record);
                }
                StagedChange::Delete => {
                    state.cache.remove(&key);
                }
            }
        }

        info!(
            "event=store_save module=store status=ok backend=sqlite flushed={flushed} duration_ms={}",
            started_at.elapsed().as_millis()
        );
        true
    }
}

fn lookup(state: &mut SqliteStoreState, key: &str) -> StoreResult<Option<PersistentRecord>> {
    if let Some(change) = state.staged.get(key) {
        return Ok(change.visible_record().cloned());
    }
    let conn = state.conn.as_ref().ok_or(StoreError::Closed)?;
    if let Some(record) = state.cache.get(key) {
        touch_accessed(conn, key)?;
        return Ok(Some(record.clone()));
    }

    let record = conn
        .query_row(
            &format!("{RECORD_SELECT_SQL} WHERE object_key = ?1;"),
            [key],
            |row| Ok(parse_record_row(row)),
        )
        .optional()?
        .transpose()?;

    if let Some(record) = &record {
        touch_accessed(conn, key)?;
        state.cache.insert(key.to_string(), record.clone());
    }

    Ok(record)
}

fn touch_accessed(conn: &Connection, key: &str) -> StoreResult<()> {
    conn.execute(
        "UPDATE persistent_objects SET accessed_at = ?1 WHERE object_key = ?2;",
        params![now_epoch_ms(), key],
    )?;
    Ok(())
}

fn flush_staged(
    conn: &mut Connection,
    staged: &BTreeMap<String, StagedChange>,
) -> StoreResult<()> {
    let now = now_epoch_ms();
    let tx = conn.transaction()?;

    for (key, change) in staged {
        if matches!(change, StagedChange::Delete | StagedChange::Replace(_)) {
            tx.execute("DELETE FROM persistent_objects WHERE object_key = ?1;", [key])?;
        }
        if let Some(record) = change.visible_record() {
            tx.execute(
                RECORD_UPSERT_SQL,
                params![
                    record.key(),
                    record.type_name(),
                    record.data(),
                    record.last_update(),
                    now,
                ],
            )?;
        }
    }

    tx.commit()?;
    Ok(())
}

fn parse_record_row(row: &Row<'_>) -> StoreResult<PersistentRecord> {
    let key: String = row.get("object_key")?;
    let type_name: String = row.get("object_type")?;
    if key.is_empty() || type_name.is_empty() {
        return Err(StoreError::InvalidData(format!(
            "record `{key}` has an empty key or type in persistent_objects"
        )));
    }

    let mut record = PersistentRecord::new(key, type_name);
    record.set_data(row.get("data")?);
    record.set_last_update(row.get("last_update")?);
    Ok(record)
}
