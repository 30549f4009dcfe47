//! In-process persistent store with an optional on-disk snapshot.
//!
//! # Responsibility
//! - Back contexts that do not need SQLite (tests, caches, tooling).
//! - Optionally mirror committed records into a single JSON snapshot file.
//!
//! # Invariants
//! - Committed state only changes on a successful `save`.
//! - The snapshot file is replaced atomically (temp file + rename).
//! - A failed snapshot write leaves committed and staged state untouched.

use crate::model::record::{now_epoch_ms, DeletePolicy, PersistentRecord, Timestamp};
use crate::store::{
    ensure_updatable, stage_created, stage_updated, validate_record_identity, PersistentStore,
    StagedChange, StoreError, StoreResult,
};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    record: PersistentRecord,
    created_at: Timestamp,
    accessed_at: Timestamp,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: Vec<StoredEntry>,
}

#[derive(Default)]
struct MemoryStoreState {
    committed: BTreeMap<String, StoredEntry>,
    staged: BTreeMap<String, StagedChange>,
}

/// Map-backed record store.
#[derive(Default)]
pub struct MemoryStore {
    snapshot_path: Option<PathBuf>,
    state: Mutex<MemoryStoreState>,
}

impl MemoryStore {
    /// Creates an empty store that lives only as long as the process.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a snapshot-backed store, loading `path` when it exists.
    pub fn open_snapshot(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let committed = if path.exists() {
            let snapshot: Snapshot = serde_json::from_slice(&fs::read(&path)?)?;
            if snapshot.version != SNAPSHOT_FORMAT_VERSION {
                return Err(StoreError::InvalidData(format!(
                    "snapshot version {} is not supported (expected {SNAPSHOT_FORMAT_VERSION})",
                    snapshot.version
                )));
            }
            snapshot
                .entries
                .into_iter()
                .map(|entry| (entry.record.key().to_string(), entry))
                .collect()
        } else {
            BTreeMap::new()
        };

        info!(
            "event=store_open module=store status=ok backend=memory snapshot={} records={}",
            path.display(),
            committed.len()
        );

        Ok(Self {
            snapshot_path: Some(path),
            state: Mutex::new(MemoryStoreState {
                committed,
                staged: BTreeMap::new(),
            }),
        })
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Number of committed records.
    pub fn len(&self) -> usize {
        self.lock_state().committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of staged writes waiting for `save`.
    pub fn pending_change_count(&self) -> usize {
        self.lock_state().staged.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryStoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PersistentStore for MemoryStore {
    fn persistent_object_with_key(&self, key: &str) -> StoreResult<Option<PersistentRecord>> {
        Ok(lookup(&mut self.lock_state(), key))
    }

    fn persistent_objects_of_type(&self, type_name: &str) -> StoreResult<Vec<PersistentRecord>> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let now = now_epoch_ms();

        let mut records: BTreeMap<String, PersistentRecord> = BTreeMap::new();
        for (key, entry) in state
            .committed
            .iter_mut()
            .filter(|(_, entry)| entry.record.type_name() == type_name)
        {
            entry.accessed_at = now;
            records.insert(key.clone(), entry.record.clone());
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

        if let Some(existing) = lookup(&mut state, key) {
            return Err(StoreError::DuplicateKey(Box::new(existing)));
        }

        let record = PersistentRecord::new(key, type_name);
        stage_created(&mut state.staged, &record);
        Ok(record)
    }

    fn update_persistent_object(&self, record: &PersistentRecord) -> StoreResult<()> {
        validate_record_identity(record.key(), record.type_name())?;
        let mut state = self.lock_state();

        let existing = lookup(&mut state, record.key());
        ensure_updatable(existing.as_ref(), record)?;
        stage_updated(&mut state.staged, record);
        Ok(())
    }

    fn delete_persistent_object(&self, key: &str) -> StoreResult<()> {
        self.lock_state()
            .staged
            .insert(key.to_string(), StagedChange::Delete);
        Ok(())
    }

    fn delete_entries_of_type(
        &self,
        type_name: Option<&str>,
        older_than: Timestamp,
        policy: DeletePolicy,
    ) -> bool {
        let mut state = self.lock_state();
        let mut next = state.committed.clone();
        next.retain(|_, entry| {
            let type_matches = type_name.map_or(true, |name| entry.record.type_name() == name);
            let reference = match policy {
                DeletePolicy::ByCreationDate => entry.created_at,
                DeletePolicy::ByAccessDate => entry.accessed_at,
                DeletePolicy::ByUpdateDate => entry.record.last_update().unwrap_or(entry.created_at),
            };
            !(type_matches && reference < older_than)
        });

        let removed = state.committed.len() - next.len();
        if removed > 0 {
            if let Err(err) = self.write_snapshot(&next) {
                error!(
                    "event=store_purge module=store status=error backend=memory policy={} error={err}",
                    policy.as_str()
                );
                return false;
            }
        }

        state.committed = next;
        info!(
            "event=store_purge module=store status=ok backend=memory policy={} removed={removed}",
            policy.as_str()
        );
        true
    }

    fn discard_staged(&self, keys: &BTreeSet<String>) -> usize {
        let mut state = self.lock_state();
        let before = state.staged.len();
        state.staged.retain(|key, _| !keys.contains(key));
        before - state.staged.len()
    }

    fn save(&self) -> bool {
        let mut state = self.lock_state();
        if state.staged.is_empty() {
            return true;
        }

        let now = now_epoch_ms();
        let mut next = state.committed.clone();
        for (key, change) in &state.staged {
            match change {
                StagedChange::Delete => {
                    next.remove(key);
                }
                StagedChange::Replace(record) => {
                    next.insert(key.clone(), new_entry(record, now));
                }
                StagedChange::Upsert(record) => match next.get_mut(key) {
                    Some(entry) => entry.record = record.clone(),
                    None => {
                        next.insert(key.clone(), new_entry(record, now));
                    }
                },
            }
        }

        if let Err(err) = self.write_snapshot(&next) {
            error!(
                "event=store_save module=store status=error backend=memory pending_changes={} error={err}",
                state.staged.len()
            );
            return false;
        }

        let flushed = state.staged.len();
        state.committed = next;
        state.staged.clear();
        info!("event=store_save module=store status=ok backend=memory flushed={flushed}");
        true
    }
}

impl MemoryStore {
    fn write_snapshot(&self, committed: &BTreeMap<String, StoredEntry>) -> StoreResult<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let snapshot = Snapshot {
            version: SNAPSHOT_FORMAT_VERSION,
            entries: committed.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec(&snapshot)?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, bytes)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

fn lookup(state: &mut MemoryStoreState, key: &str) -> Option<PersistentRecord> {
    if let Some(change) = state.staged.get(key) {
        return change.visible_record().cloned();
    }
    state.committed.get_mut(key).map(|entry| {
        entry.accessed_at = now_epoch_ms();
        entry.record.clone()
    })
}

fn new_entry(record: &PersistentRecord, now: Timestamp) -> StoredEntry {
    StoredEntry {
        record: record.clone(),
        created_at: now,
        accessed_at: now,
    }
}
