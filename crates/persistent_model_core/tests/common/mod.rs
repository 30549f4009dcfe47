#![allow(dead_code)]

use persistent_model_core::{
    DeletePolicy, MemoryStore, ModelRegistry, ModelSchema, PersistentRecord, PersistentStore,
    PropertyKind, StoreResult, Timestamp,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const USER: &str = "User";
pub const VIDEO: &str = "Video";

pub fn user_schema() -> ModelSchema {
    ModelSchema::builder(USER)
        .property("username", PropertyKind::Text)
        .property("age", PropertyKind::Integer)
        .property("homepage", PropertyKind::Url)
        .transient_property("session_token", PropertyKind::Text)
        .key_mapping("id", "key")
        .key_mapping("login", "username")
        .build()
        .unwrap()
}

pub fn video_schema() -> ModelSchema {
    ModelSchema::builder(VIDEO)
        .property("title", PropertyKind::Text)
        .property("duration", PropertyKind::Float)
        .property("tags", PropertyKind::TextList)
        .trusted_interval(Duration::from_secs(60))
        .build()
        .unwrap()
}

pub fn registry() -> Arc<ModelRegistry> {
    let mut registry = ModelRegistry::new();
    registry.register(user_schema()).unwrap();
    registry.register(video_schema()).unwrap();
    Arc::new(registry)
}

/// Store wrapper whose `save` can be switched to fail.
pub struct FlakyStore {
    inner: MemoryStore,
    fail_saves: AtomicBool,
    save_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_saves: AtomicBool::new(false),
            save_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    pub fn committed_len(&self) -> usize {
        self.inner.len()
    }

    pub fn pending_change_count(&self) -> usize {
        self.inner.pending_change_count()
    }
}

impl PersistentStore for FlakyStore {
    fn persistent_object_with_key(&self, key: &str) -> StoreResult<Option<PersistentRecord>> {
        self.inner.persistent_object_with_key(key)
    }

    fn persistent_objects_of_type(&self, type_name: &str) -> StoreResult<Vec<PersistentRecord>> {
        self.inner.persistent_objects_of_type(type_name)
    }

    fn create_persistent_object(
        &self,
        key: &str,
        type_name: &str,
    ) -> StoreResult<PersistentRecord> {
        self.inner.create_persistent_object(key, type_name)
    }

    fn update_persistent_object(&self, record: &PersistentRecord) -> StoreResult<()> {
        self.inner.update_persistent_object(record)
    }

    fn delete_persistent_object(&self, key: &str) -> StoreResult<()> {
        self.inner.delete_persistent_object(key)
    }

    fn delete_entries_of_type(
        &self,
        type_name: Option<&str>,
        older_than: Timestamp,
        policy: DeletePolicy,
    ) -> bool {
        self.inner.delete_entries_of_type(type_name, older_than, policy)
    }

    fn discard_staged(&self, keys: &BTreeSet<String>) -> usize {
        self.inner.discard_staged(keys)
    }

    fn save(&self) -> bool {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.save()
    }
}
