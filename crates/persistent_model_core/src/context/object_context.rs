//! Identity map and save orchestration.
//!
//! # Responsibility
//! - Keep at most one live `DomainObject` per key.
//! - Hydrate objects from the persistent store on demand.
//! - Push changed and deleted objects to the store on `save`.
//! - Apply other contexts' save notifications.
//!
//! # Invariants
//! - A key is hydrated at most once while it stays live.
//! - Keys deleted locally are not visible again before the next save.
//! - A failed save keeps every change flag and pending delete, so a retry
//!   writes the same delta; no notification is posted.
//! - A failed save leaves nothing of its delta staged in the store.
//! - Lock order is context state, then object. Objects never lock the
//!   context while holding their own lock.

use crate::context::notification::{ContextDidSave, ContextId, SaveNotifier};
use crate::model::object::{DomainObject, PendingWrite};
use crate::model::record::{now_epoch_ms, DeletePolicy, Timestamp};
use crate::model::schema::{ModelRegistry, PropertyError};
use crate::store::{PersistentStore, StoreError};
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

pub type ContextResult<T> = Result<T, ContextError>;

/// Errors raised by context and object operations.
#[derive(Debug)]
pub enum ContextError {
    /// Malformed call, e.g. an empty key.
    InvalidArgument(String),
    /// Another live object already uses `key`; carries that object.
    DuplicateKey {
        key: String,
        existing: DomainObject,
    },
    /// The object is registered in a different live context.
    AlreadyRegistered(String),
    /// No schema is registered for a record or object type.
    UnknownModelType(String),
    TypeMismatch {
        key: String,
        expected: String,
        found: String,
    },
    InvalidPayload {
        key: String,
        message: String,
    },
    Property(PropertyError),
    Store(StoreError),
    /// The store reported a failed save; its durable state is unknown.
    SaveFailed {
        saved_keys: usize,
        deleted_keys: usize,
    },
}

impl Display for ContextError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidArgument(message) => write!(f, "invalid argument: {message}"),
            Self::DuplicateKey { key, .. } => {
                write!(f, "an object with key `{key}` is already registered")
            }
            Self::AlreadyRegistered(key) => {
                write!(f, "object `{key}` is registered in another context")
            }
            Self::UnknownModelType(type_name) => write!(f, "unknown model type: {type_name}"),
            Self::TypeMismatch {
                key,
                expected,
                found,
            } => write!(f, "object `{key}` has type `{found}`, expected `{expected}`"),
            Self::InvalidPayload { key, message } => {
                write!(f, "invalid payload for `{key}`: {message}")
            }
            Self::Property(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::SaveFailed {
                saved_keys,
                deleted_keys,
            } => write!(
                f,
                "persistent store failed to save {saved_keys} changed and {deleted_keys} deleted objects"
            ),
        }
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Property(err) => Some(err),
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<PropertyError> for ContextError {
    fn from(value: PropertyError) -> Self {
        Self::Property(value)
    }
}

impl From<StoreError> for ContextError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// Keys written by one successful save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveSummary {
    pub saved_keys: BTreeSet<String>,
    pub deleted_keys: BTreeSet<String>,
}

impl SaveSummary {
    pub fn is_empty(&self) -> bool {
        self.saved_keys.is_empty() && self.deleted_keys.is_empty()
    }
}

/// Live objects touched by a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Keys whose values were reloaded from the store.
    pub refreshed: Vec<String>,
    /// Keys removed from the context.
    pub removed: Vec<String>,
}

impl MergeSummary {
    pub fn is_empty(&self) -> bool {
        self.refreshed.is_empty() && self.removed.is_empty()
    }

    fn absorb(&mut self, other: MergeSummary) {
        self.refreshed.extend(other.refreshed);
        self.removed.extend(other.removed);
    }
}

pub(crate) struct ContextInner {
    id: ContextId,
    store: Option<Arc<dyn PersistentStore>>,
    registry: Arc<ModelRegistry>,
    notifier: Option<SaveNotifier>,
    state: Mutex<ContextState>,
    save_cycle: Mutex<()>,
}

#[derive(Default)]
struct ContextState {
    live: HashMap<String, DomainObject>,
    pending_deletes: BTreeSet<String>,
}

/// Handle to one object context.
///
/// Clones share the same identity map. Dropping the last handle discards
/// unsaved changes.
#[derive(Clone)]
pub struct ObjectContext {
    inner: Arc<ContextInner>,
}

impl ObjectContext {
    /// Creates a context over `store`; `None` keeps every object in memory only.
    pub fn new(store: Option<Arc<dyn PersistentStore>>, registry: Arc<ModelRegistry>) -> Self {
        Self::build(store, registry, None)
    }

    /// Creates a context that posts its saves to `notifier`.
    pub fn with_notifier(
        store: Option<Arc<dyn PersistentStore>>,
        registry: Arc<ModelRegistry>,
        notifier: SaveNotifier,
    ) -> Self {
        Self::build(store, registry, Some(notifier))
    }

    fn build(
        store: Option<Arc<dyn PersistentStore>>,
        registry: Arc<ModelRegistry>,
        notifier: Option<SaveNotifier>,
    ) -> Self {
        let inner = ContextInner {
            id: ContextId::next(),
            store,
            registry,
            notifier,
            state: Mutex::new(ContextState::default()),
            save_cycle: Mutex::new(()),
        };
        debug!(
            "event=context_create module=context status=ok context={} persistent={}",
            inner.id,
            inner.store.is_some()
        );
        Self {
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn persistent_store(&self) -> Option<Arc<dyn PersistentStore>> {
        self.inner.store.clone()
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.inner.registry
    }

    pub fn notifier(&self) -> Option<&SaveNotifier> {
        self.inner.notifier.as_ref()
    }

    /// `true` when both handles refer to the same context.
    pub fn same_context(a: &ObjectContext, b: &ObjectContext) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// `true` when any live object changed or any delete is waiting for `save`.
    pub fn has_changes(&self) -> bool {
        let state = self.lock_state();
        !state.pending_deletes.is_empty() || state.live.values().any(DomainObject::has_changes)
    }

    /// Returns the live object for `key`, hydrating it from the store on a miss.
    pub fn object_for_key(&self, key: &str) -> ContextResult<Option<DomainObject>> {
        let mut state = self.lock_state();
        if let Some(object) = state.live.get(key) {
            return Ok(Some(object.clone()));
        }
        if state.pending_deletes.contains(key) {
            return Ok(None);
        }
        let Some(store) = &self.inner.store else {
            return Ok(None);
        };

        match store.persistent_object_with_key(key)? {
            Some(record) => {
                let schema = self
                    .inner
                    .registry
                    .schema(record.type_name())
                    .ok_or_else(|| ContextError::UnknownModelType(record.type_name().to_string()))?;
                let object = DomainObject::from_record(&schema, &record)?;
                self.register_hydrated(&mut state, &object);
                Ok(Some(object))
            }
            None => Ok(None),
        }
    }

    /// Checks live objects only; the store is never consulted.
    pub fn contains_object_with_key(&self, key: &str) -> bool {
        self.lock_state().live.contains_key(key)
    }

    /// All live objects, sorted by key.
    pub fn registered_objects(&self) -> Vec<DomainObject> {
        let state = self.lock_state();
        let mut objects: Vec<(String, DomainObject)> = state
            .live
            .iter()
            .map(|(key, object)| (key.clone(), object.clone()))
            .collect();
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        objects.into_iter().map(|(_, object)| object).collect()
    }

    /// Registers a detached object and marks it changed.
    ///
    /// Inserting the instance already live under its key is a no-op. Any
    /// other object sharing the key is rejected with `DuplicateKey` and the
    /// live object stays in place.
    pub fn insert_object(&self, object: &DomainObject) -> ContextResult<()> {
        let key = object.key();
        if key.trim().is_empty() {
            return Err(ContextError::InvalidArgument(
                "cannot insert an object without a key".to_string(),
            ));
        }
        let type_name = object.type_name();
        if self.inner.registry.schema(&type_name).is_none() {
            return Err(ContextError::UnknownModelType(type_name));
        }

        let mut state = self.lock_state();
        if let Some(existing) = state.live.get(&key) {
            if DomainObject::same_instance(existing, object) {
                return Ok(());
            }
            return Err(ContextError::DuplicateKey {
                key,
                existing: existing.clone(),
            });
        }
        if let Some(owner) = object.bound_context() {
            if !Arc::ptr_eq(&owner, &self.inner) {
                return Err(ContextError::AlreadyRegistered(key));
            }
        }

        object.bind(&self.inner);
        object.mark_changed();
        state.live.insert(key.clone(), object.clone());
        debug!(
            "event=context_insert module=context status=ok context={} type={type_name} key={key}",
            self.inner.id
        );
        Ok(())
    }

    /// Unregisters `object`; the store delete happens on the next `save`.
    ///
    /// Objects that are not the live instance of this context are ignored.
    pub fn delete_object(&self, object: &DomainObject) {
        let key = object.key();
        let mut state = self.lock_state();
        let is_live = state
            .live
            .get(&key)
            .is_some_and(|live| DomainObject::same_instance(live, object));
        if !is_live {
            debug!(
                "event=context_delete module=context status=skip context={} key={key} reason=not_registered",
                self.inner.id
            );
            return;
        }

        state.live.remove(&key);
        object.detach();
        state.pending_deletes.insert(key.clone());
        debug!(
            "event=context_delete module=context status=ok context={} key={key}",
            self.inner.id
        );
    }

    /// Writes every changed object and pending delete to the store.
    ///
    /// An empty delta returns an empty summary without touching the store.
    pub fn save(&self) -> ContextResult<SaveSummary> {
        let _cycle = self
            .inner
            .save_cycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let started_at = Instant::now();

        let (changed, deleted) = {
            let state = self.lock_state();
            let mut changed: Vec<DomainObject> = state
                .live
                .values()
                .filter(|object| object.has_changes())
                .cloned()
                .collect();
            changed.sort_by_key(DomainObject::key);
            (changed, state.pending_deletes.clone())
        };

        if changed.is_empty() && deleted.is_empty() {
            debug!(
                "event=context_save module=context status=skip context={} reason=no_changes",
                self.inner.id
            );
            return Ok(SaveSummary::default());
        }

        let writes = changed
            .iter()
            .map(DomainObject::snapshot_for_save)
            .collect::<ContextResult<Vec<_>>>()?;
        let saved_at = now_epoch_ms();

        if let Some(store) = &self.inner.store {
            let touched: BTreeSet<String> = deleted
                .iter()
                .cloned()
                .chain(writes.iter().map(|write| write.key.clone()))
                .collect();
            if let Err(err) = self.push_changes(store.as_ref(), &writes, &deleted, saved_at) {
                let dropped = store.discard_staged(&touched);
                error!(
                    "event=context_save module=context status=error context={} stage=stage_records discarded={dropped} error={err}",
                    self.inner.id
                );
                return Err(err);
            }
            if !store.save() {
                let dropped = store.discard_staged(&touched);
                error!(
                    "event=context_save module=context status=error context={} stage=store_save saved={} deleted={} discarded={dropped} duration_ms={}",
                    self.inner.id,
                    writes.len(),
                    deleted.len(),
                    started_at.elapsed().as_millis()
                );
                return Err(ContextError::SaveFailed {
                    saved_keys: writes.len(),
                    deleted_keys: deleted.len(),
                });
            }
        }

        {
            let mut state = self.lock_state();
            for key in &deleted {
                state.pending_deletes.remove(key);
            }
        }
        for (object, write) in changed.iter().zip(&writes) {
            object.mark_saved(write.revision, saved_at);
        }

        let summary = SaveSummary {
            saved_keys: writes.iter().map(|write| write.key.clone()).collect(),
            deleted_keys: deleted,
        };
        info!(
            "event=context_save module=context status=ok context={} saved={} deleted={} duration_ms={}",
            self.inner.id,
            summary.saved_keys.len(),
            summary.deleted_keys.len(),
            started_at.elapsed().as_millis()
        );

        if let Some(notifier) = &self.inner.notifier {
            let delivered = notifier.post(&ContextDidSave {
                source: self.inner.id,
                saved_keys: summary.saved_keys.clone(),
                deleted_keys: summary.deleted_keys.clone(),
            });
            debug!(
                "event=context_notify module=context status=ok context={} subscribers={delivered}",
                self.inner.id
            );
        }

        Ok(summary)
    }

    /// Runs [`ObjectContext::save`] on a background thread.
    ///
    /// `completion` runs exactly once on that thread with the save outcome.
    pub fn save_with_completion<F>(&self, completion: F) -> JoinHandle<()>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let context = self.clone();
        thread::spawn(move || {
            let succeeded = match context.save() {
                Ok(_) => true,
                Err(err) => {
                    warn!(
                        "event=context_save_async module=context status=error context={} error={err}",
                        context.inner.id
                    );
                    false
                }
            };
            completion(succeeded);
        })
    }

    /// Applies another context's save to the live objects of this one.
    ///
    /// Deleted keys are dropped from the identity map without touching the
    /// store. Saved keys are reloaded from the store, discarding local
    /// unsaved changes. Notifications from this context are ignored.
    pub fn merge_changes_from_context_did_save(
        &self,
        notification: &ContextDidSave,
    ) -> ContextResult<MergeSummary> {
        let mut summary = MergeSummary::default();
        if notification.source == self.inner.id {
            return Ok(summary);
        }

        let mut state = self.lock_state();
        for key in &notification.deleted_keys {
            if let Some(object) = state.live.remove(key) {
                object.detach();
                summary.removed.push(key.clone());
            }
        }

        if let Some(store) = &self.inner.store {
            for key in &notification.saved_keys {
                let Some(object) = state.live.get(key).cloned() else {
                    continue;
                };
                match store.persistent_object_with_key(key)? {
                    Some(record) if record.type_name() == object.type_name() => {
                        object.refresh_from_record(&record)?;
                        summary.refreshed.push(key.clone());
                    }
                    Some(record) => {
                        warn!(
                            "event=context_merge module=context status=skip context={} key={key} reason=type_changed type={}",
                            self.inner.id,
                            record.type_name()
                        );
                        state.live.remove(key);
                        object.detach();
                        summary.removed.push(key.clone());
                    }
                    None => warn!(
                        "event=context_merge module=context status=skip context={} key={key} reason=record_missing",
                        self.inner.id
                    ),
                }
            }
        }

        debug!(
            "event=context_merge module=context status=ok context={} source={} refreshed={} removed={}",
            self.inner.id,
            notification.source,
            summary.refreshed.len(),
            summary.removed.len()
        );
        Ok(summary)
    }

    /// Merges every notification currently queued on `receiver`.
    pub fn merge_pending_notifications(
        &self,
        receiver: &Receiver<ContextDidSave>,
    ) -> ContextResult<MergeSummary> {
        let mut summary = MergeSummary::default();
        for notification in receiver.try_iter() {
            summary.absorb(self.merge_changes_from_context_did_save(&notification)?);
        }
        Ok(summary)
    }

    /// Returns every live instance of `type_name`, hydrating stored ones.
    ///
    /// Objects already live are reused, so each key appears once.
    pub fn objects_of_type(&self, type_name: &str) -> ContextResult<Vec<DomainObject>> {
        let schema = self
            .inner
            .registry
            .schema(type_name)
            .ok_or_else(|| ContextError::UnknownModelType(type_name.to_string()))?;

        let mut state = self.lock_state();
        if let Some(store) = &self.inner.store {
            let mut hydrated = 0usize;
            for record in store.persistent_objects_of_type(type_name)? {
                if state.live.contains_key(record.key())
                    || state.pending_deletes.contains(record.key())
                {
                    continue;
                }
                let object = DomainObject::from_record(&schema, &record)?;
                self.register_hydrated(&mut state, &object);
                hydrated += 1;
            }
            debug!(
                "event=context_fetch_type module=context status=ok context={} type={type_name} hydrated={hydrated}",
                self.inner.id
            );
        }

        let mut objects: Vec<(String, DomainObject)> = state
            .live
            .iter()
            .filter(|(_, object)| object.type_name() == type_name)
            .map(|(key, object)| (key.clone(), object.clone()))
            .collect();
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(objects.into_iter().map(|(_, object)| object).collect())
    }

    /// Purges old records straight from the store.
    ///
    /// Live objects are left untouched. Returns `false` when there is no
    /// store or the store failed.
    pub fn delete_entries_of_type(
        &self,
        type_name: Option<&str>,
        older_than: Timestamp,
        policy: DeletePolicy,
    ) -> bool {
        match &self.inner.store {
            Some(store) => store.delete_entries_of_type(type_name, older_than, policy),
            None => false,
        }
    }

    /// Stages the delta in `store`.
    ///
    /// Every write is checked against the stored record before anything is
    /// staged, so a type conflict leaves the store untouched.
    fn push_changes(
        &self,
        store: &dyn PersistentStore,
        writes: &[PendingWrite],
        deleted: &BTreeSet<String>,
        saved_at: Timestamp,
    ) -> ContextResult<()> {
        for write in writes.iter().filter(|write| !deleted.contains(&write.key)) {
            if let Some(existing) = store.persistent_object_with_key(&write.key)? {
                ensure_write_type(write, existing.type_name())?;
            }
        }

        for key in deleted {
            store.delete_persistent_object(key)?;
        }

        for write in writes {
            let mut record = match store.persistent_object_with_key(&write.key)? {
                Some(record) => record,
                None => match store.create_persistent_object(&write.key, &write.type_name) {
                    Ok(record) => record,
                    Err(StoreError::DuplicateKey(record)) => *record,
                    Err(err) => return Err(err.into()),
                },
            };
            ensure_write_type(write, record.type_name())?;

            record.set_data(write.payload.clone());
            record.set_last_update(Some(saved_at));
            store.update_persistent_object(&record)?;
        }
        Ok(())
    }

    fn register_hydrated(&self, state: &mut ContextState, object: &DomainObject) {
        object.bind(&self.inner);
        let key = object.key();
        debug!(
            "event=context_hydrate module=context status=ok context={} type={} key={key}",
            self.inner.id,
            object.type_name()
        );
        state.live.insert(key, object.clone());
    }

    fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn ensure_write_type(write: &PendingWrite, stored_type: &str) -> ContextResult<()> {
    if stored_type == write.type_name {
        return Ok(());
    }
    Err(ContextError::TypeMismatch {
        key: write.key.clone(),
        expected: write.type_name.clone(),
        found: stored_type.to_string(),
    })
}
