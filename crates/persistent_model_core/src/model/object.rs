//! Context-bound domain object.
//!
//! # Responsibility
//! - Hold the property values of one keyed model instance.
//! - Resolve external names through the instance key mapping.
//! - Track unsaved changes and encode/decode the record payload.
//!
//! # Invariants
//! - `key` never changes after construction.
//! - The context back-reference is weak; the context owns the forward map.
//! - Any successful write through `set_value`/`set_values` leaves
//!   `has_changes() == true`.
//! - `set_primitive_value` bypasses change tracking; callers that use it must
//!   call `set_has_changes(true)` themselves.

use crate::context::object_context::{ContextError, ContextInner, ContextResult, ObjectContext};
use crate::model::mapping::KeyMapping;
use crate::model::payload::{decode_persistent_values, encode_persistent_values};
use crate::model::record::{now_epoch_ms, PersistentRecord, Timestamp};
use crate::model::schema::{
    ModelSchema, PropertyError, PropertyKind, KEY_PROPERTY, LAST_UPDATE_PROPERTY,
};
use log::warn;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

pub(crate) struct ObjectState {
    schema: Arc<ModelSchema>,
    key: String,
    last_update: Option<Timestamp>,
    has_changes: bool,
    revision: u64,
    context: Weak<ContextInner>,
    mapping: KeyMapping,
    values: BTreeMap<String, Value>,
}

/// Encoded state captured at the start of a save cycle.
pub(crate) struct PendingWrite {
    pub(crate) key: String,
    pub(crate) type_name: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) revision: u64,
}

/// Shared handle to one live model instance.
///
/// Clones refer to the same instance; use [`DomainObject::same_instance`]
/// for identity checks.
#[derive(Clone)]
pub struct DomainObject {
    inner: Arc<Mutex<ObjectState>>,
}

impl DomainObject {
    /// Creates a detached instance to be inserted with `ObjectContext::insert_object`.
    ///
    /// New instances start with `has_changes() == true` so the next save
    /// creates their record.
    pub fn unregistered(schema: &Arc<ModelSchema>, key: impl Into<String>) -> ContextResult<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(ContextError::InvalidArgument(
                "object key must not be empty".to_string(),
            ));
        }

        Ok(Self::from_state(ObjectState {
            mapping: KeyMapping::with_mapping(schema.key_mappings().iter().cloned()),
            schema: Arc::clone(schema),
            key,
            last_update: None,
            has_changes: true,
            revision: 0,
            context: Weak::new(),
            values: BTreeMap::new(),
        }))
    }

    /// Creates an instance for `key` and registers it in `context`.
    ///
    /// Fails with `ContextError::DuplicateKey` when `context` already holds a
    /// live object for `key`.
    pub fn new(
        context: &ObjectContext,
        schema: &Arc<ModelSchema>,
        key: impl Into<String>,
    ) -> ContextResult<Self> {
        let object = Self::unregistered(schema, key)?;
        context.insert_object(&object)?;
        Ok(object)
    }

    /// Creates and registers an instance from an external dictionary.
    ///
    /// The dictionary must carry the object key under `key` or an alias of it.
    /// Entries that resolve to no declared property are skipped and, when
    /// `log_undefined_mappings` is set, reported in the log.
    pub fn with_values(
        context: &ObjectContext,
        schema: &Arc<ModelSchema>,
        values: &Map<String, Value>,
        log_undefined_mappings: bool,
    ) -> ContextResult<Self> {
        let key = key_from_values(schema, values)?;
        let object = Self::unregistered(schema, key)?;
        {
            let mut state = object.lock_state();
            state.mapping.set_log_undefined_mappings(log_undefined_mappings);
            state.apply_values(values)?;
        }
        context.insert_object(&object)?;
        Ok(object)
    }

    /// Returns the context's object for the dictionary key updated with
    /// `values`, creating and registering a new one when none exists.
    pub fn with_dictionary(
        context: &ObjectContext,
        schema: &Arc<ModelSchema>,
        values: &Map<String, Value>,
    ) -> ContextResult<Self> {
        let key = key_from_values(schema, values)?;
        match context.object_for_key(&key)? {
            Some(existing) => {
                existing.ensure_type(schema)?;
                existing.set_values(values)?;
                Ok(existing)
            }
            None => Self::with_values(context, schema, values, false),
        }
    }

    /// Looks up `key` in `context` (live instances first, then the store).
    ///
    /// When nothing is found and `allows_creation` is set, a new empty
    /// instance is created and registered.
    pub fn object_with_key(
        key: &str,
        context: &ObjectContext,
        schema: &Arc<ModelSchema>,
        allows_creation: bool,
    ) -> ContextResult<Option<Self>> {
        if let Some(existing) = context.object_for_key(key)? {
            existing.ensure_type(schema)?;
            return Ok(Some(existing));
        }
        if !allows_creation {
            return Ok(None);
        }
        Self::new(context, schema, key).map(Some)
    }

    /// Returns `true` when both handles point at the same instance.
    pub fn same_instance(a: &DomainObject, b: &DomainObject) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn key(&self) -> String {
        self.lock_state().key.clone()
    }

    pub fn type_name(&self) -> String {
        self.lock_state().schema.type_name().to_string()
    }

    pub fn schema(&self) -> Arc<ModelSchema> {
        Arc::clone(&self.lock_state().schema)
    }

    pub fn last_update(&self) -> Option<Timestamp> {
        self.lock_state().last_update
    }

    /// Overrides the last update time without touching change tracking.
    pub fn set_last_update(&self, last_update: Option<Timestamp>) {
        self.lock_state().last_update = last_update;
    }

    /// `true` while the data is younger than the schema's trust window.
    pub fn has_trusted_data(&self) -> bool {
        let state = self.lock_state();
        let Some(last_update) = state.last_update else {
            return false;
        };
        let window_ms = Timestamp::try_from(
            state
                .schema
                .trusted_time_interval_from_last_update()
                .as_millis(),
        )
        .unwrap_or(Timestamp::MAX);
        now_epoch_ms().saturating_sub(last_update) < window_ms
    }

    /// `true` when the object has changes not yet saved.
    pub fn has_changes(&self) -> bool {
        self.lock_state().has_changes
    }

    /// Sets the change flag directly, for writes that bypassed `set_value`.
    pub fn set_has_changes(&self, has_changes: bool) {
        let mut state = self.lock_state();
        if has_changes {
            state.touch();
        } else {
            state.has_changes = false;
        }
    }

    /// Reads a property by canonical name or alias.
    ///
    /// `key` and `last_update` are always readable.
    pub fn value(&self, name: &str) -> Option<Value> {
        self.lock_state().value(name)
    }

    /// Writes a property by canonical name or alias and marks the object changed.
    ///
    /// The change flag is raised before validation runs.
    pub fn set_value(&self, name: &str, value: Value) -> Result<(), PropertyError> {
        self.lock_state().set_value(name, value)
    }

    /// Applies every entry of `values`, skipping the key and undeclared names.
    pub fn set_values(&self, values: &Map<String, Value>) -> Result<(), PropertyError> {
        self.lock_state().apply_values(values)
    }

    /// Writes a declared property without raising the change flag.
    pub fn set_primitive_value(&self, name: &str, value: Value) -> Result<(), PropertyError> {
        let mut state = self.lock_state();
        let canonical = state.mapping.map_key(name).to_string();
        let kind = state.declared_kind(&canonical)?;
        let value = kind.validate(&canonical, value)?;
        state.store_value(canonical, value);
        Ok(())
    }

    /// Validation hook applied to every write of `name`.
    pub fn validate_value(&self, name: &str, value: Value) -> Result<Value, PropertyError> {
        let state = self.lock_state();
        let canonical = state.mapping.map_key(name);
        let kind = state.declared_kind(canonical)?;
        kind.validate(canonical, value)
    }

    /// Returns `{name: value}` for each requested name; missing values are `null`.
    pub fn dictionary_with_values_for_keys(&self, names: &[&str]) -> Map<String, Value> {
        let state = self.lock_state();
        names
            .iter()
            .map(|name| (name.to_string(), state.value(name).unwrap_or(Value::Null)))
            .collect()
    }

    pub fn map_key(&self, name: &str) -> String {
        self.lock_state().mapping.map_key(name).to_string()
    }

    pub fn key_mappings(&self) -> Vec<(String, String)> {
        self.lock_state().mapping.mappings().to_vec()
    }

    pub fn add_key_mapping<I, A, C>(&self, mapping: I)
    where
        I: IntoIterator<Item = (A, C)>,
        A: Into<String>,
        C: Into<String>,
    {
        self.lock_state().mapping.add_key_mapping(mapping);
    }

    pub fn remove_key_mapping<I, A, C>(&self, mapping: I)
    where
        I: IntoIterator<Item = (A, C)>,
        A: AsRef<str>,
        C: AsRef<str>,
    {
        self.lock_state().mapping.remove_key_mapping(mapping);
    }

    pub fn log_undefined_mappings(&self) -> bool {
        self.lock_state().mapping.log_undefined_mappings()
    }

    pub fn set_log_undefined_mappings(&self, flag: bool) {
        self.lock_state().mapping.set_log_undefined_mappings(flag);
    }

    /// Owning context, if the object is registered and the context is alive.
    pub fn context(&self) -> Option<ObjectContext> {
        self.lock_state()
            .context
            .upgrade()
            .map(ObjectContext::from_inner)
    }

    pub fn is_registered(&self) -> bool {
        self.lock_state().context.strong_count() > 0
    }

    /// Registers this object in `context`; see `ObjectContext::insert_object`.
    pub fn register_to_context(&self, context: &ObjectContext) -> ContextResult<()> {
        context.insert_object(self)
    }

    /// Deletes this object through its owning context; no-op when unregistered.
    pub fn delete_object_from_context(&self) {
        let context = self.context();
        if let Some(context) = context {
            context.delete_object(self);
        }
    }

    pub(crate) fn from_record(
        schema: &Arc<ModelSchema>,
        record: &PersistentRecord,
    ) -> ContextResult<Self> {
        let values = decode_persistent_values(schema, record.data()).map_err(|err| {
            ContextError::InvalidPayload {
                key: record.key().to_string(),
                message: err.to_string(),
            }
        })?;

        Ok(Self::from_state(ObjectState {
            mapping: KeyMapping::with_mapping(schema.key_mappings().iter().cloned()),
            schema: Arc::clone(schema),
            key: record.key().to_string(),
            last_update: record.last_update(),
            has_changes: false,
            revision: 0,
            context: Weak::new(),
            values,
        }))
    }

    pub(crate) fn bind(&self, context: &Arc<ContextInner>) {
        self.lock_state().context = Arc::downgrade(context);
    }

    pub(crate) fn detach(&self) {
        self.lock_state().context = Weak::new();
    }

    /// Context currently holding this object, if it is still alive.
    pub(crate) fn bound_context(&self) -> Option<Arc<ContextInner>> {
        self.lock_state().context.upgrade()
    }

    pub(crate) fn mark_changed(&self) {
        self.lock_state().touch();
    }

    pub(crate) fn snapshot_for_save(&self) -> ContextResult<PendingWrite> {
        let state = self.lock_state();
        let payload = encode_persistent_values(&state.schema, &state.values).map_err(|err| {
            ContextError::InvalidPayload {
                key: state.key.clone(),
                message: err.to_string(),
            }
        })?;

        Ok(PendingWrite {
            key: state.key.clone(),
            type_name: state.schema.type_name().to_string(),
            payload,
            revision: state.revision,
        })
    }

    /// Clears the change flag unless the object was written after `revision`.
    pub(crate) fn mark_saved(&self, revision: u64, saved_at: Timestamp) {
        let mut state = self.lock_state();
        state.last_update = Some(saved_at);
        if state.revision == revision {
            state.has_changes = false;
        }
    }

    /// Replaces persistent values with the record contents and clears changes.
    pub(crate) fn refresh_from_record(&self, record: &PersistentRecord) -> ContextResult<()> {
        let mut state = self.lock_state();
        let decoded = decode_persistent_values(&state.schema, record.data()).map_err(|err| {
            ContextError::InvalidPayload {
                key: record.key().to_string(),
                message: err.to_string(),
            }
        })?;

        let schema = Arc::clone(&state.schema);
        state.values.retain(|name, _| !schema.is_persistent(name));
        state.values.extend(decoded);
        state.last_update = record.last_update();
        state.has_changes = false;
        state.revision += 1;
        Ok(())
    }

    fn ensure_type(&self, schema: &ModelSchema) -> ContextResult<()> {
        let state = self.lock_state();
        if state.schema.type_name() == schema.type_name() {
            return Ok(());
        }
        Err(ContextError::TypeMismatch {
            key: state.key.clone(),
            expected: schema.type_name().to_string(),
            found: state.schema.type_name().to_string(),
        })
    }

    fn from_state(state: ObjectState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ObjectState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Debug for DomainObject {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_lock() {
            Ok(state) => f
                .debug_struct("DomainObject")
                .field("type", &state.schema.type_name())
                .field("key", &state.key)
                .field("has_changes", &state.has_changes)
                .field("values", &state.values)
                .finish(),
            Err(_) => f.write_str("DomainObject { <locked> }"),
        }
    }
}

impl ObjectState {
    fn touch(&mut self) {
        self.has_changes = true;
        self.revision += 1;
    }

    fn value(&self, name: &str) -> Option<Value> {
        let canonical = self.mapping.map_key(name);
        match canonical {
            KEY_PROPERTY => Some(Value::String(self.key.clone())),
            LAST_UPDATE_PROPERTY => self.last_update.map(Value::from),
            _ if self.schema.property(canonical).is_some() => {
                self.values.get(canonical).cloned()
            }
            _ => {
                self.report_undefined(name, canonical);
                None
            }
        }
    }

    fn set_value(&mut self, name: &str, value: Value) -> Result<(), PropertyError> {
        let canonical = self.mapping.map_key(name).to_string();
        match canonical.as_str() {
            KEY_PROPERTY => Err(PropertyError::ReadOnlyProperty(canonical)),
            LAST_UPDATE_PROPERTY => {
                self.touch();
                let value = PropertyKind::Integer.validate(&canonical, value)?;
                self.last_update = value.as_i64();
                Ok(())
            }
            _ => {
                let kind = match self.declared_kind(&canonical) {
                    Ok(kind) => kind,
                    Err(err) => {
                        self.report_undefined(name, &canonical);
                        return Err(err);
                    }
                };
                self.touch();
                let value = kind.validate(&canonical, value)?;
                self.store_value(canonical, value);
                Ok(())
            }
        }
    }

    fn apply_values(&mut self, values: &Map<String, Value>) -> Result<(), PropertyError> {
        for (name, value) in values {
            let canonical = self.mapping.map_key(name);
            if canonical == KEY_PROPERTY {
                continue;
            }
            if canonical != LAST_UPDATE_PROPERTY && self.schema.property(canonical).is_none() {
                let canonical = canonical.to_string();
                self.report_undefined(name, &canonical);
                continue;
            }
            self.set_value(name, value.clone())?;
        }
        Ok(())
    }

    fn declared_kind(&self, canonical: &str) -> Result<PropertyKind, PropertyError> {
        self.schema
            .property(canonical)
            .map(|property| property.kind)
            .ok_or_else(|| PropertyError::UndefinedProperty {
                type_name: self.schema.type_name().to_string(),
                name: canonical.to_string(),
            })
    }

    fn store_value(&mut self, canonical: String, value: Value) {
        if value.is_null() {
            self.values.remove(&canonical);
        } else {
            self.values.insert(canonical, value);
        }
    }

    fn report_undefined(&self, name: &str, canonical: &str) {
        if self.mapping.log_undefined_mappings() {
            warn!(
                "event=undefined_mapping module=model status=skip type={} key={} name={name} resolved={canonical}",
                self.schema.type_name(),
                self.key
            );
        }
    }
}

fn key_from_values(schema: &ModelSchema, values: &Map<String, Value>) -> ContextResult<String> {
    let mapping = KeyMapping::with_mapping(schema.key_mappings().iter().cloned());
    let raw = values
        .iter()
        .find(|(name, _)| mapping.map_key(name) == KEY_PROPERTY)
        .map(|(_, value)| value);

    let key = match raw {
        Some(Value::String(text)) => text.trim().to_string(),
        Some(Value::Number(number)) => number.to_string(),
        _ => String::new(),
    };

    if key.is_empty() {
        return Err(ContextError::InvalidArgument(format!(
            "values for `{}` carry no usable `{KEY_PROPERTY}`",
            schema.type_name()
        )));
    }
    Ok(key)
}
