//! Per-type model configuration and the type registry used for hydration.
//!
//! # Responsibility
//! - Declare which properties a model type has and which of them persist.
//! - Carry per-type alias tables and trust windows.
//! - Resolve a stored record's `type` string back to its schema.
//!
//! # Invariants
//! - `key` and `last_update` are reserved and never declared as properties.
//! - Every alias targets a declared property or a reserved name.
//! - Type names are unique within one registry.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

/// Reserved property name carrying the object key.
pub const KEY_PROPERTY: &str = "key";
/// Reserved property name carrying the last update timestamp.
pub const LAST_UPDATE_PROPERTY: &str = "last_update";
/// Default trust window applied when a schema does not override it.
pub const DEFAULT_TRUSTED_INTERVAL: Duration = Duration::from_secs(60 * 60);

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://\S+$").expect("valid url regex"));

/// Value shape accepted by a declared property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    Text,
    Integer,
    Float,
    Bool,
    Url,
    TextList,
    Any,
}

impl PropertyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Url => "url",
            Self::TextList => "text_list",
            Self::Any => "any",
        }
    }

    /// Validates and normalizes `value` for a property of this kind.
    ///
    /// `null` is accepted by every kind and clears the property.
    pub fn validate(self, name: &str, value: Value) -> Result<Value, PropertyError> {
        if value.is_null() {
            return Ok(value);
        }

        let normalized = match (self, &value) {
            (Self::Any, _) => Some(value.clone()),
            (Self::Text, Value::String(_)) => Some(value.clone()),
            (Self::Bool, Value::Bool(_)) => Some(value.clone()),
            (Self::Integer, Value::Number(number)) => number
                .as_i64()
                .or_else(|| number.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Value::from),
            (Self::Integer, Value::String(text)) => {
                text.trim().parse::<i64>().ok().map(Value::from)
            }
            (Self::Float, Value::Number(_)) => Some(value.clone()),
            (Self::Float, Value::String(text)) => text
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Value::from),
            (Self::Url, Value::String(text)) if URL_RE.is_match(text) => Some(value.clone()),
            (Self::TextList, Value::Array(items)) if items.iter().all(Value::is_string) => {
                Some(value.clone())
            }
            _ => None,
        };

        normalized.ok_or_else(|| PropertyError::InvalidValue {
            name: name.to_string(),
            expected: self,
            found: value_kind_name(&value),
        })
    }
}

fn value_kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One declared property of a model type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub kind: PropertyKind,
    /// Whether the value round-trips through the record payload.
    pub persistent: bool,
}

/// Schema declaration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    EmptyTypeName,
    EmptyPropertyName,
    ReservedProperty(String),
    DuplicateProperty { type_name: String, name: String },
    UnknownMappingTarget { alias: String, target: String },
    DuplicateType(String),
}

impl Display for SchemaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyTypeName => write!(f, "model type name must not be empty"),
            Self::EmptyPropertyName => write!(f, "property name must not be empty"),
            Self::ReservedProperty(name) => {
                write!(f, "property name `{name}` is reserved")
            }
            Self::DuplicateProperty { type_name, name } => {
                write!(f, "property `{name}` declared twice on `{type_name}`")
            }
            Self::UnknownMappingTarget { alias, target } => {
                write!(f, "alias `{alias}` targets undeclared property `{target}`")
            }
            Self::DuplicateType(type_name) => {
                write!(f, "model type already registered: {type_name}")
            }
        }
    }
}

impl Error for SchemaError {}

/// Property access errors raised by domain objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyError {
    UndefinedProperty { type_name: String, name: String },
    ReadOnlyProperty(String),
    InvalidValue {
        name: String,
        expected: PropertyKind,
        found: &'static str,
    },
}

impl Display for PropertyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UndefinedProperty { type_name, name } => {
                write!(f, "`{type_name}` has no property `{name}`")
            }
            Self::ReadOnlyProperty(name) => write!(f, "property `{name}` is read-only"),
            Self::InvalidValue {
                name,
                expected,
                found,
            } => write!(
                f,
                "property `{name}` expects {} but got {found}",
                expected.as_str()
            ),
        }
    }
}

impl Error for PropertyError {}

/// Static configuration for one model type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSchema {
    type_name: String,
    properties: BTreeMap<String, PropertyDescriptor>,
    key_mappings: Vec<(String, String)>,
    trusted_interval: Duration,
}

impl ModelSchema {
    pub fn builder(type_name: impl Into<String>) -> ModelSchemaBuilder {
        ModelSchemaBuilder {
            type_name: type_name.into(),
            properties: Vec::new(),
            key_mappings: Vec::new(),
            trusted_interval: DEFAULT_TRUSTED_INTERVAL,
        }
    }

    /// Type tag written to `PersistentRecord::type_name`.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties.values()
    }

    /// Names whose values are written to and read from the record payload.
    pub fn keys_for_persistent_values(&self) -> BTreeSet<&str> {
        self.properties
            .values()
            .filter(|property| property.persistent)
            .map(|property| property.name.as_str())
            .collect()
    }

    pub fn is_persistent(&self, name: &str) -> bool {
        self.properties
            .get(name)
            .is_some_and(|property| property.persistent)
    }

    /// External alias -> property name table seeded into every instance.
    pub fn dictionary_with_keys_for_mapping_keys(&self) -> BTreeMap<&str, &str> {
        self.key_mappings
            .iter()
            .map(|(alias, target)| (alias.as_str(), target.as_str()))
            .collect()
    }

    pub(crate) fn key_mappings(&self) -> &[(String, String)] {
        &self.key_mappings
    }

    /// How long after `last_update` cached data is still considered fresh.
    pub fn trusted_time_interval_from_last_update(&self) -> Duration {
        self.trusted_interval
    }
}

/// Builder for [`ModelSchema`]; validation happens in [`ModelSchemaBuilder::build`].
#[derive(Debug, Clone)]
pub struct ModelSchemaBuilder {
    type_name: String,
    properties: Vec<PropertyDescriptor>,
    key_mappings: Vec<(String, String)>,
    trusted_interval: Duration,
}

impl ModelSchemaBuilder {
    /// Declares a property persisted in the record payload.
    pub fn property(mut self, name: impl Into<String>, kind: PropertyKind) -> Self {
        self.properties.push(PropertyDescriptor {
            name: name.into(),
            kind,
            persistent: true,
        });
        self
    }

    /// Declares an in-memory only property.
    pub fn transient_property(mut self, name: impl Into<String>, kind: PropertyKind) -> Self {
        self.properties.push(PropertyDescriptor {
            name: name.into(),
            kind,
            persistent: false,
        });
        self
    }

    pub fn key_mapping(mut self, alias: impl Into<String>, target: impl Into<String>) -> Self {
        self.key_mappings.push((alias.into(), target.into()));
        self
    }

    pub fn trusted_interval(mut self, interval: Duration) -> Self {
        self.trusted_interval = interval;
        self
    }

    pub fn build(self) -> Result<ModelSchema, SchemaError> {
        let type_name = self.type_name.trim().to_string();
        if type_name.is_empty() {
            return Err(SchemaError::EmptyTypeName);
        }

        let mut properties = BTreeMap::new();
        for property in self.properties {
            if property.name.trim().is_empty() {
                return Err(SchemaError::EmptyPropertyName);
            }
            if is_reserved(&property.name) {
                return Err(SchemaError::ReservedProperty(property.name));
            }
            if properties.contains_key(&property.name) {
                return Err(SchemaError::DuplicateProperty {
                    type_name,
                    name: property.name,
                });
            }
            properties.insert(property.name.clone(), property);
        }

        for (alias, target) in &self.key_mappings {
            if !is_reserved(target) && !properties.contains_key(target) {
                return Err(SchemaError::UnknownMappingTarget {
                    alias: alias.clone(),
                    target: target.clone(),
                });
            }
        }

        Ok(ModelSchema {
            type_name,
            properties,
            key_mappings: self.key_mappings,
            trusted_interval: self.trusted_interval,
        })
    }
}

fn is_reserved(name: &str) -> bool {
    name == KEY_PROPERTY || name == LAST_UPDATE_PROPERTY
}

/// Registry resolving record type tags to schemas.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    schemas: BTreeMap<String, Arc<ModelSchema>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one schema and returns the shared handle used by objects.
    pub fn register(&mut self, schema: ModelSchema) -> Result<Arc<ModelSchema>, SchemaError> {
        if self.schemas.contains_key(schema.type_name()) {
            return Err(SchemaError::DuplicateType(schema.type_name().to_string()));
        }
        let schema = Arc::new(schema);
        self.schemas
            .insert(schema.type_name().to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    pub fn schema(&self, type_name: &str) -> Option<Arc<ModelSchema>> {
        self.schemas.get(type_name).cloned()
    }

    /// Returns sorted type names.
    pub fn type_names(&self) -> Vec<String> {
        self.schemas.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
