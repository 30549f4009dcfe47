//! Domain model layer.
//!
//! # Responsibility
//! - Describe model types (`ModelSchema`) and their properties.
//! - Hold live model instances (`DomainObject`) and their key mappings.
//! - Translate instance values to and from opaque record payloads.
//!
//! # Invariants
//! - Every `DomainObject` is identified by a non-empty key.
//! - Only persistent properties reach a `PersistentRecord` payload.

pub mod mapping;
pub mod object;
pub mod payload;
pub mod record;
pub mod schema;
