//! Backend-neutral record shape shared by every persistent store.
//!
//! # Invariants
//! - `key` and `type_name` are fixed at creation; only `last_update` and
//!   `data` change afterwards.
//! - `data` is an opaque byte payload; stores never inspect it.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Unix epoch milliseconds.
pub type Timestamp = i64;

/// Returns the current wall-clock time in epoch milliseconds.
///
/// Clocks set before the epoch report `0`.
pub fn now_epoch_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            Timestamp::try_from(elapsed.as_millis()).unwrap_or(Timestamp::MAX)
        })
}

/// The `key/type/last_update/data` tuple persisted by a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentRecord {
    key: String,
    #[serde(rename = "type")]
    type_name: String,
    last_update: Option<Timestamp>,
    data: Vec<u8>,
}

impl PersistentRecord {
    /// Creates an empty record for `key` of `type_name`.
    pub fn new(key: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            type_name: type_name.into(),
            last_update: None,
            data: Vec::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn last_update(&self) -> Option<Timestamp> {
        self.last_update
    }

    pub fn set_last_update(&mut self, last_update: Option<Timestamp>) {
        self.last_update = last_update;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }
}

/// Which record timestamp `delete_entries_of_type` compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeletePolicy {
    /// Time the record was first written to the store.
    ByCreationDate,
    /// Time the record was last read from durable storage.
    ByAccessDate,
    /// The record's `last_update`; records never updated fall back to creation time.
    ByUpdateDate,
}

impl DeletePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ByCreationDate => "by_creation",
            Self::ByAccessDate => "by_access",
            Self::ByUpdateDate => "by_update",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{now_epoch_ms, PersistentRecord};

    #[test]
    fn new_record_is_empty_and_untimestamped() {
        let record = PersistentRecord::new("u1", "User");

        assert_eq!(record.key(), "u1");
        assert_eq!(record.type_name(), "User");
        assert_eq!(record.last_update(), None);
        assert!(record.data().is_empty());
    }

    #[test]
    fn serialized_record_uses_type_field_name() {
        let mut record = PersistentRecord::new("v1", "Video");
        record.set_last_update(Some(1_700_000_000_000));
        record.set_data(b"{}".to_vec());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "Video");
        assert_eq!(json["last_update"], 1_700_000_000_000_i64);

        let decoded: PersistentRecord = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn clock_is_after_2020() {
        assert!(now_epoch_ms() > 1_577_836_800_000);
    }
}
