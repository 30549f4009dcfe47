use persistent_model_core::{
    now_epoch_ms, DeletePolicy, PersistentRecord, PersistentStore, SqliteStore, StoreError,
};
use rusqlite::{params, Connection};
use std::collections::BTreeSet;
use std::path::Path;
use std::thread;
use std::time::Duration;

fn saved_record(store: &SqliteStore, key: &str, type_name: &str, data: &[u8]) -> PersistentRecord {
    let mut record = store.create_persistent_object(key, type_name).unwrap();
    record.set_data(data.to_vec());
    record.set_last_update(Some(now_epoch_ms()));
    store.update_persistent_object(&record).unwrap();
    assert!(store.save());
    record
}

fn set_timestamps(path: &Path, key: &str, created_at: i64, accessed_at: i64, last_update: i64) {
    let conn = Connection::open(path).unwrap();
    conn.execute(
        "UPDATE persistent_objects
         SET created_at = ?1, accessed_at = ?2, last_update = ?3
         WHERE object_key = ?4;",
        params![created_at, accessed_at, last_update, key],
    )
    .unwrap();
}

fn stored_keys(path: &Path) -> Vec<String> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare("SELECT object_key FROM persistent_objects ORDER BY object_key;")
        .unwrap();
    let keys = stmt
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<String>, _>>()
        .unwrap();
    keys
}

#[test]
fn records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("objects.db");

    let store = SqliteStore::open(&path).unwrap();
    let written = saved_record(&store, "u1", "User", br#"{"username":"joe"}"#);
    store.close_store();
    assert!(store.is_closed());

    let reopened = SqliteStore::open(&path).unwrap();
    let loaded = reopened.persistent_object_with_key("u1").unwrap().unwrap();
    assert_eq!(loaded, written);
    assert_eq!(reopened.location(), path.display().to_string());
}

#[test]
fn staged_writes_are_invisible_on_disk_until_save() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("objects.db");
    let store = SqliteStore::open(&path).unwrap();

    store.create_persistent_object("u1", "User").unwrap();
    assert!(store.persistent_object_with_key("u1").unwrap().is_some());
    assert_eq!(store.pending_change_count(), 1);
    assert!(stored_keys(&path).is_empty());

    assert!(store.save());
    assert_eq!(store.pending_change_count(), 0);
    assert_eq!(stored_keys(&path), ["u1"]);
}

#[test]
fn create_never_overwrites_existing_records() {
    let store = SqliteStore::open_in_memory().unwrap();
    saved_record(&store, "u1", "User", b"payload");

    match store.create_persistent_object("u1", "Video") {
        Err(StoreError::DuplicateKey(existing)) => {
            assert_eq!(existing.type_name(), "User");
            assert_eq!(existing.data(), b"payload");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(matches!(
        store.create_persistent_object("", "User"),
        Err(StoreError::InvalidArgument(_))
    ));
}

#[test]
fn objects_of_type_combine_disk_and_staged_records() {
    let store = SqliteStore::open_in_memory().unwrap();
    saved_record(&store, "u1", "User", b"");
    saved_record(&store, "u2", "User", b"");
    saved_record(&store, "v1", "Video", b"");

    store.delete_persistent_object("u1").unwrap();
    store.create_persistent_object("u3", "User").unwrap();

    let keys: Vec<String> = store
        .persistent_objects_of_type("User")
        .unwrap()
        .iter()
        .map(|record| record.key().to_string())
        .collect();
    assert_eq!(keys, ["u2", "u3"]);
}

#[test]
fn delete_is_applied_on_save_and_is_idempotent() {
    let store = SqliteStore::open_in_memory().unwrap();
    saved_record(&store, "u1", "User", b"");

    store.delete_persistent_object("u1").unwrap();
    store.delete_persistent_object("u1").unwrap();
    store.delete_persistent_object("never-existed").unwrap();
    assert!(store.persistent_object_with_key("u1").unwrap().is_none());

    assert!(store.save());
    store.clean_cache();
    assert!(store.persistent_object_with_key("u1").unwrap().is_none());
}

#[test]
fn delete_entries_follow_the_policy_column() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("objects.db");
    let store = SqliteStore::open(&path).unwrap();
    saved_record(&store, "old-created", "User", b"");
    saved_record(&store, "old-accessed", "User", b"");
    saved_record(&store, "old-video", "Video", b"");

    set_timestamps(&path, "old-created", 100, 5_000, 5_000);
    set_timestamps(&path, "old-accessed", 5_000, 100, 5_000);
    set_timestamps(&path, "old-video", 100, 100, 100);

    assert!(store.delete_entries_of_type(Some("User"), 1_000, DeletePolicy::ByCreationDate));
    assert_eq!(stored_keys(&path), ["old-accessed", "old-video"]);

    assert!(store.delete_entries_of_type(Some("User"), 1_000, DeletePolicy::ByAccessDate));
    assert_eq!(stored_keys(&path), ["old-video"]);

    assert!(store.delete_entries_of_type(None, 1_000, DeletePolicy::ByUpdateDate));
    assert!(stored_keys(&path).is_empty());
    assert!(store.persistent_object_with_key("old-video").unwrap().is_none());
}

#[test]
fn cached_reads_keep_records_alive_under_access_policy() {
    let store = SqliteStore::open_in_memory().unwrap();
    saved_record(&store, "read", "User", b"");
    saved_record(&store, "idle", "User", b"");

    thread::sleep(Duration::from_millis(5));
    let cutoff = now_epoch_ms();
    thread::sleep(Duration::from_millis(5));
    assert!(store.persistent_object_with_key("read").unwrap().is_some());

    assert!(store.delete_entries_of_type(None, cutoff, DeletePolicy::ByAccessDate));
    assert!(store.persistent_object_with_key("read").unwrap().is_some());
    assert!(store.persistent_object_with_key("idle").unwrap().is_none());
}

#[test]
fn update_requires_an_existing_record() {
    let store = SqliteStore::open_in_memory().unwrap();
    let mut record = PersistentRecord::new("ghost", "User");
    record.set_data(b"payload".to_vec());

    assert!(matches!(
        store.update_persistent_object(&record),
        Err(StoreError::InvalidArgument(_))
    ));
    assert_eq!(store.pending_change_count(), 0);
    assert!(store.persistent_object_with_key("ghost").unwrap().is_none());
}

#[test]
fn discarded_writes_never_reach_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("objects.db");
    let store = SqliteStore::open(&path).unwrap();
    saved_record(&store, "kept", "User", b"");

    store.create_persistent_object("dropped", "User").unwrap();
    store.delete_persistent_object("kept").unwrap();
    let keys = BTreeSet::from(["dropped".to_string(), "kept".to_string()]);
    assert_eq!(store.discard_staged(&keys), 2);

    assert!(store.save());
    assert_eq!(stored_keys(&path), ["kept"]);
}

#[test]
fn closed_store_rejects_operations() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.create_persistent_object("u1", "User").unwrap();
    store.close_store();

    assert_eq!(store.pending_change_count(), 0);
    assert!(matches!(
        store.persistent_object_with_key("u1"),
        Err(StoreError::Closed)
    ));
    assert!(matches!(
        store.delete_persistent_object("u1"),
        Err(StoreError::Closed)
    ));
    assert!(!store.delete_entries_of_type(None, i64::MAX, DeletePolicy::ByCreationDate));

    assert!(matches!(
        store.create_persistent_object("u2", "User"),
        Err(StoreError::Closed)
    ));
}
