mod common;

use common::{registry, USER, VIDEO};
use persistent_model_core::{
    now_epoch_ms, ContextError, DomainObject, MemoryStore, ObjectContext, PersistentStore,
    PropertyError, PropertyKind,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;

fn context() -> ObjectContext {
    let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
    ObjectContext::new(Some(store), registry())
}

fn values(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

#[test]
fn with_values_resolves_aliases_and_skips_unknown_entries() {
    let context = context();
    let users = context.registry().schema(USER).unwrap();

    let user = DomainObject::with_values(
        &context,
        &users,
        &values(json!({"id": 7, "login": "joe", "favorite_color": "red"})),
        true,
    )
    .unwrap();

    assert_eq!(user.key(), "7");
    assert_eq!(user.value("username"), Some(json!("joe")));
    assert_eq!(user.value("favorite_color"), None);
    assert!(user.has_changes());
    assert!(user.log_undefined_mappings());
    assert!(context.contains_object_with_key("7"));
}

#[test]
fn with_values_requires_a_key() {
    let context = context();
    let users = context.registry().schema(USER).unwrap();

    let err = DomainObject::with_values(&context, &users, &values(json!({"login": "joe"})), false)
        .unwrap_err();
    assert!(matches!(err, ContextError::InvalidArgument(_)));
    assert!(context.registered_objects().is_empty());
}

#[test]
fn with_dictionary_updates_the_existing_object() {
    let context = context();
    let users = context.registry().schema(USER).unwrap();
    let existing = DomainObject::new(&context, &users, "u1").unwrap();
    context.save().unwrap();

    let updated = DomainObject::with_dictionary(
        &context,
        &users,
        &values(json!({"key": "u1", "username": "ann"})),
    )
    .unwrap();
    assert!(DomainObject::same_instance(&existing, &updated));
    assert_eq!(existing.value("username"), Some(json!("ann")));
    assert!(existing.has_changes());

    let created = DomainObject::with_dictionary(
        &context,
        &users,
        &values(json!({"key": "u2", "age": 3})),
    )
    .unwrap();
    assert_eq!(created.value("age"), Some(json!(3)));
    assert_eq!(context.registered_objects().len(), 2);
}

#[test]
fn object_with_key_creates_only_when_allowed() {
    let context = context();
    let users = context.registry().schema(USER).unwrap();
    let videos = context.registry().schema(VIDEO).unwrap();

    assert!(DomainObject::object_with_key("u1", &context, &users, false)
        .unwrap()
        .is_none());

    let created = DomainObject::object_with_key("u1", &context, &users, true)
        .unwrap()
        .unwrap();
    let found = DomainObject::object_with_key("u1", &context, &users, false)
        .unwrap()
        .unwrap();
    assert!(DomainObject::same_instance(&created, &found));

    assert!(matches!(
        DomainObject::object_with_key("u1", &context, &videos, true),
        Err(ContextError::TypeMismatch { .. })
    ));
}

#[test]
fn key_property_is_read_only() {
    let context = context();
    let users = context.registry().schema(USER).unwrap();
    let user = DomainObject::new(&context, &users, "u1").unwrap();

    assert_eq!(user.value("key"), Some(json!("u1")));
    assert_eq!(user.value("id"), Some(json!("u1")));
    assert!(matches!(
        user.set_value("id", json!("other")),
        Err(PropertyError::ReadOnlyProperty(_))
    ));
    assert_eq!(user.key(), "u1");
}

#[test]
fn failed_validation_still_marks_the_object_changed() {
    let context = context();
    let users = context.registry().schema(USER).unwrap();
    let user = DomainObject::new(&context, &users, "u1").unwrap();
    context.save().unwrap();
    assert!(!user.has_changes());

    let err = user.set_value("homepage", json!("not a url")).unwrap_err();
    assert!(matches!(
        err,
        PropertyError::InvalidValue {
            expected: PropertyKind::Url,
            ..
        }
    ));
    assert!(user.has_changes());
    assert_eq!(user.value("homepage"), None);

    assert!(matches!(
        user.set_value("nickname", json!("jo")),
        Err(PropertyError::UndefinedProperty { .. })
    ));
}

#[test]
fn primitive_writes_do_not_mark_changes() {
    let context = context();
    let users = context.registry().schema(USER).unwrap();
    let user = DomainObject::new(&context, &users, "u1").unwrap();
    context.save().unwrap();

    user.set_primitive_value("homepage", json!("https://example.com/joe"))
        .unwrap();
    assert!(!user.has_changes());
    assert_eq!(
        user.value("homepage"),
        Some(json!("https://example.com/joe"))
    );

    user.set_has_changes(true);
    assert!(context.has_changes());
    user.set_has_changes(false);
    assert!(!context.has_changes());
}

#[test]
fn validate_value_normalizes_without_writing() {
    let context = context();
    let users = context.registry().schema(USER).unwrap();
    let user = DomainObject::new(&context, &users, "u1").unwrap();

    assert_eq!(user.validate_value("age", json!("12")).unwrap(), json!(12));
    assert_eq!(user.validate_value("age", Value::Null).unwrap(), Value::Null);
    assert!(user.validate_value("age", json!("twelve")).is_err());
    assert_eq!(user.value("age"), None);
}

#[test]
fn dictionary_with_values_for_keys_fills_missing_with_null() {
    let context = context();
    let users = context.registry().schema(USER).unwrap();
    let user = DomainObject::new(&context, &users, "u1").unwrap();
    user.set_value("login", json!("joe")).unwrap();

    let dictionary = user.dictionary_with_values_for_keys(&["key", "username", "age"]);
    assert_eq!(
        Value::Object(dictionary),
        json!({"key": "u1", "username": "joe", "age": null})
    );
}

#[test]
fn instance_key_mappings_can_be_extended_and_pruned() {
    let context = context();
    let users = context.registry().schema(USER).unwrap();
    let user = DomainObject::new(&context, &users, "u1").unwrap();

    user.add_key_mapping([("handle", "username")]);
    user.set_value("handle", json!("joe")).unwrap();
    assert_eq!(user.value("username"), Some(json!("joe")));
    assert_eq!(user.map_key("handle"), "username");

    user.remove_key_mapping([("handle", "age")]);
    assert_eq!(user.map_key("handle"), "username");
    user.remove_key_mapping([("handle", "username")]);
    assert_eq!(user.map_key("handle"), "handle");
    assert!(user
        .key_mappings()
        .iter()
        .all(|(alias, _)| alias != "handle"));
}

#[test]
fn trusted_data_follows_the_schema_interval() {
    let context = context();
    let videos = context.registry().schema(VIDEO).unwrap();
    let video = DomainObject::new(&context, &videos, "v1").unwrap();

    assert!(!video.has_trusted_data());
    video.set_last_update(Some(now_epoch_ms()));
    assert!(video.has_trusted_data());
    video.set_last_update(Some(now_epoch_ms() - 120_000));
    assert!(!video.has_trusted_data());
}

#[test]
fn back_reference_does_not_keep_the_context_alive() {
    let users = registry().schema(USER).unwrap();
    let object = {
        let context = context();
        let object = DomainObject::new(&context, &users, "u1").unwrap();
        assert!(object.is_registered());
        assert!(ObjectContext::same_context(&object.context().unwrap(), &context));
        object
    };

    assert!(!object.is_registered());
    assert!(object.context().is_none());
    object.delete_object_from_context();

    let fresh = context();
    object.register_to_context(&fresh).unwrap();
    assert!(fresh.contains_object_with_key("u1"));
}
