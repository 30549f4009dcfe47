//! CLI smoke entry point.
//!
//! # Responsibility
//! - Provide a minimal executable to verify `persistent_model_core` linkage.
//! - Run one create/save/reload cycle against a SQLite store.
//!
//! Usage: `persistent_model_cli [DB_PATH]` (in-memory database by default).

use persistent_model_core::{
    DomainObject, ModelRegistry, ModelSchema, ObjectContext, PersistentStore, PropertyKind,
    SqliteStore,
};
use serde_json::json;
use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

const SMOKE_KEY: &str = "cli-smoke";

fn main() -> ExitCode {
    println!("persistent_model_core ping={}", persistent_model_core::ping());
    println!(
        "persistent_model_core version={}",
        persistent_model_core::core_version()
    );

    match run(std::env::args().nth(1)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("event=cli_smoke module=cli status=error error={err}");
            eprintln!("smoke failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(db_path: Option<String>) -> Result<(), Box<dyn Error>> {
    let store: Arc<dyn PersistentStore> = match &db_path {
        Some(path) => Arc::new(SqliteStore::open(path)?),
        None => Arc::new(SqliteStore::open_in_memory()?),
    };

    let mut registry = ModelRegistry::new();
    let schema = registry.register(
        ModelSchema::builder("SmokeRecord")
            .property("label", PropertyKind::Text)
            .property("runs", PropertyKind::Integer)
            .build()?,
    )?;
    let registry = Arc::new(registry);

    let writer = ObjectContext::new(Some(Arc::clone(&store)), Arc::clone(&registry));
    let object = match DomainObject::object_with_key(SMOKE_KEY, &writer, &schema, true)? {
        Some(object) => object,
        None => return Err("object_with_key returned nothing with creation allowed".into()),
    };
    let runs = object
        .value("runs")
        .and_then(|value| value.as_i64())
        .unwrap_or(0);
    object.set_value("label", json!("persistent model smoke"))?;
    object.set_value("runs", json!(runs + 1))?;
    let summary = writer.save()?;
    println!(
        "save saved={} deleted={}",
        summary.saved_keys.len(),
        summary.deleted_keys.len()
    );

    let reader = ObjectContext::new(Some(store), registry);
    let reloaded = reader
        .object_for_key(SMOKE_KEY)?
        .ok_or("saved object is missing from the store")?;
    println!(
        "reload key={} runs={} location={}",
        reloaded.key(),
        reloaded.value("runs").unwrap_or_default(),
        db_path.as_deref().unwrap_or(":memory:")
    );
    Ok(())
}
