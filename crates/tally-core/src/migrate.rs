//! Schema migration for loaded envelopes.
//!
//! Migration operates on the raw JSON value, before the typed envelope is
//! built, so legacy field names and shapes can be rewritten wholesale. The
//! engine is an ordered list of version-pair steps applied until the
//! payload reaches [`SCHEMA_VERSION`]; each step is idempotent and never
//! fails — records that cannot be mapped are dropped, not fatal.

use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::envelope::SCHEMA_VERSION;

/// One version-to-version rewrite of the raw payload.
struct MigrationStep {
    from: &'static str,
    to: &'static str,
    apply: fn(Value) -> Value,
}

fn migration_steps() -> &'static [MigrationStep] {
    &[MigrationStep {
        from: "0.9.0",
        to: "1.0.0",
        apply: migrate_0_9_to_1_0,
    }]
}

fn payload_version(value: &Value) -> Option<&str> {
    value
        .get("schemaVersion")
        .or_else(|| value.get("version"))
        .and_then(Value::as_str)
}

/// Upgrade `value` to the current schema version. Returns the (possibly
/// rewritten) payload and whether anything changed; a changed payload must
/// be persisted immediately by the caller.
///
/// Payloads without a recognizable version, or with a version no step can
/// start from, are returned untouched — the recovery engine decides what
/// to salvage from them.
pub fn migrate(value: Value) -> (Value, bool) {
    let Some(mut version) = payload_version(&value).map(String::from) else {
        return (value, false);
    };
    if version == SCHEMA_VERSION {
        return (value, false);
    }

    let steps = migration_steps();
    let mut current = value;
    let mut changed = false;
    for _ in 0..steps.len() {
        let Some(step) = steps.iter().find(|s| s.from == version) else {
            break;
        };
        tracing::info!("migrating task envelope {} -> {}", step.from, step.to);
        current = (step.apply)(current);
        version = step.to.to_string();
        changed = true;
        if version == SCHEMA_VERSION {
            break;
        }
    }
    (current, changed)
}

/// 0.9.0 stored `{ items: [{ _id, title, done }], version }`. Map each
/// entry to the current record shape, synthesizing ids and timestamps
/// where the legacy data has none.
fn migrate_0_9_to_1_0(value: Value) -> Value {
    let Value::Object(mut obj) = value else {
        return value;
    };

    let legacy_items = obj
        .remove("items")
        .or_else(|| obj.remove("records"))
        .unwrap_or_else(|| Value::Array(Vec::new()));

    let mut records = Vec::new();
    if let Value::Array(entries) = legacy_items {
        for entry in entries {
            match migrate_0_9_record(entry) {
                Some(record) => records.push(record),
                None => tracing::warn!("dropping unmappable legacy task record"),
            }
        }
    }

    obj.remove("version");
    obj.insert("records".into(), Value::Array(records));
    obj.insert("schemaVersion".into(), json!("1.0.0"));
    Value::Object(obj)
}

fn migrate_0_9_record(entry: Value) -> Option<Value> {
    let Value::Object(entry) = entry else {
        return None;
    };

    let text = string_field(&entry, &["text", "title"])?;
    let id = string_field(&entry, &["id", "_id"])
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let completed = entry
        .get("completed")
        .or_else(|| entry.get("done"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let now = Utc::now().to_rfc3339();
    let created_at = string_field(&entry, &["createdAt"]).unwrap_or_else(|| now.clone());
    let updated_at = string_field(&entry, &["updatedAt"]).unwrap_or_else(|| created_at.clone());

    Some(json!({
        "id": id,
        "text": text,
        "completed": completed,
        "createdAt": created_at,
        "updatedAt": updated_at,
    }))
}

fn string_field(entry: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| entry.get(*name))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}
