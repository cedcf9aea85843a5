//! Structural validation and salvage of loaded envelopes.
//!
//! Recovery never raises. Whatever shape the payload is in, it returns a
//! best-effort envelope: structurally valid records are kept (with a
//! synthesized id or defaulted timestamps where those are missing), the
//! rest are discarded. The caller persists the salvaged envelope whenever
//! recovery reports that it differs from the input.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::envelope::{Envelope, SCHEMA_VERSION};
use crate::task::{sanitize_text, validate_text, Task};

/// Build a typed envelope from a raw payload, salvaging what is valid.
/// The returned flag is true when the result differs from the input and
/// should be written back.
pub fn salvage(value: &Value) -> (Envelope, bool) {
    let Some(obj) = value.as_object() else {
        tracing::warn!("task envelope has no object at the top level, starting empty");
        return (Envelope::empty(), true);
    };

    let mut dirty = false;

    if obj.get("schemaVersion").and_then(Value::as_str) != Some(SCHEMA_VERSION) {
        dirty = true;
    }

    let empty = Vec::new();
    let raw_records = match obj.get("records") {
        Some(Value::Array(entries)) => entries,
        _ => {
            tracing::warn!("task envelope has no records list, starting empty");
            dirty = true;
            &empty
        }
    };

    let mut records = Vec::with_capacity(raw_records.len());
    let mut seen_ids = HashSet::new();
    let mut dropped = 0usize;
    for entry in raw_records {
        match salvage_record(entry, &mut seen_ids) {
            Some((task, repaired)) => {
                dirty |= repaired;
                records.push(task);
            }
            None => {
                dropped += 1;
                dirty = true;
            }
        }
    }
    if dropped > 0 {
        tracing::warn!("recovery dropped {dropped} malformed task records");
    }

    let last_sync_timestamp = match obj.get("lastSyncTimestamp") {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            dirty = true;
            None
        }
    };

    (
        Envelope {
            records,
            schema_version: SCHEMA_VERSION.to_string(),
            last_sync_timestamp,
        },
        dirty,
    )
}

/// Salvage one record. Returns the task and whether any field had to be
/// repaired; `None` means the record is beyond saving (no usable text, or
/// a duplicate id).
fn salvage_record(entry: &Value, seen_ids: &mut HashSet<String>) -> Option<(Task, bool)> {
    let obj = entry.as_object()?;
    let mut repaired = false;

    let raw_text = obj.get("text").and_then(Value::as_str)?;
    let text = sanitize_text(raw_text);
    validate_text(&text).ok()?;
    if text != raw_text {
        repaired = true;
    }

    let id = match obj.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            repaired = true;
            Uuid::new_v4().to_string()
        }
    };
    if !seen_ids.insert(id.clone()) {
        return None;
    }

    let completed = match obj.get("completed") {
        Some(Value::Bool(b)) => *b,
        None => false,
        Some(_) => {
            repaired = true;
            false
        }
    };

    let created_at = parse_timestamp(obj.get("createdAt"), &mut repaired);
    let mut updated_at = parse_timestamp(obj.get("updatedAt"), &mut repaired);
    if updated_at < created_at {
        updated_at = created_at;
        repaired = true;
    }

    Some((
        Task {
            id,
            text,
            completed,
            created_at,
            updated_at,
            pending: false,
        },
        repaired,
    ))
}

fn parse_timestamp(value: Option<&Value>, repaired: &mut bool) -> DateTime<Utc> {
    match value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    {
        Some(dt) => dt.with_timezone(&Utc),
        None => {
            *repaired = true;
            Utc::now()
        }
    }
}
