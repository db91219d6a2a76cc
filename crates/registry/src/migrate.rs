// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Normalisation of older registry documents.
//!
//! Early registry files stored each category as a flat list of names:
//!
//! ```json
//! { "official": ["gpt-4o"], "custom": ["microsoft/phi-4"] }
//! ```
//!
//! The current shape stores `{ "name", "usage_count" }` records. Migration
//! converts every bare name into a record with a zero count and passes
//! records through untouched, so running it on current data is a no-op.

use serde_json::Value;

use crate::entry::{ModelEntry, Registry};
use crate::error::RegistryError;

/// Convert a raw registry document into the current shape.
///
/// Returns the registry and whether any legacy entry was converted. When the
/// flag is set the caller must persist the result before handing it out.
pub fn migrate(raw: Value) -> Result<(Registry, bool), RegistryError> {
    let Value::Object(mut doc) = raw else {
        return Err(RegistryError::Corrupt(
            "top-level value is not an object".to_string(),
        ));
    };

    let mut changed = false;
    let official = migrate_category("official", doc.remove("official"), &mut changed)?;
    let custom = migrate_category("custom", doc.remove("custom"), &mut changed)?;

    Ok((Registry { official, custom }, changed))
}

fn migrate_category(
    key: &str,
    raw: Option<Value>,
    changed: &mut bool,
) -> Result<Vec<ModelEntry>, RegistryError> {
    let items = match raw {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(RegistryError::Corrupt(format!(
                "`{key}` must be an array, found {}",
                kind_of(&other)
            )))
        }
    };

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(name) => {
                *changed = true;
                entries.push(ModelEntry {
                    name,
                    usage_count: 0,
                });
            }
            Value::Object(_) => {
                let entry: ModelEntry = serde_json::from_value(item).map_err(|e| {
                    RegistryError::Corrupt(format!("invalid entry in `{key}`: {e}"))
                })?;
                entries.push(entry);
            }
            other => {
                return Err(RegistryError::Corrupt(format!(
                    "unexpected {} in `{key}`",
                    kind_of(&other)
                )))
            }
        }
    }
    Ok(entries)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
