//! Helpers over JSON value trees.
//!
//! The engine treats all runtime values as [`serde_json::Value`] trees.
//! File and Directory values are objects carrying a `class` and a `location`;
//! the engine never dereferences them beyond what the filesystem collaborator
//! is asked to pre-load.

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::WorkflowError;
use crate::fs::FsAccess;

/// Ordered mapping from parameter id to runtime value.
pub type ValueMap = IndexMap<String, Value>;

/// Returns the fragment of a fully qualified id: the text after the last
/// `#`, then after the last `/`.
pub fn shortname(id: &str) -> &str {
    let fragment = id.rsplit('#').next().unwrap_or(id);
    fragment.rsplit('/').next().unwrap_or(fragment)
}

/// Re-keys a value map by parameter short names.
pub fn short_view(map: &ValueMap) -> ValueMap {
    map.iter().map(|(id, value)| (shortname(id).to_string(), value.clone())).collect()
}

/// Returns true when `value` is an object whose `class` field equals `class`.
pub fn has_class(value: &Value, class: &str) -> bool {
    value.get("class").and_then(Value::as_str) == Some(class)
}

/// Recursively fills in `listing` fields on Directory values.
///
/// The expression engine's contract requires directory values to carry their
/// listings before evaluation; the filesystem collaborator supplies one level
/// at a time and this walk recurses into the returned entries.
pub fn expand_directory_listings(value: &mut Value, fs: &dyn FsAccess) -> Result<(), WorkflowError> {
    match value {
        Value::Object(fields) => {
            if fields.get("class").and_then(Value::as_str) == Some("Directory") && !fields.contains_key("listing") {
                let location = fields
                    .get("location")
                    .and_then(Value::as_str)
                    .ok_or_else(|| WorkflowError::Validation("Directory value has no location".to_string()))?;
                let mut entries = fs.listing(location)?;
                for entry in &mut entries {
                    expand_directory_listings(entry, fs)?;
                }
                fields.insert("listing".to_string(), Value::Array(entries));
            } else {
                for field in fields.values_mut() {
                    expand_directory_listings(field, fs)?;
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                expand_directory_listings(item, fs)?;
            }
        }
        _ => {}
    }
    Ok(())
}
