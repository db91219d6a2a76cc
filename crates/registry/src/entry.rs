// SPDX-License-Identifier: PolyForm-Shield-1.0

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use protocol::{Category, ModelList};

use crate::error::RegistryError;

/// Number of custom models shown to clients.
pub const DEFAULT_CUSTOM_LIMIT: usize = 20;

/// Shortest accepted model name, in characters, after trimming.
pub const MIN_NAME_LEN: usize = 2;

/// A single known model and how often it has been used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Lowercase, trimmed, non-empty.
    pub name: String,
    #[serde(default)]
    pub usage_count: u64,
}

/// The persisted registry document.
///
/// Invariants after every persist:
/// - `official` is sorted by name ascending,
/// - `custom` is sorted by usage count descending, then name ascending,
/// - names are unique within a category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub official: Vec<ModelEntry>,
    #[serde(default)]
    pub custom: Vec<ModelEntry>,
}

impl Registry {
    pub fn entries(&self, category: Category) -> &[ModelEntry] {
        match category {
            Category::Official => &self.official,
            Category::Custom => &self.custom,
        }
    }

    fn entries_mut(&mut self, category: Category) -> &mut Vec<ModelEntry> {
        match category {
            Category::Official => &mut self.official,
            Category::Custom => &mut self.custom,
        }
    }

    pub fn get(&self, category: Category, name: &str) -> Option<&ModelEntry> {
        self.entries(category).iter().find(|e| e.name == name)
    }

    /// Re-establish the ordering of both categories.
    pub fn restore_order(&mut self) {
        self.official.sort_by(|a, b| a.name.cmp(&b.name));
        self.custom.sort_by(|a, b| {
            b.usage_count
                .cmp(&a.usage_count)
                .then_with(|| a.name.cmp(&b.name))
        });
    }

    /// Record one usage of an already-normalized `name`.
    ///
    /// Returns `true` when the entry did not exist and was inserted with a
    /// count of 1. Ordering is not restored here.
    pub fn record_usage(&mut self, category: Category, name: &str) -> bool {
        let entries = self.entries_mut(category);
        if let Some(existing) = entries.iter_mut().find(|e| e.name == name) {
            existing.usage_count = existing.usage_count.saturating_add(1);
            false
        } else {
            entries.push(ModelEntry {
                name: name.to_string(),
                usage_count: 1,
            });
            true
        }
    }

    pub fn official_names(&self) -> Vec<String> {
        self.official.iter().map(|e| e.name.clone()).collect()
    }

    /// The `limit` most used custom models, in display order.
    pub fn top_custom(&self, limit: usize) -> Vec<String> {
        self.custom
            .iter()
            .take(limit)
            .map(|e| e.name.clone())
            .collect()
    }

    pub fn to_model_list(&self, custom_limit: usize, version: u64) -> ModelList {
        ModelList {
            official: self.official_names(),
            custom: self.top_custom(custom_limit),
            version,
        }
    }
}

/// Trim and lowercase a caller-supplied model name.
pub fn normalize_name(raw: &str) -> Result<String, RegistryError> {
    let name = raw.trim().to_lowercase();
    if name.is_empty() {
        return Err(RegistryError::InvalidName {
            name,
            reason: "name is empty",
        });
    }
    if name.chars().count() < MIN_NAME_LEN {
        return Err(RegistryError::InvalidName {
            name,
            reason: "name must be at least 2 characters",
        });
    }
    Ok(name)
}

/// Document written when no registry file exists yet, in the legacy
/// bare-name form so it goes through the same migration as old files.
pub(crate) fn seed_document() -> Value {
    json!({
        "official": ["claude-3-7-sonnet", "gemini-2.0-flash", "gpt-4o"],
        "custom": [
            "meta-llama/llama-4-maverick-17b-128e-instruct",
            "microsoft/phi-4",
            "qwen/qwen2.5-7b-instruct",
            "qwen/qwen3-8b"
        ]
    })
}
