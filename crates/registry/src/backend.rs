// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::time::SystemTime;

use anyhow::Result;
use serde_json::Value;

use store::JsonStore;

use crate::entry::Registry;

/// Storage seam for the registry.
///
/// The service only needs three things from its store: the raw document
/// (which may be in a legacy shape), an atomic save, and a modification
/// stamp to tell whether someone else rewrote the document since it was
/// cached. `JsonStore` is the production implementation.
pub trait RegistryBackend: Send + Sync + 'static {
    /// Raw document, or `None` if nothing has been stored yet.
    fn load(&self) -> Result<Option<Value>>;

    /// Replace the stored document. Readers must never observe a partial write.
    fn save(&self, registry: &Registry) -> Result<()>;

    /// Opaque change stamp of the stored document, `None` if absent.
    fn modified(&self) -> Result<Option<SystemTime>>;

    /// Human-readable location for log lines.
    fn describe(&self) -> String;
}

impl RegistryBackend for JsonStore {
    fn load(&self) -> Result<Option<Value>> {
        self.load_optional()
    }

    fn save(&self, registry: &Registry) -> Result<()> {
        JsonStore::save(self, registry)
    }

    fn modified(&self) -> Result<Option<SystemTime>> {
        JsonStore::modified(self)
    }

    fn describe(&self) -> String {
        self.path().display().to_string()
    }
}
