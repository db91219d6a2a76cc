// SPDX-License-Identifier: PolyForm-Shield-1.0

use thiserror::Error;

/// Errors surfaced by the model registry.
///
/// `InvalidName` is a caller error and is raised before the registry is
/// touched. `Corrupt` and `Storage` abort the current operation and leave the
/// cached state exactly as it was.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid model name: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("corrupt registry document: {0}")]
    Corrupt(String),

    #[error("registry storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("registry service has been closed")]
    Closed,
}

impl RegistryError {
    /// Whether this error was caused by caller input rather than the store.
    pub fn is_validation(&self) -> bool {
        matches!(self, RegistryError::InvalidName { .. })
    }
}
