// SPDX-License-Identifier: PolyForm-Shield-1.0

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CountError {
    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("{provider} API key not configured")]
    MissingCredential { provider: &'static str },

    #[error("token counting failed: {0:#}")]
    Backend(#[from] anyhow::Error),
}
