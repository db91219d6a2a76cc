// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use protocol::{ModelKind, TokenCountResponse};

pub mod anthropic;
mod error;
pub mod gemini;
pub mod huggingface;
pub mod openai;
pub mod pricing;

pub use anthropic::AnthropicCounter;
pub use error::CountError;
pub use gemini::GeminiCounter;
pub use huggingface::HuggingFaceCounter;
pub use openai::TiktokenCounter;

/// Anything that can turn text into a token count for a given model.
#[async_trait]
pub trait TokenCounter: Send + Sync {
    async fn count(&self, model: &str, text: &str) -> Result<usize, CountError>;
}

/// Which backend a commercial model name is counted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    Gemini,
    OpenAi,
}

impl Provider {
    /// Route a normalized commercial model name by its family.
    pub fn for_model(model: &str) -> Option<Provider> {
        if model.contains("claude") {
            Some(Provider::Anthropic)
        } else if model.contains("gemini") {
            Some(Provider::Gemini)
        } else if model.contains("gpt") || model.starts_with("o1") || model.starts_with("o3") {
            Some(Provider::OpenAi)
        } else {
            None
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Provider::Anthropic => "Anthropic",
            Provider::Gemini => "Google",
            Provider::OpenAi => "OpenAI",
        }
    }
}

/// Credentials and locations the default backends are built from.
#[derive(Debug, Clone, Default)]
pub struct CounterSettings {
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub huggingface_token: Option<String>,
    pub tokenizer_cache_dir: PathBuf,
}

/// Dispatches a count to the right backend and attaches pricing.
#[derive(Clone)]
pub struct CounterRouter {
    anthropic: Option<Arc<dyn TokenCounter>>,
    gemini: Option<Arc<dyn TokenCounter>>,
    openai: Arc<dyn TokenCounter>,
    huggingface: Arc<dyn TokenCounter>,
}

impl CounterRouter {
    pub fn new(settings: CounterSettings) -> Self {
        let anthropic = settings
            .anthropic_api_key
            .filter(|k| !k.is_empty())
            .map(|k| Arc::new(AnthropicCounter::new(k)) as Arc<dyn TokenCounter>);
        let gemini = settings
            .google_api_key
            .filter(|k| !k.is_empty())
            .map(|k| Arc::new(GeminiCounter::new(k)) as Arc<dyn TokenCounter>);
        Self {
            anthropic,
            gemini,
            openai: Arc::new(TiktokenCounter::new()),
            huggingface: Arc::new(HuggingFaceCounter::new(
                settings.tokenizer_cache_dir,
                settings.huggingface_token,
            )),
        }
    }

    /// Assemble a router from explicit backends. `None` marks a provider
    /// whose credentials are missing.
    pub fn from_parts(
        anthropic: Option<Arc<dyn TokenCounter>>,
        gemini: Option<Arc<dyn TokenCounter>>,
        openai: Arc<dyn TokenCounter>,
        huggingface: Arc<dyn TokenCounter>,
    ) -> Self {
        Self {
            anthropic,
            gemini,
            openai,
            huggingface,
        }
    }

    /// Count `text` for `model` and enrich the result with pricing.
    ///
    /// The returned `model` is the normalized (trimmed, lowercase) name.
    pub async fn count(
        &self,
        model: &str,
        text: &str,
        kind: ModelKind,
    ) -> Result<TokenCountResponse, CountError> {
        let model = model.trim().to_lowercase();
        if model.is_empty() {
            return Err(CountError::UnsupportedModel(model));
        }

        let token_count = match kind {
            ModelKind::Commercial => self.count_commercial(&model, text).await?,
            ModelKind::HuggingFace => self.huggingface.count(&model, text).await?,
        };
        debug!("counted {} tokens for {} ({:?})", token_count, model, kind);

        let usage = pricing::context_usage(&model, token_count);
        Ok(TokenCountResponse {
            token_count,
            cost_usd: pricing::calculate_cost(&model, token_count),
            context_window: usage.map(|(_, window)| window),
            context_usage_percent: usage.map(|(percent, _)| pricing::round_to(percent, 4)),
            model,
        })
    }

    async fn count_commercial(&self, model: &str, text: &str) -> Result<usize, CountError> {
        let provider = Provider::for_model(model)
            .ok_or_else(|| CountError::UnsupportedModel(model.to_string()))?;
        let backend = match provider {
            Provider::Anthropic => self.anthropic.as_ref(),
            Provider::Gemini => self.gemini.as_ref(),
            Provider::OpenAi => Some(&self.openai),
        };
        let backend = backend.ok_or(CountError::MissingCredential {
            provider: provider.label(),
        })?;
        backend.count(model, text).await
    }
}
