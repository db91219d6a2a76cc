// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// registry category a model belongs to.
///
/// `official` holds commercial, API-backed models; `custom` holds open models
/// counted with a locally loaded tokenizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Official,
    #[default]
    Custom,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Official => "official",
            Category::Custom => "custom",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown category `{0}`; expected `official` or `custom`")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "official" => Ok(Category::Official),
            "custom" => Ok(Category::Custom),
            _ => Err(UnknownCategory(s.to_string())),
        }
    }
}

/// how a model's tokens are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    /// provider API or provider-published encoding (claude, gemini, gpt, o-series).
    #[serde(rename = "commercial")]
    Commercial,
    /// open model whose `tokenizer.json` is fetched from the hugging face hub.
    #[serde(rename = "huggingface")]
    HuggingFace,
}

impl ModelKind {
    /// registry category a successfully counted model is recorded under.
    pub fn category(&self) -> Category {
        match self {
            ModelKind::Commercial => Category::Official,
            ModelKind::HuggingFace => Category::Custom,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid model_type: {0}. Must be 'commercial' or 'huggingface'")]
pub struct UnknownModelKind(pub String);

impl FromStr for ModelKind {
    type Err = UnknownModelKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "commercial" => Ok(ModelKind::Commercial),
            "huggingface" => Ok(ModelKind::HuggingFace),
            _ => Err(UnknownModelKind(s.to_string())),
        }
    }
}

/// projection of the registry handed to clients: names only, plus the
/// version counter used for change detection.
///
/// `custom` is already truncated to the most used entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelList {
    pub official: Vec<String>,
    pub custom: Vec<String>,
    pub version: u64,
}

/// events pushed from the server to live-update clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// full snapshot sent once, right after a connection opens.
    Init { data: ModelList },
    /// snapshot broadcast to every connection after a successful mutation.
    ModelAdded { data: ModelList },
    /// rejection of a message sent by this connection only.
    Error { error: String },
}

/// messages accepted from live-update clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// record a usage of `name` in `category` (defaults to `custom`).
    AddModel {
        #[serde(default)]
        name: String,
        #[serde(default)]
        category: Category,
    },
}

/// body of `POST /api/models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddModelRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub category: Category,
}

/// reply to `POST /api/models`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddModelResponse {
    #[serde(flatten)]
    pub models: ModelList,
    pub was_new: bool,
}

/// body of `POST /api/count-tokens`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCountRequest {
    pub text: String,
    pub model: String,
    pub model_type: ModelKind,
}

/// token count enriched with pricing and context-window data.
///
/// pricing fields are `None` when the model is not in the pricing table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenCountResponse {
    pub token_count: usize,
    pub cost_usd: Option<f64>,
    pub context_window: Option<u64>,
    pub context_usage_percent: Option<f64>,
    pub model: String,
}

/// reply to `GET /api/pricing/{model}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingInfo {
    pub model: String,
    /// usd per one million input tokens.
    pub input_price: Option<f64>,
    pub context_window: Option<u64>,
    /// e.g. `128K`, `1M`.
    pub context_window_formatted: Option<String>,
}

/// json error body returned by the http gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub error_code: Option<String>,
}
