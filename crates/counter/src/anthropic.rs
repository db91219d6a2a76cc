// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{CountError, TokenCounter};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Tokens the messages endpoint charges for the single-user-turn wrapper
/// around the text.
pub const TEMPLATE_TOKENS: u64 = 7;

/// Counts via Anthropic's `/v1/messages/count_tokens` endpoint.
pub struct AnthropicCounter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
struct CountRequest<'a> {
    model: String,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct CountResponse {
    input_tokens: u64,
}

impl AnthropicCounter {
    pub fn new<S: Into<String>>(api_key: S) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url<S: Into<String>, U: Into<String>>(api_key: S, base_url: U) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

/// The API spells versions with dashes (`claude-3-7-sonnet`), users often
/// type dots (`claude-3.7-sonnet`).
pub fn api_model_name(model: &str) -> String {
    model.replace('.', "-")
}

#[async_trait]
impl TokenCounter for AnthropicCounter {
    async fn count(&self, model: &str, text: &str) -> Result<usize, CountError> {
        let url = format!("{}/v1/messages/count_tokens", self.base_url);
        let body = CountRequest {
            model: api_model_name(model),
            messages: [Message {
                role: "user",
                content: text,
            }],
        };

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .context("anthropic count_tokens request failed")?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CountError::UnsupportedModel(model.to_string()));
        }
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("anthropic returned {status}: {detail}").into());
        }

        let parsed: CountResponse = resp
            .json()
            .await
            .context("invalid anthropic count_tokens response")?;
        debug!("anthropic counted {} input tokens for {}", parsed.input_tokens, model);

        Ok(parsed.input_tokens.saturating_sub(TEMPLATE_TOKENS) as usize)
    }
}
