// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{CountError, TokenCounter};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Counts via the Gemini `models/{model}:countTokens` endpoint.
pub struct GeminiCounter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
struct CountRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountResponse {
    #[serde(default)]
    total_tokens: u64,
}

impl GeminiCounter {
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

#[async_trait]
impl TokenCounter for GeminiCounter {
    async fn count(&self, model: &str, text: &str) -> Result<usize, CountError> {
        let url = format!("{}/v1beta/models/{}:countTokens", self.base_url, model);
        let body = CountRequest {
            contents: [Content {
                parts: [Part { text }],
            }],
        };

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("gemini countTokens request failed")?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CountError::UnsupportedModel(model.to_string()));
        }
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("gemini returned {status}: {detail}").into());
        }

        let parsed: CountResponse = resp
            .json()
            .await
            .context("invalid gemini countTokens response")?;
        debug!("gemini counted {} tokens for {}", parsed.total_tokens, model);
        Ok(parsed.total_tokens as usize)
    }
}
