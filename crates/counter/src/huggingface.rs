// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokenizers::Tokenizer;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{CountError, TokenCounter};

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
const TOKENIZER_FILE: &str = "tokenizer.json";

/// Counts with a model's own `tokenizer.json` from the Hugging Face Hub.
///
/// Files are downloaded once into `cache_dir` and parsed tokenizers are
/// kept in memory for the life of the counter.
#[derive(Clone)]
pub struct HuggingFaceCounter {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    cache_dir: PathBuf,
    endpoint: String,
    token: Option<String>,
    loaded: Mutex<HashMap<String, Arc<Tokenizer>>>,
}

impl HuggingFaceCounter {
    pub fn new<P: Into<PathBuf>>(cache_dir: P, token: Option<String>) -> Self {
        Self::with_endpoint(cache_dir, token, DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint<P: Into<PathBuf>, U: Into<String>>(
        cache_dir: P,
        token: Option<String>,
        endpoint: U,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client: reqwest::Client::builder()
                    .timeout(Duration::from_secs(60))
                    .build()
                    .unwrap_or_default(),
                cache_dir: cache_dir.into(),
                endpoint: endpoint.into().trim_end_matches('/').to_string(),
                token,
                loaded: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.inner.cache_dir
    }

    /// On-disk location of the cached `tokenizer.json` for `model`.
    pub fn cached_file(&self, model: &str) -> PathBuf {
        self.inner
            .cache_dir
            .join(model.replace('/', "--"))
            .join(TOKENIZER_FILE)
    }

    async fn tokenizer(&self, model: &str) -> Result<Arc<Tokenizer>, CountError> {
        validate_repo_id(model)?;

        // Held across the download so a model is only fetched once.
        let mut loaded = self.inner.loaded.lock().await;
        if let Some(tok) = loaded.get(model) {
            return Ok(tok.clone());
        }

        let path = self.cached_file(model);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.download(model, &path).await?
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to read {}", path.display()))
                    .into())
            }
        };

        let tokenizer = tokio::task::spawn_blocking(move || Tokenizer::from_bytes(bytes))
            .await
            .context("tokenizer loader panicked")?
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("invalid tokenizer.json for {model}"))?;

        let tokenizer = Arc::new(tokenizer);
        loaded.insert(model.to_string(), tokenizer.clone());
        info!("loaded tokenizer for {}", model);
        Ok(tokenizer)
    }

    async fn download(&self, model: &str, path: &Path) -> Result<Vec<u8>, CountError> {
        let url = format!(
            "{}/{}/resolve/main/{}",
            self.inner.endpoint, model, TOKENIZER_FILE
        );
        debug!("downloading {}", url);

        let mut req = self.inner.client.get(&url);
        if let Some(token) = &self.inner.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("failed to fetch tokenizer for {model}"))?;

        let status = resp.status();
        // The hub answers 401 for repositories that do not exist.
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::UNAUTHORIZED
        {
            return Err(CountError::UnsupportedModel(model.to_string()));
        }
        if !status.is_success() {
            return Err(anyhow::anyhow!("hub returned {status} for {model}").into());
        }

        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("failed to read tokenizer for {model}"))?
            .to_vec();

        write_atomic(path, &bytes).await?;
        Ok(bytes)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to move tokenizer into {}", path.display()))?;
    Ok(())
}

/// `org/name` style ids only; anything that could escape the cache
/// directory is rejected.
fn validate_repo_id(model: &str) -> Result<(), CountError> {
    let bad = model.is_empty()
        || model.starts_with('/')
        || model.contains('\\')
        || model.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        Err(CountError::UnsupportedModel(model.to_string()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl TokenCounter for HuggingFaceCounter {
    async fn count(&self, model: &str, text: &str) -> Result<usize, CountError> {
        let tokenizer = self.tokenizer(model).await?;
        if text.is_empty() {
            return Ok(0);
        }

        let text = text.to_string();
        let n = tokio::task::spawn_blocking(move || {
            tokenizer
                .encode(text.as_str(), true)
                .map(|enc| enc.len())
                .map_err(anyhow::Error::msg)
        })
        .await
        .context("tokenizer worker panicked")??;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORD_LEVEL: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"[UNK]": 0, "hello": 1, "world": 2},
            "unk_token": "[UNK]"
        }
    }"#;

    fn seeded_counter(dir: &Path) -> HuggingFaceCounter {
        // Unroutable endpoint: any attempt to download fails loudly.
        let counter = HuggingFaceCounter::with_endpoint(dir, None, "http://127.0.0.1:9");
        let path = counter.cached_file("local/word-level");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, WORD_LEVEL).unwrap();
        counter
    }

    #[test]
    fn cache_layout_flattens_repo_ids() {
        let counter = HuggingFaceCounter::new("/cache", None);
        assert_eq!(
            counter.cached_file("qwen/qwen3-8b"),
            PathBuf::from("/cache/qwen--qwen3-8b/tokenizer.json")
        );
    }

    #[test]
    fn traversal_ids_are_rejected() {
        for bad in ["", "/etc/passwd", "../x", "a//b", "a/../b", "a\\b"] {
            assert!(matches!(
                validate_repo_id(bad),
                Err(CountError::UnsupportedModel(_))
            ));
        }
        assert!(validate_repo_id("microsoft/phi-4").is_ok());
    }

    #[tokio::test]
    async fn counts_with_cached_tokenizer() {
        let dir = tempfile::tempdir().unwrap();
        let counter = seeded_counter(dir.path());

        assert_eq!(counter.count("local/word-level", "hello world again").await.unwrap(), 3);
        assert_eq!(counter.count("local/word-level", "").await.unwrap(), 0);
        assert_eq!(counter.inner.loaded.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_cached_file_is_a_backend_error() {
        let dir = tempfile::tempdir().unwrap();
        let counter = HuggingFaceCounter::with_endpoint(dir.path(), None, "http://127.0.0.1:9");
        let path = counter.cached_file("local/broken");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            counter.count("local/broken", "hello").await,
            Err(CountError::Backend(_))
        ));
    }
}
