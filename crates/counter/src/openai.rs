// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use tiktoken_rs::CoreBPE;
use tracing::debug;

use crate::{CountError, TokenCounter};

/// Local BPE counting for OpenAI models with tiktoken encodings.
///
/// Models tiktoken does not know yet (e.g. `gpt-5`) use `o200k_base`, the
/// gpt-4o encoding.
#[derive(Clone, Default)]
pub struct TiktokenCounter {
    encoders: Arc<Mutex<HashMap<String, Arc<CoreBPE>>>>,
}

impl TiktokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn encoder(&self, model: &str) -> anyhow::Result<Arc<CoreBPE>> {
        let mut encoders = self.encoders.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bpe) = encoders.get(model) {
            return Ok(bpe.clone());
        }

        let bpe = match tiktoken_rs::get_bpe_from_model(model) {
            Ok(bpe) => bpe,
            Err(_) => {
                debug!("no tiktoken encoding registered for {}; using o200k_base", model);
                tiktoken_rs::o200k_base().context("failed to load o200k_base encoding")?
            }
        };
        let bpe = Arc::new(bpe);
        encoders.insert(model.to_string(), bpe.clone());
        Ok(bpe)
    }

    pub fn count_blocking(&self, model: &str, text: &str) -> anyhow::Result<usize> {
        let bpe = self.encoder(model)?;
        Ok(bpe.encode_with_special_tokens(text).len())
    }
}

#[async_trait]
impl TokenCounter for TiktokenCounter {
    async fn count(&self, model: &str, text: &str) -> Result<usize, CountError> {
        let this = self.clone();
        let model = model.to_string();
        let text = text.to_string();
        let n = tokio::task::spawn_blocking(move || this.count_blocking(&model, &text))
            .await
            .context("tiktoken worker panicked")??;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_with_known_and_fallback_encodings() {
        let counter = TiktokenCounter::new();
        assert_eq!(counter.count_blocking("gpt-4o", "").unwrap(), 0);
        assert!(counter.count_blocking("gpt-4o", "hello world").unwrap() >= 2);
        assert_eq!(
            counter.count_blocking("gpt-5.2", "hello world").unwrap(),
            counter.count_blocking("gpt-4o", "hello world").unwrap()
        );
    }

    #[test]
    fn encoders_are_cached_per_model() {
        let counter = TiktokenCounter::new();
        counter.count_blocking("gpt-4o", "a").unwrap();
        counter.count_blocking("gpt-4o", "b").unwrap();
        assert_eq!(counter.encoders.lock().unwrap().len(), 1);
    }
}
