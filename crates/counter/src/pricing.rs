// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Input pricing and context window sizes for well-known commercial models.

use protocol::PricingInfo;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    /// USD per one million input tokens.
    pub input_price: f64,
    /// Context window in tokens.
    pub context_window: u64,
}

const fn price(input_price: f64, context_window: u64) -> ModelPrice {
    ModelPrice {
        input_price,
        context_window,
    }
}

static MODEL_PRICES: &[(&str, ModelPrice)] = &[
    // openai; gpt-5.x share the gpt-4o encoding
    ("gpt-5", price(2.50, 128_000)),
    ("gpt-5.1", price(2.50, 128_000)),
    ("gpt-5.2", price(2.50, 128_000)),
    ("gpt-4o", price(2.50, 128_000)),
    ("gpt-4o-mini", price(0.15, 128_000)),
    ("gpt-4-turbo", price(10.00, 128_000)),
    ("gpt-4", price(30.00, 8_192)),
    ("gpt-3.5-turbo", price(0.50, 16_385)),
    ("o1", price(15.00, 200_000)),
    ("o1-mini", price(3.00, 128_000)),
    ("o1-pro", price(150.00, 200_000)),
    ("o3", price(10.00, 200_000)),
    ("o3-mini", price(1.10, 200_000)),
    // anthropic
    ("claude-3-5-sonnet", price(3.00, 200_000)),
    ("claude-3-5-haiku", price(0.80, 200_000)),
    ("claude-3-7-sonnet", price(3.00, 200_000)),
    ("claude-3-opus", price(15.00, 200_000)),
    ("claude-3-sonnet", price(3.00, 200_000)),
    ("claude-3-haiku", price(0.25, 200_000)),
    ("claude-opus-4", price(15.00, 200_000)),
    ("claude-sonnet-4", price(3.00, 200_000)),
    // google
    ("gemini-2.0-flash", price(0.10, 1_000_000)),
    ("gemini-2.0-flash-lite", price(0.075, 1_000_000)),
    ("gemini-1.5-pro", price(1.25, 2_000_000)),
    ("gemini-1.5-flash", price(0.075, 1_000_000)),
    ("gemini-2.5-pro", price(1.25, 1_000_000)),
    ("gemini-2.5-flash", price(0.15, 1_000_000)),
];

/// Price for a normalized (lowercase) model name.
///
/// Exact matches win. Otherwise the longest table key contained in the
/// name is used, so `claude-3-5-sonnet-20241022` resolves to
/// `claude-3-5-sonnet` and `gpt-4o-mini-2024` to `gpt-4o-mini`, not `gpt-4o`.
pub fn lookup(model: &str) -> Option<ModelPrice> {
    if let Some((_, p)) = MODEL_PRICES.iter().find(|(key, _)| *key == model) {
        return Some(*p);
    }
    MODEL_PRICES
        .iter()
        .filter(|(key, _)| model.contains(key))
        .max_by_key(|(key, _)| key.len())
        .map(|(_, p)| *p)
}

pub fn calculate_cost(model: &str, token_count: usize) -> Option<f64> {
    lookup(model).map(|p| p.input_price / 1_000_000.0 * token_count as f64)
}

/// `(percent of the window used, window size)`.
pub fn context_usage(model: &str, token_count: usize) -> Option<(f64, u64)> {
    lookup(model).map(|p| {
        let percent = token_count as f64 / p.context_window as f64 * 100.0;
        (percent, p.context_window)
    })
}

/// `1M`, `128K`, or the raw number below 1000.
pub fn format_context_window(size: u64) -> String {
    if size >= 1_000_000 {
        format!("{}M", size / 1_000_000)
    } else if size >= 1_000 {
        format!("{}K", size / 1_000)
    } else {
        size.to_string()
    }
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

pub fn pricing_info(model: &str) -> PricingInfo {
    let model = model.trim().to_lowercase();
    let found = lookup(&model);
    PricingInfo {
        input_price: found.map(|p| p.input_price),
        context_window: found.map(|p| p.context_window),
        context_window_formatted: found.map(|p| format_context_window(p.context_window)),
        model,
    }
}
