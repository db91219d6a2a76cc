// SPDX-License-Identifier: PolyForm-Shield-1.0

use tracing_subscriber::{fmt, EnvFilter};

/// Default filter when `RUST_LOG` is unset: our crates at info, and the
/// noisier HTTP stack at warn.
pub const DEFAULT_FILTER: &str = "info,hyper=warn,reqwest=warn,tungstenite=warn";

/// Install the global fmt subscriber.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    init_tracing_with(None);
}

/// Like [`init_tracing`], but with an explicit filter that wins over the
/// built-in default (`RUST_LOG` still wins over both).
pub fn init_tracing_with(default_filter: Option<&str>) {
    let filter = build_filter(default_filter);
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn build_filter(default_filter: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter.unwrap_or(DEFAULT_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
