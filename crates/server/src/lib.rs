// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info};

use config::TokmeterConfig;
use counter::{CounterRouter, CounterSettings};
use registry::{RegistryOptions, RegistryService};

pub mod gateway;
pub mod hub;
pub mod shutdown;
pub mod ws;

pub use gateway::GatewayState;
pub use hub::{ConnectionHub, ConnectionId, ConnectionState, HubError};

pub struct Config {
    /// address for the http api (disabled when `None`)
    pub gateway_socket: Option<SocketAddr>,
    /// address for the live model-list websocket (disabled when `None`)
    pub hub_socket: Option<SocketAddr>,
    pub models_path: PathBuf,
    pub custom_limit: usize,
    pub max_upload_bytes: usize,
    pub counter: CounterSettings,
}

impl Config {
    /// Both listeners enabled, everything else taken from `settings`.
    pub fn from_settings(settings: &TokmeterConfig) -> Result<Self> {
        Ok(Self {
            gateway_socket: Some(settings.gateway_addr()),
            hub_socket: Some(settings.hub_addr()),
            models_path: settings.models_path()?,
            custom_limit: settings.limits.custom_list_limit,
            max_upload_bytes: settings.max_upload_bytes(),
            counter: CounterSettings {
                anthropic_api_key: settings.credentials.anthropic_api_key.clone(),
                google_api_key: settings.credentials.google_api_key.clone(),
                huggingface_token: settings.credentials.huggingface_token.clone(),
                tokenizer_cache_dir: settings.tokenizer_cache_dir()?,
            },
        })
    }
}

pub async fn run(config: Config) -> Result<()> {
    info!("starting tokmeter server; registry at {}", config.models_path.display());

    let registry = RegistryService::open_with(
        &config.models_path,
        RegistryOptions {
            custom_limit: config.custom_limit,
        },
    )?;
    // load (and seed or migrate) up front so storage problems surface at startup
    let models = registry
        .list_models()
        .await
        .context("failed to load model registry")?;
    info!(
        "registry ready: {} official, {} custom",
        models.official.len(),
        models.custom.len()
    );

    let hub = ConnectionHub::new(registry.clone());
    hub.attach();

    if let Some(addr) = config.hub_socket {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind hub socket {addr}"))?;
        info!("model hub websocket listening on {}", addr);
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = ws::serve(listener, hub).await {
                error!("hub server failed on {}: {:?}", addr, e);
            }
        });
    }

    if let Some(addr) = config.gateway_socket {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind gateway socket {addr}"))?;
        info!("http gateway listening on {}", addr);
        let state = GatewayState {
            registry: registry.clone(),
            counter: CounterRouter::new(config.counter),
            max_upload_bytes: config.max_upload_bytes,
        };
        tokio::spawn(async move {
            if let Err(e) = gateway::serve(listener, state).await {
                error!("gateway failed on {}: {:?}", addr, e);
            }
        });
    }

    shutdown::wait_for_signal().await;
    info!("tokmeter server shutting down");
    hub.detach();
    registry.close();

    Ok(())
}
