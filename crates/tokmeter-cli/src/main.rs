// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use config::TokmeterConfig;
use counter::{pricing, CounterRouter};
use protocol::{Category, ModelKind};
use registry::{RegistryOptions, RegistryService};

#[derive(Parser)]
#[command(name = "tokmeter", version, about = "token counter with a shared model registry")]
struct Cli {
    /// optional path to a config file (applies to all subcommands)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// run the http gateway and the live model-list websocket
    Serve(ServeOpts),

    /// inspect or edit the model registry
    #[command(subcommand)]
    Models(ModelsCommand),

    /// count the tokens of a text or document
    Count(CountOpts),

    /// show input pricing and context window for a model
    Pricing {
        model: String,
    },
}

#[derive(Parser, Debug)]
struct ServeOpts {
    /// override the http gateway address
    #[arg(long)]
    gateway_socket: Option<SocketAddr>,

    /// override the model hub websocket address
    #[arg(long)]
    hub_socket: Option<SocketAddr>,

    /// do not start the model hub websocket
    #[arg(long)]
    no_hub: bool,
}

#[derive(Subcommand, Debug)]
enum ModelsCommand {
    /// print official and top custom models
    List {
        /// print the raw json list instead of a table
        #[arg(long)]
        json: bool,
    },
    /// record a usage of a model (adds it if new)
    Add {
        name: String,
        #[arg(long, default_value = "custom")]
        category: Category,
    },
}

#[derive(Parser, Debug)]
struct CountOpts {
    #[arg(long)]
    model: String,

    /// commercial or huggingface
    #[arg(long, default_value = "commercial")]
    kind: ModelKind,

    #[command(flatten)]
    input: CountInput,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct CountInput {
    /// literal text to count
    #[arg(long)]
    text: Option<String>,

    /// .pdf, .docx, .txt or .md document to count
    #[arg(long)]
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    util::logging::init_tracing();

    let cli = Cli::parse();
    let settings = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve(opts) => {
            info!("starting tokmeter: {:?}", opts);
            let mut config = server::Config::from_settings(&settings)?;
            if let Some(addr) = opts.gateway_socket {
                config.gateway_socket = Some(addr);
            }
            if let Some(addr) = opts.hub_socket {
                config.hub_socket = Some(addr);
            }
            if opts.no_hub {
                config.hub_socket = None;
            }
            server::run(config).await?;
        }
        Commands::Models(cmd) => run_models(&settings, cmd).await?,
        Commands::Count(opts) => run_count(&settings, opts).await?,
        Commands::Pricing { model } => {
            let info = pricing::pricing_info(&model);
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}

fn open_registry(settings: &TokmeterConfig) -> Result<RegistryService> {
    let path = settings.models_path()?;
    let registry = RegistryService::open_with(
        &path,
        RegistryOptions {
            custom_limit: settings.limits.custom_list_limit,
        },
    )?;
    Ok(registry)
}

async fn run_models(settings: &TokmeterConfig, cmd: ModelsCommand) -> Result<()> {
    let registry = open_registry(settings)?;
    match cmd {
        ModelsCommand::List { json } => {
            let list = registry.list_models().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&list)?);
                return Ok(());
            }
            let snapshot = registry.snapshot().await?;
            println!("official:");
            for entry in &snapshot.official {
                println!("  {:<48} {:>6}", entry.name, entry.usage_count);
            }
            println!("custom (top {}):", registry.options().custom_limit);
            for entry in snapshot.custom.iter().take(registry.options().custom_limit) {
                println!("  {:<48} {:>6}", entry.name, entry.usage_count);
            }
        }
        ModelsCommand::Add { name, category } => {
            let outcome = registry.add_model(&name, category).await?;
            let verb = if outcome.is_new { "added" } else { "bumped" };
            println!("{verb} {} model {}", category, name.trim().to_lowercase());
        }
    }
    registry.close();
    Ok(())
}

async fn run_count(settings: &TokmeterConfig, opts: CountOpts) -> Result<()> {
    let text = match (opts.input.text, opts.input.file) {
        (Some(text), None) => text,
        (None, Some(path)) => read_document(&path, settings.max_upload_bytes())?,
        _ => bail!("exactly one of --text or --file is required"),
    };

    let server_config = server::Config::from_settings(settings)?;
    let router = CounterRouter::new(server_config.counter);
    let response = router.count(&opts.model, &text, opts.kind).await?;

    let registry = open_registry(settings)?;
    registry
        .add_model(&response.model, opts.kind.category())
        .await?;
    registry.close();

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn read_document(path: &Path, max_bytes: usize) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    Ok(extract::extract_text(&bytes, filename, max_bytes)?)
}
