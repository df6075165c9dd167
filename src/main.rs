use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use bridge_protocol::{ApiSpecification, EndpointGroup};
use clap::{Args, Parser, Subcommand};
use pipeline_bridge::{
    config::{BridgeConfig, ConfigManager, EnvConfigManager},
    context::BridgeContext,
    graph::InMemoryGraph,
    logger::init_tracing,
    notification::TracingNotifier,
    schema::write_schema,
};
use tracing::{error, info};
use url::Url;

#[derive(Parser, Debug)]
#[command(
    name = "pipeline_bridge",
    about = "JSON-RPC bridge between the pipeline editor and external applications",
    version
)]
struct Cli {
    /// `.env` file to load before reading the environment
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to a backend and keep the connection alive until Ctrl-C
    Run(RunArgs),

    /// Load and compile an API specification document
    CheckSpec(CheckSpecArgs),

    /// Emit JSON-Schema of the payload types
    Schema(SchemaArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Backend WebSocket URL, overrides PIPELINE_BACKEND_URL
    #[arg(long)]
    backend_url: Option<Url>,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Args, Debug)]
struct CheckSpecArgs {
    /// Document to check; the bundled one when omitted
    file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    #[arg(long, default_value = "./schemas")]
    out_dir: PathBuf,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_mgr = ConfigManager(EnvConfigManager::new(cli.env_file));
    let mut config = BridgeConfig::load(&config_mgr).await?;

    match cli.command {
        Commands::Run(args) => {
            if let Some(url) = args.backend_url {
                config.backend_url = Some(url);
            }
            if let Some(level) = args.log_level {
                config.log_level = level;
            }
            run(config).await
        }
        Commands::CheckSpec(args) => {
            let spec = match args.file.or(config.api_specification) {
                Some(path) => ApiSpecification::from_path(&path)
                    .with_context(|| format!("checking {}", path.display()))?,
                None => ApiSpecification::bundled()?,
            };
            println!(
                "✅ specification {} is valid: {} frontend, {} backend, {} external endpoints",
                spec.version().unwrap_or("(unversioned)"),
                spec.group(EndpointGroup::Frontend).len(),
                spec.group(EndpointGroup::Backend).len(),
                spec.group(EndpointGroup::External).len(),
            );
            Ok(())
        }
        Commands::Schema(args) => {
            let n = write_schema(&args.out_dir)?;
            println!("{n} schemas written to {}", args.out_dir.display());
            Ok(())
        }
    }
}

async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let _guards = init_tracing(&config.log_level, config.log_dir.as_deref())?;

    if config.backend_url.is_none() {
        error!("no backend URL configured; set PIPELINE_BACKEND_URL or pass --backend-url");
        anyhow::bail!("no backend URL configured");
    }

    let ctx = BridgeContext::build(config, InMemoryGraph::new(), Arc::new(TracingNotifier))?;
    ctx.start();
    info!(window = %ctx.window_id, "pipeline bridge running; press Ctrl-C to exit");

    tokio::signal::ctrl_c().await?;

    info!("pipeline bridge shutting down");
    ctx.shutdown();
    Ok(())
}
