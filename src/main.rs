mod config;
mod error;
mod flatten;
mod llm_extract;
mod local;
mod server;
mod state;
mod webhooks;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Invoice image extraction API with webhook relay
#[derive(Parser)]
#[command(name = "invoice_relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (missing file means defaults)
    #[arg(short, long, global = true, env = "INVOICE_RELAY_CONFIG", default_value = "invoice_relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve(ServeArgs),

    /// Extract a single invoice image and print the fields
    Extract(local::ExtractArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Bind address, overrides the config file
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Port, overrides the config file
    #[arg(long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env may hold the model credential
    dotenvy::dotenv().ok();

    // init tracing
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut cfg = config::Config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Serve(args) => {
            if let Some(host) = args.host {
                cfg.server.host = host;
            }
            if let Some(port) = args.port {
                cfg.server.port = port;
            }
            info!(
                host = %cfg.server.host,
                port = cfg.server.port,
                model = %cfg.model.model,
                "Starting Invoice Extractor API"
            );
            server::serve(&cfg).await
        }
        Commands::Extract(args) => local::run(&cfg, args).await,
    }
}
