//! genia-relay - streaming chat relay with ordered provider fallback
//!
//! Forwards chat requests to Mistral, OpenAI and Anthropic in priority
//! order and always answers with a complete event stream.

use clap::{Parser, Subcommand};
use genia_relay::config::{Config, KeySource};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "genia-relay")]
#[command(about = "Streaming chat relay with ordered provider fallback")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server
    Serve {
        /// Path to configuration file (built-in providers when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration and report where each API key comes from
    Check {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show providers in priority order
    Providers {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<(Config, Vec<(String, KeySource)>)> {
    let loaded = match path {
        Some(path) => Config::from_file_with_env(path)?,
        None => Config::from_env()?,
    };
    Ok(loaded)
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("genia_relay={level},tower_http={level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let (mut config, key_sources) = load_config(config.as_ref())?;
            init_tracing(&config.logging.level);

            for (name, source) in &key_sources {
                tracing::info!(provider = %name, key_source = %source, "Resolved API key");
            }
            if config.providers.is_empty() {
                tracing::warn!("No providers declared, every request will be answered in degraded mode");
            } else if config.configured_providers().next().is_none() {
                tracing::warn!("No provider has an API key, every request will be answered in degraded mode");
            }

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                config.server.listen = addr;
            }

            genia_relay::relay::run_server(config).await
        }

        Commands::Check { config } => {
            let (config, key_sources) = load_config(config.as_ref())?;

            println!("Configuration OK");
            println!("  listen: {}", config.server.listen);
            println!(
                "  request timeout: {}s, idle timeout: {}s",
                config.relay.request_timeout_secs, config.relay.idle_timeout_secs
            );
            for (name, source) in &key_sources {
                println!("  {}: key from {}", name, source);
            }
            if config.configured_providers().next().is_none() {
                println!("  warning: no provider has an API key");
            }
            Ok(())
        }

        Commands::Providers { config } => {
            let (config, _) = load_config(config.as_ref())?;

            for (priority, provider) in config.providers.iter().enumerate() {
                println!(
                    "{}. {} ({}) model={} url={} [{}]",
                    priority + 1,
                    provider.name,
                    provider.format.as_str(),
                    provider.model,
                    provider.url,
                    if provider.is_configured() {
                        "configured"
                    } else {
                        "not configured"
                    }
                );
            }
            Ok(())
        }
    }
}
