//! switchyard - rate-limit aware request routing for chat-completion APIs
//!
//! Accepts OpenAI-style chat completions and spreads them over a pool of
//! backend targets, honoring each target's rate limits, cost ceiling and
//! error cooldowns.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use switchyard::config::{Config, KeySource};
use switchyard::proxy::run_server;

#[derive(Parser)]
#[command(name = "switchyard")]
#[command(about = "Rate-limit aware request routing for chat-completion APIs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the dispatcher server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Show configured targets and their limits
    Targets {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

fn init_tracing(level: &str) {
    let default_filter = format!("switchyard={level},tower_http={level}");
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load(path: &str) -> anyhow::Result<(Config, Vec<(String, KeySource)>)> {
    Config::from_file_with_env(path).with_context(|| format!("loading configuration from {}", path))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let (mut cfg, key_sources) = load(&config)?;
            init_tracing(&cfg.logging.level);
            tracing::info!(config = %config, "Loaded configuration");

            for (id, source) in &key_sources {
                if *source == KeySource::None {
                    tracing::warn!(target_id = %id, "No API key configured, requests go out unauthenticated");
                } else {
                    tracing::debug!(target_id = %id, source = %source, "Resolved API key");
                }
            }

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                cfg.server.listen = addr;
            }

            run_server(cfg).await
        }

        Commands::Check { config } => {
            let (cfg, key_sources) = load(&config)?;
            println!("Configuration OK: {}", config);
            println!("  listen:      {}", cfg.server.listen);
            println!("  algorithm:   {}", cfg.balancer.algorithm);
            println!("  concurrency: {}", cfg.balancer.concurrency_limit);
            println!("  max wait:    {:.1}s", cfg.balancer.max_wait.as_secs_f64());
            println!("  targets:     {}", cfg.targets.len());
            for (id, source) in key_sources {
                println!("    {:<20} key: {}", id, source);
            }
            if cfg.targets.is_empty() {
                println!("warning: no targets configured, every request will be refused");
            }
            Ok(())
        }

        Commands::Targets { config } => {
            let (cfg, _) = load(&config)?;
            println!(
                "{:<16} {:>6} {:>7} {:>6} {:>9} {:>8}  {}",
                "ID", "WEIGHT", "RPS", "RPM", "TPM", "RETRIES", "ENDPOINT"
            );
            for target in &cfg.targets {
                println!(
                    "{:<16} {:>6} {:>7} {:>6} {:>9} {:>8}  {}",
                    target.id,
                    target.weight,
                    target.rps_limit,
                    target.rpm_limit,
                    target.tpm_limit,
                    target.max_retries,
                    target.endpoint()
                );
            }
            Ok(())
        }
    }
}
