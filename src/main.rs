//! genrelay - Multi-backend text generation relay
//!
//! A small HTTP service that forwards questions to hosted language-model
//! backends, retrying and failing over between them, and returns cleaned
//! answers.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use genrelay::catalog::BackendCatalog;
use genrelay::config::{Config, KeySource};

#[derive(Parser)]
#[command(name = "genrelay")]
#[command(about = "Multi-backend text generation relay with failover")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server
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

    /// Show the backend catalog in dispatch order
    Backends {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

impl Commands {
    fn config_path(&self) -> &str {
        match self {
            Commands::Serve { config, .. }
            | Commands::Check { config }
            | Commands::Backends { config } => config,
        }
    }
}

/// Load the config file, falling back to defaults when it does not exist.
fn load_config(path: &str) -> anyhow::Result<(Config, KeySource)> {
    if std::path::Path::new(path).exists() {
        Ok(Config::from_file_with_env(path)?)
    } else {
        Ok(Config::parse_str_with_env("")?)
    }
}

fn init_tracing(level: &str) {
    let default_filter = format!("genrelay={level},tower_http={level}");
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = cli.command.config_path().to_string();
    let loaded = load_config(&path);

    let level = loaded
        .as_ref()
        .map(|(config, _)| config.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_tracing(&level);

    let (mut config, key_source) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            tracing::error!(config = %path, error = %e, "Failed to load configuration");
            return Err(e);
        }
    };

    match cli.command {
        Commands::Serve { listen, .. } => {
            tracing::info!(config = %path, key_source = %key_source, "Configuration loaded");

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                config.server.listen = addr;
            }

            genrelay::proxy::run_server(config).await
        }

        Commands::Check { .. } => {
            let catalog = BackendCatalog::from_config(&config.backends);
            println!("Configuration OK: {}", path);
            println!("  listen:      {}", config.server.listen);
            println!("  upstream:    {}", config.upstream.base_url);
            println!("  credential:  {}", key_source);
            println!("  backends:    {}", catalog.len());
            println!(
                "  rate limit:  {} requests / {}ms",
                config.rate_limit.quota, config.rate_limit.window_ms
            );
            if matches!(key_source, KeySource::None) {
                println!("  warning:     no credential, /generate will answer 503");
            }
            Ok(())
        }

        Commands::Backends { .. } => {
            let catalog = BackendCatalog::from_config(&config.backends);
            println!(
                "{:<4} {:<40} {:<18} {:<20} {:>6} {:>6} {:>6}",
                "#", "backend", "template", "extraction", "tokens", "temp", "top_p"
            );
            for backend in catalog.iter() {
                println!(
                    "{:<4} {:<40} {:<18} {:<20} {:>6} {:>6.2} {:>6.2}",
                    backend.priority_rank,
                    backend.id,
                    backend.template.as_str(),
                    backend.extraction.as_str(),
                    backend.parameters.max_new_tokens,
                    backend.parameters.temperature,
                    backend.parameters.top_p,
                );
            }
            Ok(())
        }
    }
}
