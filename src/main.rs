use anyhow::Result;
use clap::Parser;
use gatekeeper::config::Config;
use gatekeeper::config_validator::ConfigValidator;
use gatekeeper::server::Server;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Admission control service: rate limiting and idempotent replay.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// Address to listen on (overrides BIND_ADDR)
    #[arg(long)]
    bind_addr: Option<SocketAddr>,

    /// Redis URL (overrides REDIS_URL); empty runs on the in-process backend
    #[arg(long)]
    redis_url: Option<String>,

    /// Log level (overrides LOG_LEVEL)
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // Load configuration from environment
    let mut config = Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    if let Some(bind_addr) = cli.bind_addr {
        config.bind_addr = bind_addr;
    }
    if let Some(redis_url) = cli.redis_url {
        config.redis_url = redis_url;
    }
    if let Some(log_level) = cli.log_level {
        config.log_level = log_level;
    }

    ConfigValidator::validate(&config).map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    if cli.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("gatekeeper={},tower_http=debug", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting gatekeeper service");
    tracing::info!(
        bind_addr = %config.bind_addr,
        backend = if config.uses_redis() { "redis" } else { "memory" },
        failure_policy = %config.backend_failure_policy,
        duplicate_in_flight = %config.duplicate_in_flight,
        "Configuration loaded"
    );

    // Create and run the server
    let server = Server::new(config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
