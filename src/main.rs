//! Resilience Gateway - CLI Application
//!
//! An API gateway service with:
//! - Route and service configuration via TOML
//! - Circuit breaking, rate limiting and health-checked load balancing
//! - Prometheus metrics and management endpoints

use clap::{Parser, Subcommand};
use resilience_gateway::{config::GatewayConfig, Gateway};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Resilience Gateway - circuit breaking, rate limiting and load balancing in front of backend services
#[derive(Parser)]
#[command(name = "resilience-gateway")]
#[command(version, about = "An API gateway with circuit breaking, rate limiting and load balancing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Validate the configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "config.toml")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { config } => start_server(&config).await?,
        Commands::Validate { config } => validate_config(&config)?,
        Commands::Init { output } => generate_sample_config(&output)?,
    }

    Ok(())
}

/// Start the gateway server
async fn start_server(config_path: &str) -> anyhow::Result<()> {
    // Load configuration
    let config = GatewayConfig::from_file(config_path)?;

    // Setup logging, RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))?;
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    info!("Loaded configuration from {}", config_path);

    let addr: SocketAddr = config.server_addr().parse()?;
    let gateway = Gateway::build(config).await?;
    let tasks = gateway.spawn_background();
    let app = gateway.router();

    // Start server
    info!("Starting gateway server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tasks.shutdown().await;
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Validate configuration file
fn validate_config(config_path: &str) -> anyhow::Result<()> {
    match GatewayConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid!");
            println!();
            println!("Server: {}:{}", config.server.host, config.server.port);
            println!("Services: {}", config.services.len());
            println!("Routes: {}", config.route_count());
            println!("Counter store: {:?}", config.counter_store.backend);
            println!("Load balancing: {:?}", config.load_balancer.strategy);
            println!();
            println!("Services:");
            for service in &config.services {
                println!("  {} ({} targets)", service.name, service.targets.len());
                for target in &service.targets {
                    println!("    {} (weight {})", target.url, target.weight);
                }
            }
            println!();
            println!("Routes:");
            for route in &config.routes {
                let status = if route.enabled { "✓" } else { "✗" };
                println!("  {} {} → {}", status, route.path, route.service);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration is invalid:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}

/// Generate sample configuration file
fn generate_sample_config(output_path: &str) -> anyhow::Result<()> {
    let sample_config = r#"# Resilience Gateway Configuration

[server]
host = "0.0.0.0"
port = 8080
timeout = 30

[metrics]
enabled = true
path = "/metrics"

[health]
enabled = true
path = "/health"
ready_path = "/ready"

[logging]
level = "info"

# Guard for /status and /management/*
[admin]
enabled = true
header_name = "X-Admin-Token"
tokens = ["change-me"]

# Static token authorization for routes with auth_required = true
[auth]
header_name = "Authorization"
tokens = { "demo-token" = "demo-user" }

[rate_limit]
global = { limit = 10000, window_secs = 60 }
per_ip = { limit = 1000, window_secs = 60 }
per_user = { limit = 5000, window_secs = 60 }
per_api_key = { limit = 10000, window_secs = 60 }
per_path = { limit = 2000, window_secs = 60 }
per_method = { limit = 3000, window_secs = 60 }
burst = { limit = 50, window_secs = 1 }
priority_header = "X-Priority"
cleanup_interval_secs = 300

[counter_store]
backend = "memory"  # Options: memory, redis
# redis_url = "redis://127.0.0.1:6379"
key_prefix = "rate_limit"
timeout_ms = 250
fail_open = true

[circuit_breaker]
failure_threshold = 5
success_threshold = 3
open_timeout_secs = 30
# health_failure_threshold = 3

[registry]
health_check_interval_secs = 30
health_check_timeout_ms = 5000

[load_balancer]
strategy = "weighted"  # Options: round_robin, weighted, least_connections

[monitoring]
enabled = true
report_interval_secs = 60

[[services]]
name = "pricing-service"
targets = [
    { name = "pricing-a", url = "http://localhost:3001", weight = 70, retries = 2 },
    { name = "pricing-b", url = "http://localhost:3002", weight = 30, retries = 2 },
]

[services.fallback]
message = "Pricing service temporarily unavailable"
body = { price = 0.0, currency = "USD" }

[[services]]
name = "offer-service"
targets = [{ url = "http://localhost:3003" }]
circuit_breaker = { failure_threshold = 3 }

[[routes]]
path = "/pricing/*"
service = "pricing-service"
methods = ["GET", "POST", "PUT"]
auth_required = true
rate_limit = 100
timeout_ms = 5000
cache = { ttl_secs = 900 }
description = "Pricing routes"

[[routes]]
path = "/offers/*"
service = "offer-service"
methods = ["GET", "POST"]
strip_prefix = true
timeout_ms = 3000
transform = { request_headers = { "X-Gateway" = "resilience" } }
description = "Offer routes"
"#;

    std::fs::write(output_path, sample_config)?;
    println!("Sample configuration written to {}", output_path);
    Ok(())
}
