//! Serve the `ferry-web` HTTP proxy.
//!
//! ```sh
//! FERRY_API_KEY=... ferry-web --port 3001
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use ferry::prelude::*;
use ferry_web::{DEFAULT_BODY_LIMIT, WebConfig, spawn_web};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Serve the generation proxy over HTTP.
#[derive(Parser)]
#[command(name = "ferry-web", version)]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on
    #[arg(long, default_value_t = 3001)]
    port: u16,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Largest accepted request body in bytes
    #[arg(long, default_value_t = DEFAULT_BODY_LIMIT)]
    body_limit: usize,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("FERRY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match FerryConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {e}");
                process::exit(1);
            }
        },
        None => FerryConfig::from_env(),
    };

    // The key is resolved per request, so a missing one is only a warning here.
    if std::env::var(&config.api_key_env).map_or(true, |v| v.is_empty()) {
        tracing::warn!(var = %config.api_key_env, "API key is not set; requests will fail");
    }

    let assistant = Assistant::new(HttpBackendFactory::new(config.backend_config()))
        .with_policy(config.retry_policy())
        .with_status_handler(LoggingStatus);

    let web = WebConfig {
        bind_addr: SocketAddr::new(args.host, args.port),
        body_limit: args.body_limit,
    };
    let addr = match spawn_web(Arc::new(assistant), web).await {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Error: failed to bind {}:{}: {e}", args.host, args.port);
            process::exit(1);
        }
    };
    println!("Listening on http://{addr}");

    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutting down");
    }
}
