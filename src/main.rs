// src/main.rs
use anyhow::Result;
use tracing::info;

use harmonyd::config::{self, Config};
use harmonyd::server::ServerBuilder;
use harmonyd::session::ConnectionLogger;

fn main() {
    // the single place allowed to terminate the process on error
    if let Err(err) = run() {
        eprintln!("harmonyd: fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("harmonyd=debug".parse()?),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            config::load_config(&path)?
        }
        None => {
            info!("No config file given, using defaults");
            Config::default()
        }
    };

    let server = ServerBuilder::new(config)
        .with_handler(ConnectionLogger::new())
        .bind()?;

    info!(
        port = server.bound_port(),
        listeners = server.listener_count(),
        "Starting harmonyd"
    );

    server.serve()
}
