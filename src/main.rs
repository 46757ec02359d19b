// # Remora Server
//
// Main entry point for the remote-access server. Hosts the in-memory engine
// behind the remote layer and serves sessions until interrupted.

use remora::engine::mem::MemDatabase;
use remora::engine::Database as EngineDatabase;
use remora::{Result, Server, ServerConfig, VERSION};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    print_banner();

    let config = load_config();
    info!("Initializing Remora server");
    info!("Version: {}", VERSION);
    info!("Listen address: {}", config.listen_addr);
    info!(
        "Auth tokens configured: {}",
        if config.tokens.is_empty() {
            "none (unauthenticated accept)".to_string()
        } else {
            config.tokens.len().to_string()
        }
    );

    let engine: Arc<dyn EngineDatabase> = Arc::new(MemDatabase::new());
    let server = match Server::bind(engine, config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to bind: {}", e);
            return Err(e);
        }
    };
    info!("Serving on {}", server.local_addr());

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down");
    server.shutdown().await;
    Ok(())
}

/// Load the server configuration from `remora.json` in the working
/// directory, falling back to defaults.
fn load_config() -> ServerConfig {
    let path = std::path::Path::new("remora.json");
    if let Ok(raw) = std::fs::read_to_string(path) {
        match serde_json::from_str(&raw) {
            Ok(config) => {
                info!("Loaded configuration from {}", path.display());
                return config;
            }
            Err(e) => {
                error!("Ignoring malformed {}: {}", path.display(), e);
            }
        }
    }
    ServerConfig::default().with_listen_addr("127.0.0.1:9206")
}

fn print_banner() {
    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║                     Remora Server                        ║");
    println!("║      Remote access layer for the key-value engine        ║");
    println!("╚══════════════════════════════════════════════════════════╝");
    println!();
}
