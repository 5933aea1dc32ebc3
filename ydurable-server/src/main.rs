//! ydurable server: durable collaborative documents over WebSocket.
//!
//! Usage: `ydurable-server [bind_addr]`
//!
//! `YDURABLE_CONFIG` may name a JSON file with a `ServerConfig`; missing
//! fields keep their defaults. `RUST_LOG` controls log verbosity.

use log::info;
use std::error::Error;
use std::path::Path;

use ydurable_collab::server::{ServerConfig, SyncServer};

const CONFIG_ENV: &str = "YDURABLE_CONFIG";

fn load_config() -> Result<ServerConfig, Box<dyn Error>> {
    let mut config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => {
            let path = Path::new(&path);
            info!("Loading config from {}", path.display());
            serde_json::from_str(&std::fs::read_to_string(path)?)?
        }
        None => ServerConfig::default(),
    };
    if let Some(bind_addr) = std::env::args().nth(1) {
        config.bind_addr = bind_addr;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = load_config()?;
    match &config.storage_path {
        Some(path) => info!("Starting ydurable server (RocksDB at {})", path.display()),
        None => info!("Starting ydurable server (in-memory storage)"),
    }

    let server = SyncServer::new(config)?;
    server.run().await?;
    Ok(())
}
