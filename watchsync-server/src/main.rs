//! watchsync server: the room synchronization engine behind a WebSocket
//! listener.
//!
//! Configuration comes from the environment (and `.env`), see [`config`].

mod config;
mod seed;

use std::sync::Arc;

use log::{error, info};
use tokio::signal;
use watchsync_collab::{
    MemoryStore, PersistenceGateway, RoomStore, StoreConfig, SyncEngine, SyncServer,
};

use crate::config::Config;
use crate::seed::SeedFile;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting watchsync server v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn PersistenceGateway> = match &config.storage_path {
        Some(path) => match RoomStore::open(StoreConfig::new(path)) {
            Ok(store) => {
                info!("Using RocksDB storage at {:?}", path);
                Arc::new(store)
            }
            Err(e) => {
                error!("Failed to open storage at {:?}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => {
            info!("STORAGE_PATH not set, keeping rooms in memory");
            Arc::new(MemoryStore::new())
        }
    };

    if let Some(path) = &config.seed_file {
        let seeded = match SeedFile::load(path) {
            Ok(seed) => seed.apply(store.as_ref()).await,
            Err(e) => Err(e),
        };
        match seeded {
            Ok(created) => info!("Seeded {} room(s) from {:?}", created, path),
            Err(e) => {
                error!("Failed to seed from {:?}: {}", path, e);
                std::process::exit(1);
            }
        }
    }

    let engine = Arc::new(SyncEngine::new(config.engine_config(), store));
    let server = SyncServer::new(config.server_config(), engine);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {}
    }

    let flushed = server.engine().flush_pending().await;
    if flushed > 0 {
        info!("Flushed {} pending room snapshot(s)", flushed);
    }

    let stats = server.stats().await;
    info!(
        "Server stopped after {} connection(s), {} message(s)",
        stats.total_connections, stats.total_messages
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
