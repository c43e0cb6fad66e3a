use std::sync::Arc;

use collab_sync::auth::{AccessValidator, JwtIdentityService, TenantAuthorizer};
use collab_sync::config::ServerConfig;
use collab_sync::registry::ConnectionRegistry;
use collab_sync::server::SyncServer;
use collab_sync::service::SyncService;
use collab_sync::storage::{RocksPersistence, Store, StoreConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::from_env()?;
    let secret = config
        .jwt_secret
        .clone()
        .ok_or("COLLAB_JWT_SECRET must be set")?;
    let validator = AccessValidator::new(
        Arc::new(JwtIdentityService::new(secret.as_bytes())),
        Arc::new(TenantAuthorizer),
    );

    let service = match &config.storage_path {
        Some(path) => {
            let store = Arc::new(Store::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?);
            log::info!("Using RocksDB storage at {}", path.display());
            SyncService::new(
                config.clone(),
                validator,
                ConnectionRegistry::new(store.clone()),
                Arc::new(RocksPersistence::new(store)),
            )
        }
        None => {
            log::warn!("COLLAB_STORAGE_PATH not set, documents are kept in memory only");
            SyncService::in_memory(config.clone(), validator)
        }
    };
    let service = Arc::new(service);
    service.start().await?;

    let server = SyncServer::new(service.clone());
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => log::info!("Interrupted"),
    }

    service.shutdown().await;
    Ok(())
}
