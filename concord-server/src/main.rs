use concord_collab::{ServerConfig, SyncServer};
use log::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::from_env()?;
    info!(
        "Starting concord server on {} (capacity {}, retention {}, checkpoint every {})",
        config.bind_addr,
        config.session.capacity,
        config.session.retention_threshold,
        config.session.checkpoint_interval
    );

    SyncServer::new(config).run().await
}
