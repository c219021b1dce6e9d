use anyhow::Result;
use tracing::{error, info};

use dropbox_garmin_sync::common::config::Config;
use dropbox_garmin_sync::common::garmin_client::{GarminClient, GarminConnection};
use dropbox_garmin_sync::common::logging::init_logging;
use dropbox_garmin_sync::dropbox_session::{DropboxSessionManager, StdinPrompt};
use dropbox_garmin_sync::garmin_session::GarminSessionManager;
use dropbox_garmin_sync::pipeline::SyncPipeline;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();
    let _log_guard = init_logging(&config.log_dir)?;

    let dropbox = DropboxSessionManager::from_config(&config)
        .inspect_err(|e| error!("Dropbox setup failed: {}", e))?
        .connect(&StdinPrompt)
        .await
        .inspect_err(|e| error!("Failed to connect to Dropbox: {}", e))?;

    let garmin_client = GarminClient::new(config.garmin_is_cn)
        .inspect_err(|e| error!("Failed to create Garmin client: {}", e))?;
    let garmin_session = GarminSessionManager::from_config(&config)
        .establish(&garmin_client)
        .await
        .inspect_err(|_| error!("Failed to initialize Garmin API."))?;
    let garmin = GarminConnection::new(garmin_client, garmin_session);

    SyncPipeline::new(&dropbox, &garmin, &config).run().await?;
    info!("Sync run complete");

    Ok(())
}
