//! `media-sync serve`.

use anyhow::Result;
use std::sync::Arc;

use media_sync::config::MediaSyncConfig;
use media_sync::web::{ServerConfig, start_server};

pub async fn cmd_serve(config: Arc<MediaSyncConfig>, dev: bool) -> Result<()> {
    let server = ServerConfig::from_config(&config, dev);
    start_server(config, server).await
}
