use anyhow::Result;

use quadro::board::server::{ServerConfig, start_server};
use quadro::config::QuadroConfig;

pub async fn cmd_serve(config: QuadroConfig) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("config: {}", warning);
    }
    start_server(ServerConfig::from_config(&config)).await
}
