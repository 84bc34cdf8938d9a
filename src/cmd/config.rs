use anyhow::Result;
use std::path::Path;

use quadro::config::QuadroConfig;

/// Load the config file (or defaults) and apply `QUADRO_*` overrides.
pub fn load_config(path: &Path) -> Result<QuadroConfig> {
    let mut config = QuadroConfig::load_or_default(path)?;
    config.apply_env()?;
    Ok(config)
}

pub fn cmd_check_config(path: &Path) -> Result<()> {
    if path.exists() {
        println!("Config file: {}", path.display());
    } else {
        println!("No quadro.toml found at {}; using defaults.", path.display());
    }

    let config = load_config(path)?;
    println!("  listen   = {}:{}", config.server.host, config.server.port);
    println!("  database = {}", config.storage.db_path.display());
    println!("  users    = {}", config.auth.users.len());

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("Configuration is valid.");
    } else {
        println!("Configuration warnings:");
        for warning in warnings {
            println!("  - {}", warning);
        }
    }
    Ok(())
}
