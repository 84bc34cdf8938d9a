use anyhow::Result;
use std::path::{Path, PathBuf};

use quadro::board::server::open_database;
use quadro::config::{QuadroConfig, UserConfig};

/// Write a default config with one admin user (if none exists) and create
/// the database.
pub fn cmd_init(config_path: &Path, db_path: Option<PathBuf>) -> Result<()> {
    let mut config = if config_path.exists() {
        println!("quadro.toml already exists at {}", config_path.display());
        QuadroConfig::load(config_path)?
    } else {
        let mut config = QuadroConfig::default();
        let token = uuid::Uuid::new_v4().simple().to_string();
        config.auth.users.push(UserConfig {
            name: "admin".to_string(),
            role: "admin".to_string(),
            token: token.clone(),
        });
        if let Some(db_path) = &db_path {
            config.storage.db_path = db_path.clone();
        }
        config.save(config_path)?;
        println!("Created quadro.toml at {}", config_path.display());
        println!("Admin token: {}", token);
        config
    };

    if let Some(db_path) = db_path {
        config.storage.db_path = db_path;
    }
    open_database(&config.storage.db_path)?;
    println!("Database initialized at {}", config.storage.db_path.display());
    Ok(())
}
