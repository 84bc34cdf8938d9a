//! Configuration for the quadro server, read from `.quadro/quadro.toml`.
//!
//! Layered: file → environment → CLI flags. Every section falls back to
//! defaults, so an empty file (or no file) is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! dev_mode = false
//!
//! [storage]
//! db_path = ".quadro/quadro.db"
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//!
//! [[auth.users]]
//! name = "ana"
//! role = "admin"
//! token = "change-me"
//!
//! [auth.roles.member]
//! tickets = ["read", "write", "delete"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::board::auth::{Permission, Role};

/// Directory holding the config file and, by default, the database.
pub const CONFIG_DIR: &str = ".quadro";
pub const CONFIG_FILE: &str = "quadro.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Enables permissive CORS for a locally served front-end.
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3141,
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub db_path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(CONFIG_DIR).join("quadro.db"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directive, e.g. `info` or `quadro=debug,tower_http=info`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// A user allowed to call the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub role: String,
    /// Bearer token presented in the `Authorization` header.
    pub token: String,
}

/// Replacement permission table for one role. Modules left out keep the
/// built-in grants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleGrants {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boards: Option<Vec<Permission>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tickets: Option<Vec<Permission>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<Permission>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub users: Vec<UserConfig>,
    /// Keyed by role name.
    pub roles: BTreeMap<String, RoleGrants>,
}

/// The complete quadro.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuadroConfig {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub logging: LoggingSection,
    pub auth: AuthSection,
}

impl QuadroConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse quadro.toml")
    }

    /// Load from `path`, or return the defaults if the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating its directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize quadro.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `QUADRO_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("QUADRO_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("QUADRO_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid QUADRO_PORT '{}'", port))?;
        }
        if let Some(path) = lookup("QUADRO_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Some(level) = lookup("QUADRO_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.auth.users.is_empty() {
            warnings.push("No users configured: every API request will be rejected".to_string());
        }

        let mut tokens = HashSet::new();
        for (i, user) in self.auth.users.iter().enumerate() {
            if user.name.trim().is_empty() {
                warnings.push(format!("User #{} has an empty name", i + 1));
            }
            if Role::from_str(&user.role).is_err() {
                warnings.push(format!("User '{}' has unknown role '{}'", user.name, user.role));
            }
            if user.token.trim().is_empty() {
                warnings.push(format!("User '{}' has an empty token", user.name));
            } else if !tokens.insert(user.token.as_str()) {
                warnings.push(format!("User '{}' reuses another user's token", user.name));
            }
        }

        for role in self.auth.roles.keys() {
            if Role::from_str(role).is_err() {
                warnings.push(format!("Permission table for unknown role '{}'", role));
            }
        }

        if self.server.port == 0 {
            warnings.push("Port 0 binds a random port".to_string());
        }

        warnings
    }
}

/// Default config file location relative to `base`.
pub fn default_config_path(base: &Path) -> PathBuf {
    base.join(CONFIG_DIR).join(CONFIG_FILE)
}
