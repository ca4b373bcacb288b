//! Configuration for the dockhand server.
//!
//! Read from `dockhand.toml` when present, then overridden by environment
//! variables, then by CLI flags. Every field has a default, so an empty
//! file (or none at all) is a valid configuration.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 3141
//! db_path = "/var/lib/dockhand/dockhand.db"
//!
//! [auth]
//! admin_token = "change-me"
//!
//! [agents]
//! default_port = 7070
//! request_timeout_secs = 10
//!
//! [log]
//! level = "info"
//! json = true
//! dir = "/var/log/dockhand"
//!
//! [updates]
//! auto_update = true
//! auto_update_interval = 60
//! prune_mode = "dangling"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::updater::{PruneMode, UpdateSettings};

pub const DEFAULT_CONFIG_FILE: &str = "dockhand.toml";

pub const ENV_ADMIN_TOKEN: &str = "DOCKHAND_ADMIN_TOKEN";
pub const ENV_PORT: &str = "DOCKHAND_PORT";
pub const ENV_DB_PATH: &str = "DOCKHAND_DB_PATH";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Permissive CORS for a locally served UI.
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3141,
            db_path: PathBuf::from(".dockhand/dockhand.db"),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsSection {
    /// Port used to reach an agent that never advertised an endpoint.
    pub default_port: u16,
    pub request_timeout_secs: u64,
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            default_port: 7070,
            request_timeout_secs: 10,
        }
    }
}

impl AgentsSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
    pub json: bool,
    /// Directory for daily rolling log files. Stdout only when unset.
    pub dir: Option<PathBuf>,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            dir: None,
        }
    }
}

/// Seed values for the settings table on first start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatesSection {
    pub auto_update: bool,
    pub auto_update_interval: i64,
    pub prune_mode: PruneMode,
}

impl Default for UpdatesSection {
    fn default() -> Self {
        let defaults = UpdateSettings::default();
        Self {
            auto_update: defaults.auto_update,
            auto_update_interval: defaults.auto_update_interval,
            prune_mode: defaults.prune_mode,
        }
    }
}

impl From<&UpdatesSection> for UpdateSettings {
    fn from(section: &UpdatesSection) -> Self {
        Self {
            auto_update: section.auto_update,
            auto_update_interval: section.auto_update_interval,
            prune_mode: section.prune_mode,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockhandConfig {
    pub server: ServerSection,
    pub auth: AuthSection,
    pub agents: AgentsSection,
    pub log: LogSection,
    pub updates: UpdatesSection,
}

impl DockhandConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse dockhand.toml")
    }

    /// An explicit path must exist. Without one, `dockhand.toml` in the
    /// working directory is used if present, otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Apply `DOCKHAND_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(token) = lookup(ENV_ADMIN_TOKEN).filter(|t| !t.is_empty()) {
            self.auth.admin_token = Some(token);
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("{} must be a port number, got {:?}", ENV_PORT, port))?;
        }
        if let Some(db_path) = lookup(ENV_DB_PATH).filter(|p| !p.is_empty()) {
            self.server.db_path = PathBuf::from(db_path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn empty_config_uses_defaults() {
        let config = DockhandConfig::parse("").unwrap();
        assert_eq!(config, DockhandConfig::default());
        assert_eq!(config.server.port, 3141);
        assert_eq!(config.agents.default_port, 7070);
        assert_eq!(config.updates.auto_update_interval, 60);
        assert!(config.auth.admin_token.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = DockhandConfig::parse(
            r#"
[server]
port = 8080

[updates]
auto_update = true
prune_mode = "all"
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(config.updates.auto_update);
        assert_eq!(config.updates.prune_mode, PruneMode::All);
        assert_eq!(config.updates.auto_update_interval, 60);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(DockhandConfig::parse("[server\nport = ").is_err());
        assert!(DockhandConfig::parse("[server]\nport = \"eighty\"").is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dockhand.toml");
        fs::write(&path, "[auth]\nadmin_token = \"abc\"\n[log]\njson = true\n").unwrap();

        let config = DockhandConfig::load(&path).unwrap();
        assert_eq!(config.auth.admin_token.as_deref(), Some("abc"));
        assert!(config.log.json);
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(DockhandConfig::load_or_default(Some(&missing)).is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            (ENV_ADMIN_TOKEN, "from-env"),
            (ENV_PORT, "9999"),
            (ENV_DB_PATH, "/tmp/fleet.db"),
        ]
        .into_iter()
        .collect();
        let mut config = DockhandConfig::parse("[auth]\nadmin_token = \"from-file\"").unwrap();
        config
            .apply_env_from(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.auth.admin_token.as_deref(), Some("from-env"));
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.db_path, PathBuf::from("/tmp/fleet.db"));
    }

    #[test]
    fn bad_port_in_env_is_an_error() {
        let mut config = DockhandConfig::default();
        let err = config
            .apply_env_from(|key| (key == ENV_PORT).then(|| "http".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_PORT));
    }

    #[test]
    fn updates_section_converts_to_settings() {
        let section = UpdatesSection {
            auto_update: true,
            auto_update_interval: 5,
            prune_mode: PruneMode::Dangling,
        };
        let settings = UpdateSettings::from(&section);
        assert!(settings.auto_update);
        assert_eq!(settings.auto_update_interval, 5);
        assert_eq!(settings.prune_mode, PruneMode::Dangling);
    }
}
