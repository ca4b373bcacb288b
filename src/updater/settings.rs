use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{FleetError, FleetResult};
use crate::fleet::db::DbHandle;

pub const AUTO_UPDATE_KEY: &str = "autoUpdate";
pub const AUTO_UPDATE_INTERVAL_KEY: &str = "autoUpdateInterval";
pub const PRUNE_MODE_KEY: &str = "pruneMode";

pub const DEFAULT_INTERVAL_MINUTES: i64 = 60;
/// One year.
pub const MAX_INTERVAL_MINUTES: i64 = 525_600;

/// Which images to remove after a run that updated something.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneMode {
    #[default]
    None,
    Dangling,
    All,
}

impl PruneMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Dangling => "dangling",
            Self::All => "all",
        }
    }
}

impl std::fmt::Display for PruneMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PruneMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "dangling" => Ok(Self::Dangling),
            "all" => Ok(Self::All),
            _ => Err(format!("Invalid prune mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettings {
    pub auto_update: bool,
    /// Minutes between runs, as stored. Use [`UpdateSettings::interval`].
    pub auto_update_interval: i64,
    pub prune_mode: PruneMode,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            auto_update: false,
            auto_update_interval: DEFAULT_INTERVAL_MINUTES,
            prune_mode: PruneMode::None,
        }
    }
}

impl UpdateSettings {
    /// Run period, clamped to `1..=MAX_INTERVAL_MINUTES` minutes.
    pub fn interval(&self) -> std::time::Duration {
        let minutes = self
            .auto_update_interval
            .clamp(1, MAX_INTERVAL_MINUTES)
            .unsigned_abs();
        std::time::Duration::from_secs(minutes.saturating_mul(60))
    }

    pub fn apply(&mut self, patch: SettingsPatch) -> FleetResult<()> {
        if let Some(interval) = patch.auto_update_interval {
            if !(1..=MAX_INTERVAL_MINUTES).contains(&interval) {
                return Err(FleetError::validation(format!(
                    "autoUpdateInterval must be between 1 and {} minutes",
                    MAX_INTERVAL_MINUTES
                )));
            }
            self.auto_update_interval = interval;
        }
        if let Some(enabled) = patch.auto_update {
            self.auto_update = enabled;
        }
        if let Some(mode) = patch.prune_mode {
            self.prune_mode = mode;
        }
        Ok(())
    }
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default, alias = "auto_update")]
    pub auto_update: Option<bool>,
    #[serde(default, alias = "auto_update_interval")]
    pub auto_update_interval: Option<i64>,
    #[serde(default, alias = "prune_mode")]
    pub prune_mode: Option<PruneMode>,
}

/// Where the scheduler reads its settings from.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> Result<UpdateSettings>;
    async fn save(&self, settings: &UpdateSettings) -> Result<()>;
}

/// Settings kept in the `settings` key/value table.
pub struct DbSettingsStore {
    db: DbHandle,
}

impl DbSettingsStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Write `defaults` for every key not already present. Existing values
    /// are left alone so config never clobbers what an admin saved.
    pub async fn seed(&self, defaults: &UpdateSettings) -> Result<()> {
        let pairs = to_pairs(defaults);
        self.db
            .call(move |db| {
                for (key, value) in pairs {
                    if db.get_setting(key)?.is_none() {
                        db.set_setting(key, &value)?;
                    }
                }
                Ok::<_, anyhow::Error>(())
            })
            .await
    }
}

#[async_trait]
impl SettingsStore for DbSettingsStore {
    async fn load(&self) -> Result<UpdateSettings> {
        let (auto_update, interval, prune_mode) = self
            .db
            .call(|db| {
                Ok::<_, anyhow::Error>((
                    db.get_setting(AUTO_UPDATE_KEY)?,
                    db.get_setting(AUTO_UPDATE_INTERVAL_KEY)?,
                    db.get_setting(PRUNE_MODE_KEY)?,
                ))
            })
            .await?;

        let defaults = UpdateSettings::default();
        Ok(UpdateSettings {
            auto_update: parse_or(AUTO_UPDATE_KEY, auto_update, defaults.auto_update),
            auto_update_interval: parse_or(
                AUTO_UPDATE_INTERVAL_KEY,
                interval,
                defaults.auto_update_interval,
            ),
            prune_mode: parse_or(PRUNE_MODE_KEY, prune_mode, defaults.prune_mode),
        })
    }

    async fn save(&self, settings: &UpdateSettings) -> Result<()> {
        let pairs = to_pairs(settings);
        self.db
            .call(move |db| {
                for (key, value) in pairs {
                    db.set_setting(key, &value)?;
                }
                Ok::<_, anyhow::Error>(())
            })
            .await
    }
}

fn to_pairs(settings: &UpdateSettings) -> [(&'static str, String); 3] {
    [
        (AUTO_UPDATE_KEY, settings.auto_update.to_string()),
        (
            AUTO_UPDATE_INTERVAL_KEY,
            settings.auto_update_interval.to_string(),
        ),
        (PRUNE_MODE_KEY, settings.prune_mode.to_string()),
    ]
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparseable setting, using default");
            default
        }),
    }
}
