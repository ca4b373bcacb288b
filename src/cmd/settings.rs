//! `dockhand settings`: read or change auto-update settings in the
//! database. A running server picks up changes on restart or on the next
//! `PUT /api/settings`.

use std::path::Path;

use anyhow::Result;

use dockhand::fleet::db::DbHandle;
use dockhand::fleet::server::open_db;
use dockhand::updater::{DbSettingsStore, SettingsPatch, SettingsStore};

pub async fn cmd_settings(db_path: &Path, patch: SettingsPatch) -> Result<()> {
    let store = DbSettingsStore::new(DbHandle::new(open_db(db_path)?));
    let mut settings = store.load().await?;

    let changing = patch.auto_update.is_some()
        || patch.auto_update_interval.is_some()
        || patch.prune_mode.is_some();
    if changing {
        settings.apply(patch)?;
        store.save(&settings).await?;
        println!("Settings updated.");
    }

    println!("auto_update          = {}", settings.auto_update);
    println!("auto_update_interval = {} min", settings.auto_update_interval);
    println!("prune_mode           = {}", settings.prune_mode);
    Ok(())
}
