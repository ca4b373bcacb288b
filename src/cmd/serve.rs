//! `dockhand serve`.

use anyhow::Result;

use dockhand::config::DockhandConfig;
use dockhand::fleet::db::DbHandle;
use dockhand::fleet::server::{ServerConfig, open_db, start_server};
use dockhand::updater::{DbSettingsStore, UpdateSettings};

pub async fn cmd_serve(config: DockhandConfig, init: bool) -> Result<()> {
    if init {
        // Just initialize the database and seed settings
        let db = DbHandle::new(open_db(&config.server.db_path)?);
        DbSettingsStore::new(db)
            .seed(&UpdateSettings::from(&config.updates))
            .await?;
        println!(
            "Dockhand database initialized at {}",
            config.server.db_path.display()
        );
        return Ok(());
    }

    start_server(ServerConfig::from(&config)).await
}
