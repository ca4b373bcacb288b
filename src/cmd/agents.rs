//! `dockhand agents`: offline view of the registry.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use dockhand::fleet::db::DbHandle;
use dockhand::fleet::liveness::SystemClock;
use dockhand::fleet::models::Agent;
use dockhand::fleet::registry::AgentRegistry;
use dockhand::fleet::server::open_db;

pub async fn cmd_agents(db_path: &Path) -> Result<()> {
    let db = DbHandle::new(open_db(db_path)?);
    let registry = AgentRegistry::new(db, Arc::new(SystemClock));
    let agents = registry.list().await?;

    if agents.is_empty() {
        println!("No agents registered.");
        return Ok(());
    }

    println!(
        "{:<24} {:<24} {:<8} {:<10} LAST SEEN",
        "ID", "HOSTNAME", "STATUS", "VERSION"
    );
    for agent in &agents {
        println!("{}", format_row(agent));
    }
    println!("\n{} agent(s)", agents.len());
    Ok(())
}

fn format_row(agent: &Agent) -> String {
    let last_seen = agent
        .last_seen
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string());
    format!(
        "{:<24} {:<24} {:<8} {:<10} {}",
        agent.id, agent.hostname, agent.status, agent.version, last_seen
    )
}
