//! Agent registry: registration, heartbeats and liveness-annotated reads.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

use super::db::DbHandle;
use super::liveness::{Clock, annotate};
use super::models::{Agent, AgentStatus};
use crate::errors::{FleetError, FleetResult};

/// Fields an agent supplies when it registers.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistration {
    pub id: String,
    pub hostname: String,
    pub platform: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub endpoint: Option<String>,
}

#[derive(Clone)]
pub struct AgentRegistry {
    db: DbHandle,
    clock: Arc<dyn Clock>,
}

impl AgentRegistry {
    pub fn new(db: DbHandle, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Create the agent or refresh an existing record. Re-registration keeps
    /// `created_at` and `registered_at`.
    pub async fn register(&self, registration: AgentRegistration) -> FleetResult<Agent> {
        let id = registration.id.trim().to_string();
        if id.is_empty() {
            return Err(FleetError::validation("agent_id is required"));
        }
        let hostname = registration.hostname.trim().to_string();
        if hostname.is_empty() {
            return Err(FleetError::validation("hostname is required"));
        }
        let now = self.clock.now();

        let (agent, existed) = self
            .db
            .call(move |db| -> FleetResult<(Agent, bool)> {
                let existing = db.get_agent(&id)?;
                let existed = existing.is_some();
                let agent = Agent {
                    id,
                    hostname,
                    platform: registration.platform,
                    version: registration.version,
                    capabilities: normalize_capabilities(registration.capabilities),
                    endpoint: registration
                        .endpoint
                        .filter(|e| !e.trim().is_empty())
                        .or_else(|| existing.as_ref().and_then(|a| a.endpoint.clone())),
                    status: AgentStatus::Online,
                    metrics: existing.as_ref().and_then(|a| a.metrics.clone()),
                    last_seen: Some(now),
                    registered_at: existing.as_ref().map_or(now, |a| a.registered_at),
                    created_at: existing.as_ref().map_or(now, |a| a.created_at),
                    updated_at: now,
                };
                db.upsert_agent(&agent)?;
                Ok((agent, existed))
            })
            .await?;

        info!(
            agent_id = %agent.id,
            hostname = %agent.hostname,
            platform = %agent.platform,
            version = %agent.version,
            reregistered = existed,
            "agent registered"
        );
        Ok(annotate(agent, now))
    }

    /// Record a heartbeat. An unknown id gets a minimal record rather than
    /// an error.
    pub async fn heartbeat(&self, id: &str, metrics: Option<Value>) -> FleetResult<Agent> {
        let id = id.trim().to_string();
        if id.is_empty() {
            return Err(FleetError::validation("agent_id is required"));
        }
        let now = self.clock.now();

        let (agent, created) = self
            .db
            .call(move |db| -> FleetResult<(Agent, bool)> {
                let (mut agent, created) = match db.get_agent(&id)? {
                    Some(agent) => (agent, false),
                    None => (minimal_agent(id, now), true),
                };
                agent.status = AgentStatus::Online;
                agent.last_seen = Some(now);
                agent.updated_at = now;
                agent.metrics = merge_metrics(agent.metrics.take(), metrics);
                db.upsert_agent(&agent)?;
                Ok((agent, created))
            })
            .await?;

        if created {
            info!(agent_id = %agent.id, "heartbeat from unregistered agent, created record");
        } else {
            debug!(agent_id = %agent.id, "heartbeat");
        }
        Ok(annotate(agent, now))
    }

    pub async fn get(&self, id: &str) -> FleetResult<Agent> {
        let id = id.to_string();
        let agent = self
            .db
            .call(move |db| -> FleetResult<Agent> {
                db.get_agent(&id)?
                    .ok_or(FleetError::AgentNotFound { id })
            })
            .await?;
        Ok(annotate(agent, self.clock.now()))
    }

    pub async fn list(&self) -> FleetResult<Vec<Agent>> {
        let agents = self
            .db
            .call(|db| db.list_agents())
            .await?;
        let now = self.clock.now();
        Ok(agents.into_iter().map(|a| annotate(a, now)).collect())
    }
}

fn minimal_agent(id: String, now: DateTime<Utc>) -> Agent {
    Agent {
        id,
        hostname: String::new(),
        platform: String::new(),
        version: String::new(),
        capabilities: Vec::new(),
        endpoint: None,
        status: AgentStatus::Online,
        metrics: None,
        last_seen: Some(now),
        registered_at: now,
        created_at: now,
        updated_at: now,
    }
}

fn normalize_capabilities(capabilities: Vec<String>) -> Vec<String> {
    capabilities
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Shallow-merge two metric objects; anything else is replaced wholesale.
fn merge_metrics(current: Option<Value>, incoming: Option<Value>) -> Option<Value> {
    match (current, incoming) {
        (Some(Value::Object(mut base)), Some(Value::Object(update))) => {
            base.extend(update);
            Some(Value::Object(base))
        }
        (current, None) => current,
        (_, Some(update)) => Some(update),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::db::FleetDb;
    use crate::fleet::liveness::ManualClock;
    use chrono::TimeDelta;
    use serde_json::json;

    fn registry() -> (AgentRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let db = DbHandle::new(FleetDb::new_in_memory().unwrap());
        (AgentRegistry::new(db, clock.clone()), clock)
    }

    fn registration(id: &str, hostname: &str) -> AgentRegistration {
        AgentRegistration {
            id: id.into(),
            hostname: hostname.into(),
            platform: "linux".into(),
            version: "1.2.0".into(),
            capabilities: vec!["docker".into(), "compose".into(), "docker".into()],
            endpoint: None,
        }
    }

    #[tokio::test]
    async fn register_requires_id_and_hostname() {
        let (registry, _) = registry();
        let err = registry.register(registration("", "host1")).await.unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
        let err = registry.register(registration("a1", "  ")).await.unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }

    #[tokio::test]
    async fn register_sets_online_and_dedupes_capabilities() {
        let (registry, clock) = registry();
        let agent = registry.register(registration("a1", "host1")).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Online);
        assert_eq!(agent.last_seen, Some(clock.now()));
        assert_eq!(agent.capabilities, vec!["compose", "docker"]);
    }

    #[tokio::test]
    async fn reregistration_preserves_creation_timestamps() {
        let (registry, clock) = registry();
        let first = registry.register(registration("a1", "host1")).await.unwrap();
        clock.advance(TimeDelta::minutes(30));
        let second = registry.register(registration("a1", "host1-renamed")).await.unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.registered_at, first.registered_at);
        assert_eq!(second.updated_at, clock.now());
        assert_eq!(second.hostname, "host1-renamed");
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_requires_id() {
        let (registry, _) = registry();
        let err = registry.heartbeat(" ", None).await.unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }

    #[tokio::test]
    async fn heartbeat_from_unknown_agent_creates_minimal_record() {
        let (registry, _) = registry();
        let agent = registry.heartbeat("stray", None).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Online);
        assert_eq!(agent.hostname, "");
        assert!(registry.get("stray").await.is_ok());
    }

    #[tokio::test]
    async fn heartbeat_merges_metrics() {
        let (registry, _) = registry();
        registry.register(registration("a1", "host1")).await.unwrap();
        registry
            .heartbeat("a1", Some(json!({"cpu": 10, "mem": 40})))
            .await
            .unwrap();
        let agent = registry.heartbeat("a1", Some(json!({"cpu": 55}))).await.unwrap();
        assert_eq!(agent.metrics, Some(json!({"cpu": 55, "mem": 40})));

        let agent = registry.heartbeat("a1", None).await.unwrap();
        assert_eq!(agent.metrics, Some(json!({"cpu": 55, "mem": 40})));
    }

    #[tokio::test]
    async fn silent_agent_is_listed_offline() {
        let (registry, clock) = registry();
        registry.register(registration("a1", "host1")).await.unwrap();
        registry.heartbeat("a1", Some(json!({"cpu": 10}))).await.unwrap();

        clock.advance(TimeDelta::minutes(6));

        let agents = registry.list().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, "a1");
        assert_eq!(agents[0].status, AgentStatus::Offline);
        assert_eq!(
            registry.get("a1").await.unwrap().status,
            AgentStatus::Offline
        );
    }

    #[tokio::test]
    async fn get_unknown_agent_is_not_found() {
        let (registry, _) = registry();
        let err = registry.get("ghost").await.unwrap_err();
        assert!(matches!(err, FleetError::AgentNotFound { .. }));
    }

    #[test]
    fn merge_metrics_replaces_non_objects() {
        assert_eq!(
            merge_metrics(Some(json!([1, 2])), Some(json!({"cpu": 1}))),
            Some(json!({"cpu": 1}))
        );
        assert_eq!(merge_metrics(None, None), None);
    }
}
