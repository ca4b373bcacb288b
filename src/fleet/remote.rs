//! Direct HTTP calls into an agent.
//!
//! Everything else reaches agents through the task queue. Stack listing is
//! the exception: it needs the agent to be reachable from the server.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::models::Agent;
use crate::errors::{FleetError, FleetResult};

#[async_trait]
pub trait RemoteStackClient: Send + Sync {
    /// Ask the agent for the compose stacks it is running.
    async fn list_stacks(&self, agent: &Agent) -> FleetResult<Value>;
}

pub struct HttpStackClient {
    client: reqwest::Client,
    default_port: u16,
}

impl HttpStackClient {
    pub fn new(default_port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("dockhand/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build agent HTTP client")?;
        Ok(Self {
            client,
            default_port,
        })
    }

    /// `{endpoint}/stacks`, or `http://{hostname}:{default_port}/stacks` when
    /// the agent never advertised an endpoint.
    pub fn stacks_url(&self, agent: &Agent) -> FleetResult<String> {
        if let Some(endpoint) = agent.endpoint.as_deref().map(str::trim)
            && !endpoint.is_empty()
        {
            return Ok(format!("{}/stacks", endpoint.trim_end_matches('/')));
        }
        if agent.hostname.trim().is_empty() {
            return Err(FleetError::Upstream(format!(
                "Agent {} has no endpoint or hostname",
                agent.id
            )));
        }
        Ok(format!(
            "http://{}:{}/stacks",
            agent.hostname.trim(),
            self.default_port
        ))
    }
}

#[async_trait]
impl RemoteStackClient for HttpStackClient {
    async fn list_stacks(&self, agent: &Agent) -> FleetResult<Value> {
        let url = self.stacks_url(agent)?;
        debug!(agent_id = %agent.id, url = %url, "listing remote stacks");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FleetError::Upstream(format!("GET {} failed: {}", url, e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FleetError::Upstream(format!(
                "GET {} returned {}",
                url, status
            )));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| FleetError::Upstream(format!("Invalid response from {}: {}", url, e)))?;
        Ok(unwrap_stacks(body))
    }
}

/// Agents answer with either a bare array or `{"stacks": [...]}`.
fn unwrap_stacks(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("stacks") => {
            map.remove("stacks").unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::models::AgentStatus;
    use chrono::Utc;
    use serde_json::json;

    fn agent(hostname: &str, endpoint: Option<&str>) -> Agent {
        let now = Utc::now();
        Agent {
            id: "a1".into(),
            hostname: hostname.into(),
            platform: "linux".into(),
            version: "1.0".into(),
            capabilities: vec![],
            endpoint: endpoint.map(String::from),
            status: AgentStatus::Online,
            metrics: None,
            last_seen: Some(now),
            registered_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    fn client() -> HttpStackClient {
        HttpStackClient::new(7070, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn url_prefers_advertised_endpoint() {
        let url = client()
            .stacks_url(&agent("host1", Some("https://agent.example:9000/")))
            .unwrap();
        assert_eq!(url, "https://agent.example:9000/stacks");
    }

    #[test]
    fn url_falls_back_to_hostname_and_default_port() {
        let url = client().stacks_url(&agent("host1", None)).unwrap();
        assert_eq!(url, "http://host1:7070/stacks");
        let url = client().stacks_url(&agent("host1", Some("  "))).unwrap();
        assert_eq!(url, "http://host1:7070/stacks");
    }

    #[test]
    fn url_without_hostname_is_upstream_error() {
        let err = client().stacks_url(&agent("", None)).unwrap_err();
        assert!(matches!(err, FleetError::Upstream(_)));
    }

    #[test]
    fn unwrap_stacks_accepts_both_shapes() {
        assert_eq!(unwrap_stacks(json!([{"name": "web"}])), json!([{"name": "web"}]));
        assert_eq!(
            unwrap_stacks(json!({"stacks": [{"name": "db"}]})),
            json!([{"name": "db"}])
        );
        assert_eq!(unwrap_stacks(json!({"other": 1})), json!({"other": 1}));
    }

    #[tokio::test]
    async fn unreachable_agent_is_upstream_error() {
        // Port 9 on localhost is discard; nothing listens in test environments.
        let err = client()
            .list_stacks(&agent("x", Some("http://127.0.0.1:9")))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Upstream(_)));
    }
}
