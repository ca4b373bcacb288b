//! Agent liveness.
//!
//! Agents never hold a connection open, so "online" is a claim that decays:
//! an agent is online only if it said so and was heard from within
//! [`LIVENESS_TIMEOUT`]. Every read path runs agents through [`annotate`].

use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};

use super::models::{Agent, AgentStatus};

/// How long an agent may stay silent before it is treated as offline.
pub const LIVENESS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Source of "now". Injected everywhere liveness or timestamps matter.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Effective status of `agent` at `now`.
pub fn effective_status(agent: &Agent, now: DateTime<Utc>) -> AgentStatus {
    let Some(last_seen) = agent.last_seen else {
        return AgentStatus::Offline;
    };
    let silent_ms = (now - last_seen).num_milliseconds();
    if silent_ms > LIVENESS_TIMEOUT.as_millis() as i64 {
        AgentStatus::Offline
    } else {
        agent.status
    }
}

pub fn is_online(agent: &Agent, now: DateTime<Utc>) -> bool {
    effective_status(agent, now) == AgentStatus::Online
}

/// Replace the stored status with the effective one.
pub fn annotate(mut agent: Agent, now: DateTime<Utc>) -> Agent {
    agent.status = effective_status(&agent, now);
    agent
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(status: AgentStatus, last_seen: Option<DateTime<Utc>>) -> Agent {
        let t = Utc::now();
        Agent {
            id: "a1".into(),
            hostname: "host1".into(),
            platform: "linux".into(),
            version: "1.0.0".into(),
            capabilities: vec![],
            endpoint: None,
            status,
            metrics: None,
            last_seen,
            registered_at: t,
            created_at: t,
            updated_at: t,
        }
    }

    #[test]
    fn no_last_seen_is_offline() {
        let a = agent(AgentStatus::Online, None);
        assert_eq!(effective_status(&a, Utc::now()), AgentStatus::Offline);
    }

    #[test]
    fn stale_agent_is_offline_despite_stored_online() {
        let now = Utc::now();
        let a = agent(AgentStatus::Online, Some(now - TimeDelta::minutes(6)));
        assert_eq!(effective_status(&a, now), AgentStatus::Offline);
    }

    #[test]
    fn recent_agent_keeps_reported_status() {
        let now = Utc::now();
        let a = agent(AgentStatus::Online, Some(now - TimeDelta::seconds(30)));
        assert_eq!(effective_status(&a, now), AgentStatus::Online);

        let b = agent(AgentStatus::Offline, Some(now));
        assert_eq!(effective_status(&b, now), AgentStatus::Offline);
    }

    #[test]
    fn exactly_at_timeout_is_still_online() {
        let now = Utc::now();
        let a = agent(AgentStatus::Online, Some(now - TimeDelta::minutes(5)));
        assert_eq!(effective_status(&a, now), AgentStatus::Online);

        let b = agent(
            AgentStatus::Online,
            Some(now - TimeDelta::minutes(5) - TimeDelta::milliseconds(1)),
        );
        assert_eq!(effective_status(&b, now), AgentStatus::Offline);
    }

    #[test]
    fn annotate_overwrites_stored_status() {
        let now = Utc::now();
        let a = annotate(
            agent(AgentStatus::Online, Some(now - TimeDelta::hours(1))),
            now,
        );
        assert_eq!(a.status, AgentStatus::Offline);
    }

    #[test]
    fn manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(TimeDelta::minutes(6));
        assert_eq!(clock.now() - start, TimeDelta::minutes(6));
    }
}
