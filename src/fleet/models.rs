use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{FleetError, FleetResult};

// ── Agents ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            _ => Err(format!("Invalid agent status: {}", s)),
        }
    }
}

/// A remote Docker host as stored by the registry.
///
/// `status` is whatever the agent last reported. Anything handed to a
/// caller goes through `liveness::annotate` first so the stored value is
/// never surfaced on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub hostname: String,
    pub platform: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub endpoint: Option<String>,
    pub status: AgentStatus,
    pub metrics: Option<Value>,
    pub last_seen: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Tasks ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Forward-only: `pending → running → {completed | failed}`, with
    /// `running` allowed to be skipped.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Completed | Self::Failed)
                | (Self::Running, Self::Completed | Self::Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
}

/// Work an agent can be asked to do. Serialized as `{"type": .., "payload": {..}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum TaskKind {
    DockerCommand {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    PullImage {
        image_name: String,
    },
    ComposeCreateProject {
        project_name: String,
        compose_content: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    ComposeUp {
        project_name: String,
    },
    ComposeDown {
        project_name: String,
    },
    ContainerAction {
        container_id: String,
        action: ContainerAction,
    },
}

impl TaskKind {
    /// Build a kind from the wire `type` string and its payload, validating
    /// the payload schema.
    pub fn from_parts(task_type: &str, payload: Value) -> FleetResult<Self> {
        let kind: TaskKind =
            serde_json::from_value(serde_json::json!({ "type": task_type, "payload": payload }))
                .map_err(|e| {
                    FleetError::validation(format!("Invalid {} task: {}", task_type, e))
                })?;
        kind.validate()?;
        Ok(kind)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::DockerCommand { .. } => "docker_command",
            Self::PullImage { .. } => "pull_image",
            Self::ComposeCreateProject { .. } => "compose_create_project",
            Self::ComposeUp { .. } => "compose_up",
            Self::ComposeDown { .. } => "compose_down",
            Self::ContainerAction { .. } => "container_action",
        }
    }

    /// The payload half of the wire form.
    pub fn payload(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    pub fn validate(&self) -> FleetResult<()> {
        let required = |value: &str, field: &str| {
            if value.trim().is_empty() {
                Err(FleetError::validation(format!("{} is required", field)))
            } else {
                Ok(())
            }
        };
        match self {
            Self::DockerCommand { command, .. } => required(command, "command"),
            Self::PullImage { image_name } => required(image_name, "imageName"),
            Self::ComposeCreateProject {
                project_name,
                compose_content,
                ..
            } => {
                required(project_name, "projectName")?;
                required(compose_content, "composeContent")
            }
            Self::ComposeUp { project_name } | Self::ComposeDown { project_name } => {
                required(project_name, "projectName")
            }
            Self::ContainerAction { container_id, .. } => required(container_id, "containerId"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub agent_id: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What an agent sees when it polls: `{id, type, payload}` and nothing else.
#[derive(Debug, Clone, Serialize)]
pub struct PendingTask {
    pub id: String,
    #[serde(flatten)]
    pub kind: TaskKind,
}

impl From<Task> for PendingTask {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            kind: task.kind,
        }
    }
}

// ── Deployments ───────────────────────────────────────────────────────

/// A compose stack rollout. Its outcome lives on the task named by `task_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub agent_id: String,
    pub stack_name: String,
    pub compose_content: String,
    pub env_content: String,
    pub task_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentView {
    #[serde(flatten)]
    pub deployment: Deployment,
    pub status: Option<TaskStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_roundtrips_through_str() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(TaskStatus::from_str("cancelled").is_err());
    }

    #[test]
    fn transitions_only_move_forward() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Completed));
    }

    #[test]
    fn task_kind_serializes_type_and_payload() {
        let kind = TaskKind::PullImage {
            image_name: "nginx:latest".into(),
        };
        let value = serde_json::to_value(&kind).unwrap();
        assert_eq!(value["type"], "pull_image");
        assert_eq!(value["payload"]["imageName"], "nginx:latest");
        assert_eq!(kind.payload()["imageName"], "nginx:latest");
    }

    #[test]
    fn from_parts_parses_docker_command() {
        let kind = TaskKind::from_parts(
            "docker_command",
            serde_json::json!({"command": "ps", "args": ["-a"]}),
        )
        .unwrap();
        assert_eq!(
            kind,
            TaskKind::DockerCommand {
                command: "ps".into(),
                args: vec!["-a".into()],
            }
        );
        assert_eq!(kind.type_name(), "docker_command");
    }

    #[test]
    fn from_parts_rejects_unknown_type() {
        let err = TaskKind::from_parts("reboot_host", serde_json::json!({})).unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }

    #[test]
    fn from_parts_rejects_missing_and_blank_fields() {
        assert!(TaskKind::from_parts("pull_image", serde_json::json!({})).is_err());
        let err =
            TaskKind::from_parts("pull_image", serde_json::json!({"imageName": "  "})).unwrap_err();
        assert!(err.to_string().contains("imageName"));
    }

    #[test]
    fn container_action_payload_uses_camel_case() {
        let kind = TaskKind::from_parts(
            "container_action",
            serde_json::json!({"containerId": "abc", "action": "restart"}),
        )
        .unwrap();
        assert_eq!(
            kind,
            TaskKind::ContainerAction {
                container_id: "abc".into(),
                action: ContainerAction::Restart,
            }
        );
    }

    #[test]
    fn pending_task_projection_hides_status_and_result() {
        let task = Task {
            id: "t1".into(),
            agent_id: "a1".into(),
            kind: TaskKind::ComposeUp {
                project_name: "web".into(),
            },
            status: TaskStatus::Pending,
            result: Some(serde_json::json!({"secret": true})),
            error: Some("boom".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let value = serde_json::to_value(PendingTask::from(task)).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert_eq!(value["id"], "t1");
        assert_eq!(value["type"], "compose_up");
        assert_eq!(value["payload"]["projectName"], "web");
    }

    #[test]
    fn full_task_flattens_kind() {
        let task = Task {
            id: "t1".into(),
            agent_id: "a1".into(),
            kind: TaskKind::PullImage {
                image_name: "redis".into(),
            },
            status: TaskStatus::Failed,
            result: None,
            error: Some("no space".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["type"], "pull_image");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"], "no space");
        assert_eq!(value["agent_id"], "a1");
    }
}
