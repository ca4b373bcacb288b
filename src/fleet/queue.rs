//! Per-agent task queue.
//!
//! Tasks are created `pending` by an admin action and only ever move forward
//! through result submissions from the agent that owns them. The server
//! never flips a task's status on its own.

use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::db::DbHandle;
use super::liveness::{Clock, is_online};
use super::models::{PendingTask, Task, TaskKind, TaskStatus};
use crate::errors::{FleetError, FleetResult};

/// Body an agent posts when reporting on a task.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultSubmission {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ResultSubmission {
    /// The reported status, limited to what an agent may send.
    fn reported_status(&self) -> FleetResult<TaskStatus> {
        let invalid = || FleetError::validation("status must be one of: running, completed, failed");
        let raw = self.status.as_deref().ok_or_else(invalid)?;
        match TaskStatus::from_str(raw) {
            Ok(status @ (TaskStatus::Running | TaskStatus::Completed | TaskStatus::Failed)) => {
                Ok(status)
            }
            _ => Err(invalid()),
        }
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    db: DbHandle,
    clock: Arc<dyn Clock>,
}

impl TaskQueue {
    pub fn new(db: DbHandle, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Queue a new task for an agent that exists and is online. Every call
    /// creates a new row; nothing is merged.
    pub async fn enqueue(&self, agent_id: &str, kind: TaskKind) -> FleetResult<Task> {
        kind.validate()?;
        let agent_id = agent_id.to_string();
        let now = self.clock.now();

        let task = self
            .db
            .call(move |db| -> FleetResult<Task> {
                let agent = db
                    .get_agent(&agent_id)?
                    .ok_or_else(|| FleetError::AgentNotFound {
                        id: agent_id.clone(),
                    })?;
                if !is_online(&agent, now) {
                    return Err(FleetError::AgentNotOnline { id: agent_id });
                }
                let task = Task {
                    id: Uuid::new_v4().to_string(),
                    agent_id,
                    kind,
                    status: TaskStatus::Pending,
                    result: None,
                    error: None,
                    created_at: now,
                    updated_at: now,
                };
                db.insert_task(&task)?;
                Ok(task)
            })
            .await?;

        info!(
            task_id = %task.id,
            agent_id = %task.agent_id,
            task_type = task.kind.type_name(),
            "task queued"
        );
        Ok(task)
    }

    /// Agent view: pending tasks in creation order, `{id, type, payload}` only.
    pub async fn poll_pending(&self, agent_id: &str) -> FleetResult<Vec<PendingTask>> {
        let agent_id = agent_id.to_string();
        let tasks = self
            .db
            .call(move |db| db.list_tasks_for_agent(&agent_id, Some(TaskStatus::Pending)))
            .await?;
        Ok(tasks.into_iter().map(PendingTask::from).collect())
    }

    /// Admin view: every task for the agent with full detail. The caller is
    /// responsible for the admin check.
    pub async fn list_for_agent(&self, agent_id: &str) -> FleetResult<Vec<Task>> {
        let agent_id = agent_id.to_string();
        let tasks = self
            .db
            .call(move |db| db.list_tasks_for_agent(&agent_id, None))
            .await?;
        Ok(tasks)
    }

    pub async fn get(&self, task_id: &str) -> FleetResult<Task> {
        let task_id = task_id.to_string();
        self.db
            .call(move |db| -> FleetResult<Task> {
                db.get_task(&task_id)?
                    .ok_or(FleetError::TaskNotFound { id: task_id })
            })
            .await
    }

    /// Fetch a task and check it belongs to `agent_id`.
    pub async fn get_for_agent(&self, agent_id: &str, task_id: &str) -> FleetResult<Task> {
        let task = self.get(task_id).await?;
        if task.agent_id != agent_id {
            return Err(FleetError::WrongAgent {
                task_id: task.id,
                agent_id: agent_id.to_string(),
            });
        }
        Ok(task)
    }

    /// Apply an agent's report. Validation, the id-mismatch guard, ownership
    /// and the forward-only transition rule are all checked before anything
    /// is written.
    pub async fn submit_result(
        &self,
        agent_id: &str,
        task_id: &str,
        submission: ResultSubmission,
    ) -> FleetResult<Task> {
        let next = submission.reported_status()?;
        if let Some(body_id) = submission.task_id.as_deref()
            && body_id != task_id
        {
            return Err(FleetError::TaskIdMismatch {
                path_id: task_id.to_string(),
                body_id: body_id.to_string(),
            });
        }

        let agent_id = agent_id.to_string();
        let task_id = task_id.to_string();
        let now = self.clock.now();
        let outcome = self
            .db
            .call(move |db| -> FleetResult<Task> {
                let task = db
                    .get_task(&task_id)?
                    .ok_or_else(|| FleetError::TaskNotFound { id: task_id.clone() })?;
                if task.agent_id != agent_id {
                    return Err(FleetError::WrongAgent { task_id, agent_id });
                }
                if !task.status.can_transition_to(next) {
                    return Err(FleetError::InvalidTransition {
                        from: task.status,
                        to: next,
                    });
                }
                let updated = db.update_task_outcome(
                    &task_id,
                    next,
                    submission.result.as_ref(),
                    submission.error.as_deref(),
                    now,
                )?;
                Ok(updated)
            })
            .await;

        match &outcome {
            Ok(task) if task.status == TaskStatus::Failed => warn!(
                task_id = %task.id,
                agent_id = %task.agent_id,
                error = task.error.as_deref().unwrap_or(""),
                "task failed on agent"
            ),
            Ok(task) => info!(
                task_id = %task.id,
                agent_id = %task.agent_id,
                status = %task.status,
                "task result recorded"
            ),
            Err(e) => warn!(error = %e, "task result rejected"),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::db::FleetDb;
    use crate::fleet::liveness::ManualClock;
    use crate::fleet::registry::{AgentRegistration, AgentRegistry};
    use chrono::{TimeDelta, Utc};
    use serde_json::json;

    struct Fixture {
        registry: AgentRegistry,
        queue: TaskQueue,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let db = DbHandle::new(FleetDb::new_in_memory().unwrap());
        Fixture {
            registry: AgentRegistry::new(db.clone(), clock.clone()),
            queue: TaskQueue::new(db, clock.clone()),
            clock,
        }
    }

    async fn online_agent(f: &Fixture, id: &str) {
        f.registry
            .register(AgentRegistration {
                id: id.into(),
                hostname: format!("{}-host", id),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    fn pull(image: &str) -> TaskKind {
        TaskKind::PullImage {
            image_name: image.into(),
        }
    }

    fn report(status: &str) -> ResultSubmission {
        ResultSubmission {
            status: Some(status.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn enqueue_unknown_agent_is_not_found() {
        let f = fixture();
        let err = f.queue.enqueue("ghost", pull("nginx")).await.unwrap_err();
        assert!(matches!(err, FleetError::AgentNotFound { .. }));
    }

    #[tokio::test]
    async fn enqueue_for_stale_agent_fails_not_online() {
        let f = fixture();
        online_agent(&f, "a1").await;
        f.clock.advance(TimeDelta::minutes(6));

        let err = f.queue.enqueue("a1", pull("nginx")).await.unwrap_err();
        assert!(matches!(err, FleetError::AgentNotOnline { .. }));
        assert!(err.to_string().contains("not online"));
        assert!(f.queue.list_for_agent("a1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_for_online_agent_creates_pending_task() {
        let f = fixture();
        online_agent(&f, "a2").await;
        let task = f.queue.enqueue("a2", pull("nginx")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.kind.type_name(), "pull_image");
        assert_eq!(task.agent_id, "a2");
    }

    #[tokio::test]
    async fn enqueue_never_deduplicates() {
        let f = fixture();
        online_agent(&f, "a1").await;
        let t1 = f.queue.enqueue("a1", pull("nginx")).await.unwrap();
        let t2 = f.queue.enqueue("a1", pull("nginx")).await.unwrap();
        assert_ne!(t1.id, t2.id);
        assert_eq!(f.queue.poll_pending("a1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_payload() {
        let f = fixture();
        online_agent(&f, "a1").await;
        let err = f.queue.enqueue("a1", pull("")).await.unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }

    #[tokio::test]
    async fn poll_returns_only_pending_in_creation_order() {
        let f = fixture();
        online_agent(&f, "a1").await;
        let first = f.queue.enqueue("a1", pull("one")).await.unwrap();
        let second = f.queue.enqueue("a1", pull("two")).await.unwrap();
        let third = f.queue.enqueue("a1", pull("three")).await.unwrap();
        f.queue
            .submit_result("a1", &second.id, report("running"))
            .await
            .unwrap();

        let pending = f.queue.poll_pending("a1").await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![first.id.as_str(), third.id.as_str()]);

        for task in &pending {
            let value = serde_json::to_value(task).unwrap();
            assert!(value.get("status").is_none());
            assert!(value.get("result").is_none());
            assert!(value.get("error").is_none());
        }
        assert_eq!(f.queue.list_for_agent("a1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn submit_result_rejects_unknown_status() {
        let f = fixture();
        online_agent(&f, "a1").await;
        let task = f.queue.enqueue("a1", pull("nginx")).await.unwrap();

        for bad in ["pending", "done", ""] {
            let err = f
                .queue
                .submit_result("a1", &task.id, report(bad))
                .await
                .unwrap_err();
            assert!(matches!(err, FleetError::Validation(_)));
        }
        let err = f
            .queue
            .submit_result("a1", &task.id, ResultSubmission::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }

    #[tokio::test]
    async fn submit_result_with_mismatched_id_does_not_mutate() {
        let f = fixture();
        online_agent(&f, "a1").await;
        let task = f.queue.enqueue("a1", pull("nginx")).await.unwrap();

        let err = f
            .queue
            .submit_result(
                "a1",
                &task.id,
                ResultSubmission {
                    task_id: Some("someone-else".into()),
                    status: Some("completed".into()),
                    result: Some(json!({"ok": true})),
                    error: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::TaskIdMismatch { .. }));

        let unchanged = f.queue.get(&task.id).await.unwrap();
        assert_eq!(unchanged.status, TaskStatus::Pending);
        assert!(unchanged.result.is_none());
    }

    #[tokio::test]
    async fn submit_result_walks_forward() {
        let f = fixture();
        online_agent(&f, "a1").await;
        let task = f.queue.enqueue("a1", pull("nginx")).await.unwrap();

        let running = f
            .queue
            .submit_result("a1", &task.id, report("running"))
            .await
            .unwrap();
        assert_eq!(running.status, TaskStatus::Running);

        let done = f
            .queue
            .submit_result(
                "a1",
                &task.id,
                ResultSubmission {
                    task_id: Some(task.id.clone()),
                    status: Some("completed".into()),
                    result: Some(json!({"digest": "sha256:abc"})),
                    error: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result, Some(json!({"digest": "sha256:abc"})));
    }

    #[tokio::test]
    async fn submit_result_rejects_leaving_terminal_state() {
        let f = fixture();
        online_agent(&f, "a1").await;
        let task = f.queue.enqueue("a1", pull("nginx")).await.unwrap();
        f.queue
            .submit_result("a1", &task.id, report("failed"))
            .await
            .unwrap();

        for next in ["running", "completed", "failed"] {
            let err = f
                .queue
                .submit_result("a1", &task.id, report(next))
                .await
                .unwrap_err();
            assert!(matches!(err, FleetError::InvalidTransition { .. }));
        }
        assert_eq!(
            f.queue.get(&task.id).await.unwrap().status,
            TaskStatus::Failed
        );
    }

    #[tokio::test]
    async fn submit_result_for_other_agents_task_is_rejected() {
        let f = fixture();
        online_agent(&f, "a1").await;
        online_agent(&f, "a2").await;
        let task = f.queue.enqueue("a1", pull("nginx")).await.unwrap();

        let err = f
            .queue
            .submit_result("a2", &task.id, report("completed"))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::WrongAgent { .. }));
    }

    #[tokio::test]
    async fn submit_result_for_unknown_task_is_not_found() {
        let f = fixture();
        let err = f
            .queue
            .submit_result("a1", "missing", report("completed"))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::TaskNotFound { .. }));
    }

    #[tokio::test]
    async fn get_for_agent_checks_ownership() {
        let f = fixture();
        online_agent(&f, "a1").await;
        let task = f.queue.enqueue("a1", pull("nginx")).await.unwrap();

        assert!(f.queue.get_for_agent("a1", &task.id).await.is_ok());
        let err = f.queue.get_for_agent("a2", &task.id).await.unwrap_err();
        assert!(err.to_string().contains("does not belong to this agent"));
        let err = f.queue.get_for_agent("a1", "nope").await.unwrap_err();
        assert!(matches!(err, FleetError::TaskNotFound { .. }));
    }
}
