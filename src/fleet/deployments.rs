//! Compose stack deployments.
//!
//! A deployment row records what was rolled out and points at the
//! `compose_up` task. It has no status of its own; every read reads the
//! status off that task.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use super::db::DbHandle;
use super::liveness::Clock;
use super::models::{Deployment, DeploymentView};
use crate::errors::{FleetError, FleetResult};

/// Everything needed to record a deployment once its tasks are queued.
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub agent_id: String,
    pub stack_name: String,
    pub compose_content: String,
    pub env_content: String,
    pub start_task_id: String,
}

#[derive(Clone)]
pub struct DeploymentTracker {
    db: DbHandle,
    clock: Arc<dyn Clock>,
}

impl DeploymentTracker {
    pub fn new(db: DbHandle, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub async fn create_deployment(&self, new: NewDeployment) -> FleetResult<Deployment> {
        let deployment = Deployment {
            id: Uuid::new_v4().to_string(),
            agent_id: new.agent_id,
            stack_name: new.stack_name,
            compose_content: new.compose_content,
            env_content: new.env_content,
            task_id: new.start_task_id,
            created_at: self.clock.now(),
        };
        let record = deployment.clone();
        self.db
            .call(move |db| db.insert_deployment(&record))
            .await?;

        info!(
            deployment_id = %deployment.id,
            agent_id = %deployment.agent_id,
            stack = %deployment.stack_name,
            task_id = %deployment.task_id,
            "deployment recorded"
        );
        Ok(deployment)
    }

    pub async fn get(&self, id: &str) -> FleetResult<DeploymentView> {
        let id = id.to_string();
        self.db
            .call(move |db| -> FleetResult<DeploymentView> {
                let deployment = db
                    .get_deployment(&id)?
                    .ok_or(FleetError::DeploymentNotFound { id })?;
                let status = db.get_task(&deployment.task_id)?.map(|t| t.status);
                Ok(DeploymentView { deployment, status })
            })
            .await
    }

    /// Deployments for an agent, newest first, each with the current status
    /// of its start task.
    pub async fn list_for_agent(&self, agent_id: &str) -> FleetResult<Vec<DeploymentView>> {
        let agent_id = agent_id.to_string();
        let views = self
            .db
            .call(move |db| {
                let deployments = db.list_deployments_for_agent(&agent_id)?;
                let mut views = Vec::with_capacity(deployments.len());
                for deployment in deployments {
                    let status = db.get_task(&deployment.task_id)?.map(|t| t.status);
                    views.push(DeploymentView { deployment, status });
                }
                Ok::<_, anyhow::Error>(views)
            })
            .await?;
        Ok(views)
    }
}
