//! Typed error hierarchy for the fleet control plane.
//!
//! `FleetError` is what the registry, task queue and deployment tracker
//! return. The dispatch API maps each variant onto an HTTP status in
//! `fleet::api::ApiError`. Infrastructure code (storage bootstrap, config,
//! Docker) keeps using `anyhow::Result` and surfaces here as `Storage`.

use thiserror::Error;

use crate::fleet::models::TaskStatus;

/// Errors from the agent registry, task queue and deployment tracker.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("{0}")]
    Validation(String),

    #[error("Agent {id} not found")]
    AgentNotFound { id: String },

    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    #[error("Deployment {id} not found")]
    DeploymentNotFound { id: String },

    #[error("Admin access required")]
    Forbidden,

    #[error("Agent {id} is not online")]
    AgentNotOnline { id: String },

    #[error("Task id mismatch: path has {path_id}, body has {body_id}")]
    TaskIdMismatch { path_id: String, body_id: String },

    #[error("Invalid task status transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Task {task_id} does not belong to this agent")]
    WrongAgent { task_id: String, agent_id: String },

    #[error("Agent request failed: {0}")]
    Upstream(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub type FleetResult<T> = std::result::Result<T, FleetError>;

impl FleetError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
