use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info};

use super::auth::{AccessPolicy, Caller};
use super::db::DbHandle;
use super::deployments::{DeploymentTracker, NewDeployment};
use super::envfile::parse_env_text;
use super::liveness::{Clock, is_online};
use super::models::TaskKind;
use super::queue::{ResultSubmission, TaskQueue};
use super::registry::{AgentRegistration, AgentRegistry};
use super::remote::RemoteStackClient;
use crate::errors::FleetError;
use crate::updater::{AutoUpdateScheduler, SettingsPatch, SettingsStore};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub registry: AgentRegistry,
    pub queue: TaskQueue,
    pub tracker: DeploymentTracker,
    pub clock: Arc<dyn Clock>,
    pub policy: Arc<dyn AccessPolicy>,
    pub remote: Arc<dyn RemoteStackClient>,
    pub settings: Arc<dyn SettingsStore>,
    pub scheduler: Arc<AutoUpdateScheduler>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        db: DbHandle,
        clock: Arc<dyn Clock>,
        policy: Arc<dyn AccessPolicy>,
        remote: Arc<dyn RemoteStackClient>,
        settings: Arc<dyn SettingsStore>,
        scheduler: Arc<AutoUpdateScheduler>,
    ) -> Self {
        Self {
            registry: AgentRegistry::new(db.clone(), clock.clone()),
            queue: TaskQueue::new(db.clone(), clock.clone()),
            tracker: DeploymentTracker::new(db, clock.clone()),
            clock,
            policy,
            remote,
            settings,
            scheduler,
        }
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterRequest {
    #[serde(default, alias = "agentId")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default, alias = "agentId")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub metrics: Option<Value>,
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    #[serde(default, rename = "type")]
    pub task_type: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullImageRequest {
    #[serde(default, alias = "image_name", alias = "image")]
    pub image_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStackRequest {
    #[serde(default, alias = "stack_name")]
    pub stack_name: Option<String>,
    #[serde(default, alias = "compose_content")]
    pub compose_content: Option<String>,
    #[serde(default, alias = "env_content")]
    pub env_content: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    BadGateway(String),
    Internal(String),
}

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        let message = err.to_string();
        match err {
            FleetError::Validation(_)
            | FleetError::AgentNotOnline { .. }
            | FleetError::TaskIdMismatch { .. }
            | FleetError::InvalidTransition { .. }
            | FleetError::WrongAgent { .. } => ApiError::BadRequest(message),
            FleetError::AgentNotFound { .. }
            | FleetError::TaskNotFound { .. }
            | FleetError::DeploymentNotFound { .. } => ApiError::NotFound(message),
            FleetError::Forbidden => ApiError::Forbidden(message),
            FleetError::Upstream(_) => ApiError::BadGateway(message),
            FleetError::Storage(e) => {
                error!(error = %format!("{:#}", e), "storage failure");
                ApiError::Internal("Internal server error".to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"success": false, "error": message}))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/agents", get(list_agents))
        .route("/api/agents/register", post(register_agent))
        .route("/api/agents/heartbeat", post(heartbeat))
        .route("/api/agents/{id}", get(get_agent))
        .route("/api/agents/{id}/tasks", get(list_tasks).post(create_task))
        .route("/api/agents/{id}/tasks/{task_id}", get(get_task))
        .route(
            "/api/agents/{id}/tasks/{task_id}/result",
            post(submit_result),
        )
        .route("/api/agents/{id}/command", post(send_command))
        .route("/api/agents/{id}/images/pull", post(pull_image))
        .route(
            "/api/agents/{id}/stacks",
            get(list_remote_stacks).post(create_stack),
        )
        .route("/api/agents/{id}/deployments", get(list_deployments))
        .route("/api/deployments/{id}", get(get_deployment))
        .route("/api/settings", get(get_settings).put(update_settings))
        .route("/api/updates/run", post(run_updates))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn register_agent(
    State(state): State<SharedState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body?;
    let agent = state
        .registry
        .register(AgentRegistration {
            id: req.agent_id.unwrap_or_default(),
            hostname: req.hostname.unwrap_or_default(),
            platform: req.platform.unwrap_or_default(),
            version: req.version.unwrap_or_default(),
            capabilities: req.capabilities,
            endpoint: req.endpoint,
        })
        .await?;
    Ok(Json(json!({
        "success": true,
        "agent_id": agent.id,
        "message": "Agent registered successfully",
    })))
}

async fn heartbeat(
    State(state): State<SharedState>,
    body: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(req) = body?;
    let id = req.agent_id.unwrap_or_default();
    state.registry.heartbeat(&id, req.metrics).await?;
    Ok(Json(json!({"success": true, "message": "Heartbeat received"})))
}

async fn list_agents(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let agents = state.registry.list().await?;
    let count = agents.len();
    Ok(Json(json!({"success": true, "agents": agents, "count": count})))
}

async fn get_agent(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let agent = state.registry.get(&id).await?;
    Ok(Json(json!({"success": true, "agent": agent})))
}

/// Agents poll this for pending work. Admins can ask for the full history
/// with `?admin` or `?include_results`; anyone else gets the poll view.
async fn list_tasks(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let wants_admin_view = params.contains_key("admin") || params.contains_key("include_results");
    if wants_admin_view && caller.is_admin {
        let tasks = state.queue.list_for_agent(&id).await?;
        return Ok(Json(json!({"tasks": tasks})).into_response());
    }
    let pending = state.queue.poll_pending(&id).await?;
    Ok(Json(pending).into_response())
}

async fn create_task(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
    body: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    caller.require_admin()?;
    let Json(req) = body?;
    let task_type = req
        .task_type
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| FleetError::validation("type is required"))?;
    let kind = TaskKind::from_parts(&task_type, req.payload)?;
    let task = state.queue.enqueue(&id, kind).await?;
    Ok(Json(json!({"success": true, "task": task})))
}

async fn get_task(
    State(state): State<SharedState>,
    caller: Caller,
    Path((id, task_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    caller.require_admin()?;
    let task = state.queue.get_for_agent(&id, &task_id).await?;
    Ok(Json(json!({"task": task})))
}

async fn submit_result(
    State(state): State<SharedState>,
    Path((id, task_id)): Path<(String, String)>,
    body: Result<Json<ResultSubmission>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(submission) = body?;
    let task = state.queue.submit_result(&id, &task_id, submission).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Task {} marked {}", task.id, task.status),
    })))
}

async fn send_command(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
    body: Result<Json<CommandRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    caller.require_admin()?;
    let Json(req) = body?;
    let kind = TaskKind::DockerCommand {
        command: req.command.unwrap_or_default(),
        args: req.args,
    };
    let task = state.queue.enqueue(&id, kind).await?;
    Ok(Json(json!({
        "success": true,
        "task": task,
        "message": "Command queued",
    })))
}

async fn pull_image(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
    body: Result<Json<PullImageRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    caller.require_admin()?;
    let Json(req) = body?;
    let image_name = req.image_name.unwrap_or_default();
    let task = state
        .queue
        .enqueue(
            &id,
            TaskKind::PullImage {
                image_name: image_name.clone(),
            },
        )
        .await?;
    Ok(Json(json!({
        "success": true,
        "task": task,
        "message": format!("Pull of {} queued", image_name),
    })))
}

/// Queue `compose_create_project` then `compose_up` and record a
/// deployment that points at the `compose_up` task.
async fn create_stack(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
    body: Result<Json<CreateStackRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    caller.require_admin()?;
    let Json(req) = body?;
    let stack_name = req.stack_name.unwrap_or_default().trim().to_string();
    let compose_content = req.compose_content.unwrap_or_default();
    let env_content = req.env_content.unwrap_or_default();
    if stack_name.is_empty() {
        return Err(FleetError::validation("stackName is required").into());
    }

    let create = TaskKind::ComposeCreateProject {
        project_name: stack_name.clone(),
        compose_content: compose_content.clone(),
        env: parse_env_text(&env_content),
    };
    let create_task = state.queue.enqueue(&id, create).await?;
    let start_task = state
        .queue
        .enqueue(
            &id,
            TaskKind::ComposeUp {
                project_name: stack_name.clone(),
            },
        )
        .await?;

    let deployment = state
        .tracker
        .create_deployment(NewDeployment {
            agent_id: id,
            stack_name: stack_name.clone(),
            compose_content,
            env_content,
            start_task_id: start_task.id.clone(),
        })
        .await?;

    Ok(Json(json!({
        "success": true,
        "createTask": create_task,
        "startTask": start_task,
        "deployment": deployment,
        "message": format!("Stack {} queued for deployment", stack_name),
    })))
}

/// Synchronous call into the agent's own HTTP endpoint.
async fn list_remote_stacks(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    caller.require_admin()?;
    let agent = state.registry.get(&id).await?;
    if !is_online(&agent, state.clock.now()) {
        return Err(FleetError::AgentNotOnline { id }.into());
    }
    let stacks = state.remote.list_stacks(&agent).await?;
    Ok(Json(json!({"success": true, "stacks": stacks})))
}

async fn list_deployments(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    caller.require_admin()?;
    state.registry.get(&id).await?;
    let deployments = state.tracker.list_for_agent(&id).await?;
    Ok(Json(json!({"success": true, "deployments": deployments})))
}

async fn get_deployment(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    caller.require_admin()?;
    let deployment = state.tracker.get(&id).await?;
    Ok(Json(json!({"success": true, "deployment": deployment})))
}

async fn get_settings(
    State(state): State<SharedState>,
    caller: Caller,
) -> ApiResult<impl IntoResponse> {
    caller.require_admin()?;
    let settings = state.settings.load().await.map_err(FleetError::from)?;
    Ok(Json(json!({
        "success": true,
        "settings": settings,
        "scheduler_running": state.scheduler.is_running().await,
    })))
}

async fn update_settings(
    State(state): State<SharedState>,
    caller: Caller,
    body: Result<Json<SettingsPatch>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    caller.require_admin()?;
    let Json(patch) = body?;
    let mut settings = state.settings.load().await.map_err(FleetError::from)?;
    settings.apply(patch)?;
    state
        .settings
        .save(&settings)
        .await
        .map_err(FleetError::from)?;
    state.scheduler.init().await.map_err(FleetError::from)?;
    info!(
        auto_update = settings.auto_update,
        interval_minutes = settings.auto_update_interval,
        prune_mode = %settings.prune_mode,
        "auto-update settings changed"
    );
    Ok(Json(json!({
        "success": true,
        "settings": settings,
        "scheduler_running": state.scheduler.is_running().await,
    })))
}

async fn run_updates(
    State(state): State<SharedState>,
    caller: Caller,
) -> ApiResult<impl IntoResponse> {
    caller.require_admin()?;
    let report = state.scheduler.run_checks().await;
    Ok(Json(json!({"success": true, "report": report})))
}

// ── Tests ─────────────────────────────────────────────────────────────
