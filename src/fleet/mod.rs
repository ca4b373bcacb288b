//! Fleet control plane: agent registry, task queue and deployments.
//!
//! ## Overview
//!
//! Remote Docker hosts run an agent that registers here, heartbeats, and
//! polls for work. Admins queue tasks for an agent through the HTTP API;
//! the agent picks them up on its next poll and reports back. The server
//! never pushes to an agent, with one exception: listing the stacks an
//! agent is running is a direct HTTP call to that agent.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Agent / │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │  Admin   │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘          │         │ auth.rs (Caller, AccessPolicy)         │
//!                       │         v                                        │
//!                       │  registry.rs   queue.rs   deployments.rs         │
//!                       │         │          │           │                 │
//!                       │         └────── db.rs (DbHandle) ─┘              │
//!                       │                                                  │
//!                       │  remote.rs ──HTTP──> agent /stacks               │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                             |
//! |------------|------------------------------------------------------------|
//! | `models`   | `Agent`, `Task`, `TaskKind`, `Deployment`                  |
//! | `liveness` | `Clock`, effective online/offline status from `last_seen`  |
//! | `envfile`  | `KEY=VALUE` parsing for stack environment text             |
//!
//! ## Typical Flow (deploy a stack)
//!
//! 1. `POST /api/agents/{id}/stacks` → admin check, then `compose_create_project`
//!    and `compose_up` are queued in that order.
//! 2. A deployment row is written pointing at the `compose_up` task.
//! 3. The agent polls `GET /api/agents/{id}/tasks`, runs both, and posts each
//!    outcome to `/tasks/{task_id}/result`.
//! 4. `GET /api/agents/{id}/deployments` reports the `compose_up` status.

pub mod api;
pub mod auth;
pub mod db;
pub mod deployments;
pub mod envfile;
pub mod liveness;
pub mod models;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod server;
