//! Auto-update: keep opted-in local containers and compose stacks on the
//! newest image for their tag.
//!
//! ```text
//! settings ──load──▶ scheduler ──run_checks──▶ UpdateChecker
//!    ▲                  │                          │
//!    └── PUT /settings ─┘ (re-init)                └─ docker (bollard + compose)
//! ```

pub mod docker;
pub mod scheduler;
pub mod settings;

pub use docker::DockerUpdateChecker;
pub use scheduler::{AutoUpdateScheduler, CheckSummary, RunReport, UpdateChecker};
pub use settings::{DbSettingsStore, PruneMode, SettingsPatch, SettingsStore, UpdateSettings};
