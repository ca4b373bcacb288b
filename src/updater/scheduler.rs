//! Periodic auto-update runs.
//!
//! One `AutoUpdateScheduler` per process owns at most one timer task. The
//! timer slot is an async mutex so `init` can cancel the previous timer and
//! arm the next one without another `init` slipping in between.
//!
//! Cancelling a timer only stops future ticks. A run already in progress
//! is never interrupted, since a half-finished recreate would leave a
//! container removed. Runs are serialized, so a freshly armed timer waits
//! for the previous timer's last run.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::settings::{PruneMode, SettingsStore};

/// Outcome of one check phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckSummary {
    pub checked: usize,
    pub updated: usize,
    pub errors: usize,
}

/// What a single `run_checks` did. A phase is `None` when it failed
/// outright; the reason is in `failures`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub containers: Option<CheckSummary>,
    pub stacks: Option<CheckSummary>,
    pub prune_mode: PruneMode,
    pub pruned: bool,
    pub failures: Vec<String>,
}

impl RunReport {
    pub fn updated(&self) -> usize {
        self.containers.map_or(0, |s| s.updated) + self.stacks.map_or(0, |s| s.updated)
    }
}

/// The Docker-facing half of an update run.
#[async_trait]
pub trait UpdateChecker: Send + Sync {
    async fn check_containers(&self) -> Result<CheckSummary>;
    async fn check_stacks(&self) -> Result<CheckSummary>;
    async fn prune_images(&self, mode: PruneMode) -> Result<()>;
}

#[derive(Clone)]
struct CheckRunner {
    checker: Arc<dyn UpdateChecker>,
    settings: Arc<dyn SettingsStore>,
    in_flight: Arc<Mutex<()>>,
}

impl CheckRunner {
    async fn run(&self) -> RunReport {
        let _running = self.in_flight.lock().await;
        let started_at = Utc::now();
        let mut failures = Vec::new();

        let containers = guarded("containers", self.checker.check_containers())
            .await
            .map_err(|e| failures.push(e))
            .ok();
        let stacks = guarded("stacks", self.checker.check_stacks())
            .await
            .map_err(|e| failures.push(e))
            .ok();

        let prune_mode = match self.settings.load().await {
            Ok(settings) => settings.prune_mode,
            Err(e) => {
                warn!(error = %e, "could not load settings, skipping prune");
                PruneMode::None
            }
        };

        let mut report = RunReport {
            started_at,
            finished_at: started_at,
            containers,
            stacks,
            prune_mode,
            pruned: false,
            failures,
        };

        if report.updated() > 0 && prune_mode != PruneMode::None {
            let prune = async { self.checker.prune_images(prune_mode).await.map(|()| CheckSummary::default()) };
            match guarded("prune", prune).await {
                Ok(_) => report.pruned = true,
                Err(e) => report.failures.push(e),
            }
        }

        report.finished_at = Utc::now();
        info!(
            containers = ?report.containers,
            stacks = ?report.stacks,
            pruned = report.pruned,
            failures = report.failures.len(),
            "auto-update run finished"
        );
        report
    }
}

/// Run one phase, turning both errors and panics into a logged message.
async fn guarded<F>(phase: &'static str, fut: F) -> std::result::Result<CheckSummary, String>
where
    F: Future<Output = Result<CheckSummary>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(summary)) => Ok(summary),
        Ok(Err(e)) => {
            error!(phase, error = %format!("{:#}", e), "auto-update phase failed");
            Err(format!("{}: {:#}", phase, e))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(phase, panic = %message, "auto-update phase panicked");
            Err(format!("{}: panicked: {}", phase, message))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Timer {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Timer {
    /// Stop ticking. Returns the task handle, which finishes once any
    /// in-flight run completes.
    fn cancel(self) -> JoinHandle<()> {
        let _ = self.stop_tx.send(true);
        self.handle
    }
}

pub struct AutoUpdateScheduler {
    runner: CheckRunner,
    timer: Mutex<Option<Timer>>,
}

impl AutoUpdateScheduler {
    pub fn new(checker: Arc<dyn UpdateChecker>, settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            runner: CheckRunner {
                checker,
                settings,
                in_flight: Arc::new(Mutex::new(())),
            },
            timer: Mutex::new(None),
        }
    }

    /// Cancel any running timer, then arm a new one if auto-update is on.
    /// The first run happens immediately, or as soon as the cancelled
    /// timer's in-flight run finishes.
    pub async fn init(&self) -> Result<()> {
        let mut timer = self.timer.lock().await;
        if let Some(old) = timer.take() {
            drop(old.cancel());
            info!("auto-update timer cancelled");
        }

        let settings = self.runner.settings.load().await?;
        if !settings.auto_update {
            info!("auto-update disabled");
            return Ok(());
        }

        let period = settings.interval();
        let runner = self.runner.clone();
        let (stop_tx, mut cancelled) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.changed() => break,
                    _ = ticker.tick() => {}
                }
                runner.run().await;
                if *cancelled.borrow() {
                    break;
                }
            }
        });
        *timer = Some(Timer { stop_tx, handle });
        info!(
            interval_minutes = period.as_secs() / 60,
            prune_mode = %settings.prune_mode,
            "auto-update timer armed"
        );
        Ok(())
    }

    /// Cancel the timer and wait for an in-flight run to finish.
    pub async fn stop(&self) {
        let Some(timer) = self.timer.lock().await.take() else {
            return;
        };
        if let Err(e) = timer.cancel().await {
            warn!(error = %e, "auto-update timer task ended abnormally");
        }
        info!("auto-update timer stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.timer
            .lock()
            .await
            .as_ref()
            .is_some_and(|timer| !timer.handle.is_finished())
    }

    /// One run outside the timer, e.g. from the API.
    pub async fn run_checks(&self) -> RunReport {
        self.runner.run().await
    }
}
