//! Image freshness checks against the local Docker daemon.
//!
//! Opt-in is per container via the `dockhand.auto-update=true` label.
//! Standalone containers are recreated in place; compose projects are
//! redeployed with `docker compose up -d`.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{ContainerCreateBody, ContainerSummary};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, ListContainersOptions,
    PruneImagesOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use futures_util::TryStreamExt;
use tracing::{debug, info, warn};

use super::scheduler::{CheckSummary, UpdateChecker};
use super::settings::PruneMode;

pub const AUTO_UPDATE_LABEL: &str = "dockhand.auto-update";
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_WORKING_DIR_LABEL: &str = "com.docker.compose.project.working_dir";

pub struct DockerUpdateChecker {
    docker: Docker,
}

impl DockerUpdateChecker {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self::new(docker))
    }

    /// Running containers that opted in to auto-update.
    async fn opted_in(&self) -> Result<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", AUTO_UPDATE_LABEL)],
        );
        let options = ListContainersOptions {
            all: false,
            filters: Some(filters),
            ..Default::default()
        };
        self.docker
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")
    }

    /// Pull `image` and return the id it now resolves to.
    async fn pull(&self, image: &str) -> Result<String> {
        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .with_context(|| format!("Failed to pull {}", image))?;
        let inspected = self
            .docker
            .inspect_image(image)
            .await
            .with_context(|| format!("Failed to inspect {}", image))?;
        inspected
            .id
            .with_context(|| format!("Image {} has no id", image))
    }

    /// True when pulling the container's image yields a different image id.
    async fn has_newer_image(&self, container: &ContainerSummary) -> Result<bool> {
        let (Some(image), Some(current)) = (container.image.as_deref(), container.image_id.as_deref())
        else {
            bail!("container has no image reference");
        };
        if image.starts_with("sha256:") {
            debug!(image, "container pinned to an image id, skipping");
            return Ok(false);
        }
        let latest = self.pull(image).await?;
        Ok(latest != current)
    }

    /// Stop, remove and recreate a container with its previous config on
    /// the freshly pulled image.
    async fn recreate(&self, id: &str) -> Result<()> {
        let inspected = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("Failed to inspect container {}", id))?;
        let name = inspected
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_string())
            .with_context(|| format!("Container {} has no name", id))?;
        let config = inspected.config.unwrap_or_default();

        let body = ContainerCreateBody {
            image: config.image,
            env: config.env,
            cmd: config.cmd,
            entrypoint: config.entrypoint,
            labels: config.labels,
            working_dir: config.working_dir,
            user: config.user,
            host_config: inspected.host_config,
            ..Default::default()
        };

        self.docker
            .stop_container(id, None::<StopContainerOptions>)
            .await
            .with_context(|| format!("Failed to stop {}", name))?;
        self.docker
            .remove_container(id, None::<RemoveContainerOptions>)
            .await
            .with_context(|| format!("Failed to remove {}", name))?;
        let options = CreateContainerOptions {
            name: Some(name.clone()),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(Some(options), body)
            .await
            .with_context(|| format!("Failed to recreate {}", name))?;
        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
            .with_context(|| format!("Failed to start {}", name))?;
        info!(container = %name, "container recreated on new image");
        Ok(())
    }

    async fn compose_up(&self, project: &str, working_dir: Option<&str>) -> Result<()> {
        let mut cmd = tokio::process::Command::new("docker");
        cmd.args(["compose", "-p", project, "up", "-d"]);
        if let Some(dir) = working_dir {
            cmd.current_dir(PathBuf::from(dir));
        }
        let output = cmd
            .output()
            .await
            .context("Failed to run docker compose")?;
        if !output.status.success() {
            bail!(
                "docker compose up failed for {}: {}",
                project,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        info!(project, "compose project redeployed");
        Ok(())
    }
}

fn label<'a>(container: &'a ContainerSummary, key: &str) -> Option<&'a str> {
    container
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

fn container_name(container: &ContainerSummary) -> String {
    container
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .or_else(|| container.id.clone())
        .unwrap_or_default()
}

/// Opted-in containers that belong to a compose project, grouped by project.
fn group_by_project(containers: Vec<ContainerSummary>) -> BTreeMap<String, Vec<ContainerSummary>> {
    let mut projects: BTreeMap<String, Vec<ContainerSummary>> = BTreeMap::new();
    for container in containers {
        if let Some(project) = label(&container, COMPOSE_PROJECT_LABEL).map(String::from) {
            projects.entry(project).or_default().push(container);
        }
    }
    projects
}

#[async_trait]
impl UpdateChecker for DockerUpdateChecker {
    async fn check_containers(&self) -> Result<CheckSummary> {
        let mut summary = CheckSummary::default();
        let standalone = self
            .opted_in()
            .await?
            .into_iter()
            .filter(|c| label(c, COMPOSE_PROJECT_LABEL).is_none());

        for container in standalone {
            summary.checked += 1;
            let name = container_name(&container);
            let Some(id) = container.id.as_deref() else {
                summary.errors += 1;
                continue;
            };
            let outcome = match self.has_newer_image(&container).await {
                Ok(true) => self.recreate(id).await.map(|()| true),
                other => other,
            };
            match outcome {
                Ok(true) => summary.updated += 1,
                Ok(false) => debug!(container = %name, "image up to date"),
                Err(e) => {
                    summary.errors += 1;
                    warn!(container = %name, error = %format!("{:#}", e), "container update failed");
                }
            }
        }
        Ok(summary)
    }

    async fn check_stacks(&self) -> Result<CheckSummary> {
        let mut summary = CheckSummary::default();
        for (project, containers) in group_by_project(self.opted_in().await?) {
            summary.checked += 1;
            let mut changed = false;
            let mut failed = false;
            for container in &containers {
                match self.has_newer_image(container).await {
                    Ok(newer) => changed |= newer,
                    Err(e) => {
                        failed = true;
                        warn!(
                            project = %project,
                            container = %container_name(container),
                            error = %format!("{:#}", e),
                            "stack image check failed"
                        );
                    }
                }
            }
            if !changed {
                if failed {
                    summary.errors += 1;
                }
                continue;
            }
            let working_dir = containers
                .iter()
                .find_map(|c| label(c, COMPOSE_WORKING_DIR_LABEL));
            match self.compose_up(&project, working_dir).await {
                Ok(()) => summary.updated += 1,
                Err(e) => {
                    summary.errors += 1;
                    warn!(project = %project, error = %format!("{:#}", e), "stack redeploy failed");
                }
            }
        }
        Ok(summary)
    }

    async fn prune_images(&self, mode: PruneMode) -> Result<()> {
        let dangling = match mode {
            PruneMode::None => return Ok(()),
            PruneMode::Dangling => "true",
            PruneMode::All => "false",
        };
        let mut filters = HashMap::new();
        filters.insert("dangling".to_string(), vec![dangling.to_string()]);
        let options = PruneImagesOptions {
            filters: Some(filters),
            ..Default::default()
        };
        let pruned = self
            .docker
            .prune_images(Some(options))
            .await
            .context("Failed to prune images")?;
        info!(
            mode = %mode,
            removed = pruned.images_deleted.map_or(0, |d| d.len()),
            reclaimed_bytes = pruned.space_reclaimed.unwrap_or(0),
            "images pruned"
        );
        Ok(())
    }
}
