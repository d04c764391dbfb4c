//! Replacing a stale container with one running the new image.
//!
//! Each action runs the state machine
//! `Verifying → Pulling → Stopping → Starting → HealthChecking` and ends in
//! `Succeeded`, `RolledBack` or `Failed`. The old container is only removed
//! once the new image is local, and a failed start recreates the old container
//! from its cached image. Every action yields its own outcome; nothing here
//! aborts a plan.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use log::{debug, error, info, warn};
use tokio::time::{sleep, Instant};

use crate::config::Timeouts;
use crate::error::{EngineError, UpdateError};
use crate::inspector::RuntimeInspector;
use crate::runtime::{bounded, ContainerRuntime, ContainerTemplate};
use crate::types::{
    ContainerStatus, HealthState, Stage, UpdateAction, UpdateOutcome, UpdateResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub engine_timeout: Duration,
    pub pull_timeout: Duration,
    pub stop_grace: Duration,
    pub health_timeout: Duration,
    pub health_poll: Duration,
}

impl From<&Timeouts> for ExecutorSettings {
    fn from(timeouts: &Timeouts) -> Self {
        Self {
            engine_timeout: Duration::from_secs(timeouts.engine_secs),
            pull_timeout: Duration::from_secs(timeouts.pull_secs),
            stop_grace: Duration::from_secs(timeouts.stop_secs),
            health_timeout: Duration::from_secs(timeouts.health_secs),
            health_poll: Duration::from_millis(timeouts.health_poll_ms),
        }
    }
}

/// Set of container identities with an update in flight.
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    inflight: Arc<Mutex<HashSet<String>>>,
}

impl SingleFlight {
    /// Claims `identity`, or `None` if another update already holds it. The
    /// claim is released when the guard drops.
    pub fn try_acquire(&self, identity: &str) -> Option<FlightGuard> {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if !inflight.insert(identity.to_string()) {
            return None;
        }
        Some(FlightGuard {
            identity: identity.to_string(),
            inflight: Arc::clone(&self.inflight),
        })
    }

    pub fn is_in_flight(&self, identity: &str) -> bool {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(identity)
    }
}

pub struct FlightGuard {
    identity: String,
    inflight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.identity);
    }
}

/// What is needed to bring the replaced container back.
struct Previous<'a> {
    template: &'a ContainerTemplate,
    /// Image string the container was created with.
    image: &'a str,
    image_id: &'a str,
}

#[derive(Clone)]
pub struct UpdateExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    inspector: RuntimeInspector,
    settings: ExecutorSettings,
    flights: SingleFlight,
}

impl UpdateExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: ExecutorSettings) -> Self {
        Self {
            inspector: RuntimeInspector::new(Arc::clone(&runtime), settings.engine_timeout),
            runtime,
            settings,
            flights: SingleFlight::default(),
        }
    }

    pub fn flights(&self) -> &SingleFlight {
        &self.flights
    }

    /// Runs one action to a terminal state.
    pub async fn apply(&self, action: UpdateAction) -> UpdateOutcome {
        let Some(_guard) = self.flights.try_acquire(&action.container) else {
            info!("{}: another update is in flight, skipping", action.container);
            return UpdateOutcome::skipped(
                action,
                "another update for this container is in flight",
            );
        };

        let outcome = self.run(action).await;
        match outcome.result {
            UpdateResult::Succeeded => info!("Updated {}", outcome.action),
            UpdateResult::Skipped => info!(
                "Skipped {}: {}",
                outcome.action.container,
                outcome.detail.as_deref().unwrap_or("")
            ),
            UpdateResult::Failed if !outcome.is_escalation() => warn!(
                "Update of {} failed while {:?}: {}",
                outcome.action.container,
                outcome.stage,
                outcome.error.as_ref().map(ToString::to_string).unwrap_or_default()
            ),
            // Logged where the rollback happened.
            UpdateResult::RolledBack | UpdateResult::Failed => {}
        }
        outcome
    }

    async fn run(&self, action: UpdateAction) -> UpdateOutcome {
        let timeout = self.settings.engine_timeout;

        enter(&action, Stage::Verifying);
        let inspected = bounded(timeout, self.runtime.inspect_container(&action.container)).await;
        let details = match inspected {
            Ok(details) => details,
            Err(EngineError::NotFound(_)) => {
                return UpdateOutcome::skipped(action, "container no longer exists")
                    .at(Stage::Verifying)
            }
            Err(e) => return unverified(action, e),
        };
        let running = match self.inspector.running_digest(&details, &action.image).await {
            Ok(digest) => digest,
            Err(e) => return unverified(action, e),
        };
        if running.as_ref() != Some(&action.old_digest) {
            let now = running.map_or_else(|| "unknown".to_string(), |d| d.short().to_string());
            let detail = format!(
                "running digest is {}, planned from {}",
                now,
                action.old_digest.short()
            );
            return UpdateOutcome::skipped(action, detail).at(Stage::Verifying);
        }
        let replacement = self.replacement_template(&details.template, &details.image_id).await;

        enter(&action, Stage::Pulling);
        let pulled = bounded(self.settings.pull_timeout, self.runtime.pull_image(&action.image));
        if let Err(e) = pulled.await {
            let error = UpdateError::PullFailure(e.to_string());
            return UpdateOutcome::failed(action, Stage::Pulling, error);
        }
        match bounded(timeout, self.runtime.inspect_image(&details.image)).await {
            Ok(local) if local.carries(&action.image, &action.new_digest) => {}
            Ok(_) => {
                // The tag moved again since planning; the next cycle picks it up.
                let error = UpdateError::PullFailure(format!(
                    "{} no longer resolves to {}",
                    action.image,
                    action.new_digest.short()
                ));
                return UpdateOutcome::failed(action, Stage::Pulling, error);
            }
            Err(e) => {
                let error =
                    UpdateError::PullFailure(format!("pulled image is not available: {}", e));
                return UpdateOutcome::failed(action, Stage::Pulling, error);
            }
        }

        let previous = Previous {
            template: &details.template,
            image: &details.image,
            image_id: &details.image_id,
        };

        enter(&action, Stage::Stopping);
        let stop_limit = self.settings.stop_grace + timeout;
        let stopped = bounded(
            stop_limit,
            self.runtime.stop_container(&details.id, self.settings.stop_grace),
        )
        .await;
        let removed = match stopped {
            Ok(()) => bounded(timeout, self.runtime.remove_container(&details.id, false)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = removed {
            let cause = UpdateError::StopFailure(e.to_string());
            return match self.resume_original(&details.id).await {
                Ok(()) => UpdateOutcome::failed(action, Stage::Stopping, cause),
                Err(resume) => escalate(action, Stage::Stopping, cause, resume),
            };
        }

        enter(&action, Stage::Starting);
        let created = bounded(
            timeout,
            self.runtime.create_container(&replacement, &details.image),
        )
        .await;
        let new_id = match created {
            Ok(id) => id,
            Err(e) => {
                let cause = UpdateError::StartFailure(e.to_string());
                return self.roll_back(action, Stage::Starting, cause, None, &previous).await;
            }
        };
        if let Err(e) = bounded(timeout, self.runtime.start_container(&new_id)).await {
            let cause = UpdateError::StartFailure(e.to_string());
            return self
                .roll_back(action, Stage::Starting, cause, Some(&new_id), &previous)
                .await;
        }

        enter(&action, Stage::HealthChecking);
        if let Err(cause) = self.wait_ready(&new_id).await {
            return self
                .roll_back(action, Stage::HealthChecking, cause, Some(&new_id), &previous)
                .await;
        }

        UpdateOutcome::succeeded(action)
    }

    /// The template for the replacement: `template` without the defaults it
    /// inherited from the image it currently runs, so the new image supplies
    /// its own.
    async fn replacement_template(
        &self,
        template: &ContainerTemplate,
        image_id: &str,
    ) -> ContainerTemplate {
        match bounded(self.settings.engine_timeout, self.runtime.inspect_image(image_id)).await {
            Ok(image) => template.without_image_defaults(&image.defaults),
            Err(e) => {
                warn!(
                    "{}: cannot read defaults of image {} ({}), recreating with the full config",
                    template.name,
                    short(image_id),
                    e
                );
                template.clone()
            }
        }
    }

    /// Polls `id` until it runs (and is healthy, when a healthcheck exists).
    async fn wait_ready(&self, id: &str) -> Result<(), UpdateError> {
        let deadline = Instant::now() + self.settings.health_timeout;
        loop {
            match bounded(self.settings.engine_timeout, self.runtime.inspect_container(id)).await {
                Ok(details) => match (details.status, details.health) {
                    (ContainerStatus::Running, None | Some(HealthState::Healthy)) => return Ok(()),
                    (ContainerStatus::Running, Some(HealthState::Unhealthy)) => {
                        return Err(UpdateError::StartFailure(format!(
                            "{} reported unhealthy",
                            details.name
                        )))
                    }
                    (ContainerStatus::Exited | ContainerStatus::Dead, _) => {
                        return Err(UpdateError::StartFailure(format!(
                            "{} exited after start",
                            details.name
                        )))
                    }
                    (status, health) => {
                        debug!("{} not ready: {:?} {:?}", details.name, status, health)
                    }
                },
                Err(e) => debug!("Readiness probe for {} failed: {}", short(id), e),
            }
            if Instant::now() >= deadline {
                return Err(UpdateError::HealthCheckTimeout(format!(
                    "{} not ready after {:?}",
                    short(id),
                    self.settings.health_timeout
                )));
            }
            sleep(self.settings.health_poll).await;
        }
    }

    async fn roll_back(
        &self,
        action: UpdateAction,
        stage: Stage,
        cause: UpdateError,
        failed_id: Option<&str>,
        previous: &Previous<'_>,
    ) -> UpdateOutcome {
        warn!(
            "{}: {} while {:?}, rolling back to {}",
            action.container,
            cause,
            stage,
            action.old_digest.short()
        );
        match self.restore(&action, failed_id, previous).await {
            Ok(()) => {
                warn!("{} rolled back to {}", action.container, action.old_digest.short());
                UpdateOutcome::rolled_back(action, stage, cause)
            }
            Err(e) => escalate(action, stage, cause, e),
        }
    }

    /// Recreates the replaced container from its cached image.
    async fn restore(
        &self,
        action: &UpdateAction,
        failed_id: Option<&str>,
        previous: &Previous<'_>,
    ) -> anyhow::Result<()> {
        let timeout = self.settings.engine_timeout;
        if let Some(id) = failed_id {
            bounded(timeout, self.runtime.remove_container(id, true))
                .await
                .with_context(|| format!("removing failed container {}", short(id)))?;
        }
        bounded(timeout, self.runtime.inspect_image(previous.image_id))
            .await
            .with_context(|| {
                format!("previous image {} is no longer cached", previous.image_id)
            })?;
        // The recreated container keeps its original image string, so the tag
        // has to lead back to the previous image.
        bounded(timeout, self.runtime.tag_image(previous.image_id, &action.image))
            .await
            .with_context(|| format!("re-tagging {} as {}", previous.image_id, action.image))?;
        let id = bounded(timeout, self.runtime.create_container(previous.template, previous.image))
            .await
            .context("recreating previous container")?;
        bounded(timeout, self.runtime.start_container(&id))
            .await
            .context("starting previous container")?;
        self.wait_ready(&id).await.context("previous container not ready")?;
        Ok(())
    }

    /// Brings the original container back up after a failed stop or remove.
    async fn resume_original(&self, id: &str) -> anyhow::Result<()> {
        let timeout = self.settings.engine_timeout;
        let details = bounded(timeout, self.runtime.inspect_container(id))
            .await
            .context("inspecting original container")?;
        if details.status != ContainerStatus::Running {
            bounded(timeout, self.runtime.start_container(id))
                .await
                .context("restarting original container")?;
        }
        Ok(())
    }
}

fn enter(action: &UpdateAction, stage: Stage) {
    debug!("{}: {:?}", action.container, stage);
}

fn unverified(action: UpdateAction, err: EngineError) -> UpdateOutcome {
    let detail = format!("could not verify current state: {}", err);
    UpdateOutcome::skipped(action, detail).at(Stage::Verifying)
}

fn escalate(
    action: UpdateAction,
    stage: Stage,
    cause: UpdateError,
    err: anyhow::Error,
) -> UpdateOutcome {
    error!(
        "ESCALATE: {} is down. Update failed while {:?} ({}) and recovery failed: {:#}",
        action.container, stage, cause, err
    );
    let error = UpdateError::RollbackFailure(format!("{}; recovery: {:#}", cause, err));
    UpdateOutcome::failed(action, stage, error)
}

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
