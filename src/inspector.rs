//! Discovery of the containers inside the managed scope.
//!
//! This process holds broad control-socket access, so everything the engine
//! returns is re-checked against the scope before it reaches the planner.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{CycleError, EngineError, UpdateError};
use crate::runtime::{bounded, ContainerDetails, ContainerRuntime, ListFilter};
use crate::types::{
    Digest, ImageReference, ManagedContainer, Scope, SkipReason, SkippedContainer,
    COMPOSE_NUMBER_LABEL, COMPOSE_PROJECT_LABEL, COMPOSE_SERVICE_LABEL,
};

/// Containers found in scope, plus declared ones that could not be used.
#[derive(Debug, Default)]
pub struct Inventory {
    pub containers: Vec<ManagedContainer>,
    pub skipped: Vec<SkippedContainer>,
}

#[derive(Clone)]
pub struct RuntimeInspector {
    runtime: Arc<dyn ContainerRuntime>,
    timeout: Duration,
}

impl RuntimeInspector {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, timeout: Duration) -> Self {
        Self { runtime, timeout }
    }

    /// Running containers in `scope`, in engine discovery order.
    ///
    /// Only a failed list call is fatal; per-container problems become skip
    /// entries.
    pub async fn list_managed(&self, scope: &Scope) -> Result<Inventory, CycleError> {
        let filter = match scope {
            Scope::Explicit { containers } => ListFilter::Names(containers.clone()),
            Scope::Compose { project, .. } => ListFilter::Label {
                key: COMPOSE_PROJECT_LABEL.to_string(),
                value: project.clone(),
            },
        };
        let summaries = bounded(self.timeout, self.runtime.list_containers(&filter)).await?;

        let mut inventory = Inventory::default();
        for summary in summaries {
            if !scope.admits(&summary.name, &summary.labels) {
                debug!("Ignoring {}: outside {}", summary.name, scope);
                continue;
            }
            match self.describe(&summary.id).await {
                Ok(container) => inventory.containers.push(container),
                // Removed between list and inspect.
                Err(EngineError::NotFound(_)) => {
                    debug!("{} disappeared during discovery", summary.name)
                }
                Err(e) => {
                    warn!("Failed to inspect {}: {}", summary.name, e);
                    inventory.skipped.push(SkippedContainer {
                        container: summary.name,
                        reason: SkipReason::Unavailable(e.to_string()),
                    });
                }
            }
        }

        if let Scope::Explicit { containers } = scope {
            for name in containers {
                let found = inventory.containers.iter().any(|c| c.name == *name)
                    || inventory.skipped.iter().any(|s| s.container == *name);
                if !found {
                    warn!("Declared container {} is not running", name);
                    inventory.skipped.push(SkippedContainer {
                        container: name.clone(),
                        reason: SkipReason::Error(UpdateError::ScopeMismatch(format!(
                            "{} is declared but not running",
                            name
                        ))),
                    });
                }
            }
        }

        info!(
            "Discovered {} managed containers in {}",
            inventory.containers.len(),
            scope
        );
        Ok(inventory)
    }

    /// Current view of a single container.
    pub async fn describe(&self, name_or_id: &str) -> Result<ManagedContainer, EngineError> {
        let details = bounded(self.timeout, self.runtime.inspect_container(name_or_id)).await?;
        let image = match ImageReference::parse(&details.image) {
            Ok(reference) => Some(reference),
            Err(e) => {
                info!("{}: {}, not tracking its image", details.name, e);
                None
            }
        };
        let digest = match &image {
            Some(reference) => self.running_digest(&details, reference).await?,
            None => None,
        };

        Ok(ManagedContainer {
            service: details.labels.get(COMPOSE_SERVICE_LABEL).cloned(),
            container_number: details
                .labels
                .get(COMPOSE_NUMBER_LABEL)
                .and_then(|n| n.parse().ok()),
            name: details.name,
            id: details.id,
            image,
            digest,
            status: details.status,
            labels: details.labels,
        })
    }

    /// Registry digest of the image `details` runs, as recorded in the local
    /// image's repo digests. Tags are never trusted for this.
    pub async fn running_digest(
        &self,
        details: &ContainerDetails,
        reference: &ImageReference,
    ) -> Result<Option<Digest>, EngineError> {
        match bounded(self.timeout, self.runtime.inspect_image(&details.image_id)).await {
            Ok(local) => {
                let digest = local.digest_for(reference);
                if digest.is_none() {
                    info!(
                        "{}: image {} has no registry digest for {}",
                        details.name, details.image_id, reference
                    );
                }
                Ok(digest)
            }
            Err(EngineError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
