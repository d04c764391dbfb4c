//! Turns discovered containers into an ordered update plan.

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::error::UpdateError;
use crate::registry::DigestResolver;
use crate::types::{
    DigestRecord, ImageReference, ManagedContainer, Scope, SkipReason, SkippedContainer,
    UpdateAction, UpdatePlan,
};

pub struct UpdatePlanner<'a> {
    scope: &'a Scope,
    resolver: &'a DigestResolver,
}

impl<'a> UpdatePlanner<'a> {
    pub fn new(scope: &'a Scope, resolver: &'a DigestResolver) -> Self {
        Self { scope, resolver }
    }

    /// One action per stale container, in declaration order.
    ///
    /// Containers are compared by digest only. A failed resolution skips that
    /// container and planning carries on with the rest. Within one pass a
    /// reference shared by several containers is resolved once.
    pub async fn plan(&self, mut containers: Vec<ManagedContainer>) -> UpdatePlan {
        containers.sort_by_key(|c| self.scope.order_key(c));

        let mut resolved: HashMap<ImageReference, Result<DigestRecord, UpdateError>> =
            HashMap::new();
        let mut plan = UpdatePlan::default();

        for container in containers {
            if let Some(reference) = container.image.as_ref().filter(|r| r.is_pinned()) {
                debug!("Skipping {}: pinned to {}", container.name, reference);
                plan.skipped.push(SkippedContainer {
                    container: container.name,
                    reason: SkipReason::Pinned,
                });
                continue;
            }
            let (Some(reference), Some(running)) = (&container.image, &container.digest) else {
                info!("Skipping {}: no image metadata", container.name);
                plan.skipped.push(SkippedContainer {
                    container: container.name,
                    reason: SkipReason::NoImageMetadata,
                });
                continue;
            };

            if !resolved.contains_key(reference) {
                let record = self.resolver.resolve(reference).await;
                resolved.insert(reference.clone(), record);
            }
            match &resolved[reference] {
                Ok(record) if record.digest == *running => {
                    debug!("{} is up to date ({})", container.name, running.short());
                    plan.up_to_date.push(container.name);
                }
                Ok(record) => {
                    let action = UpdateAction {
                        container_id: container.id.clone(),
                        image: reference.clone(),
                        old_digest: running.clone(),
                        new_digest: record.digest.clone(),
                        container: container.name.clone(),
                    };
                    info!("Planned update: {}", action);
                    plan.actions.push(action);
                }
                Err(e) => {
                    warn!("Skipping {} this cycle: {}", container.name, e);
                    plan.skipped.push(SkippedContainer {
                        container: container.name,
                        reason: SkipReason::Error(e.clone()),
                    });
                }
            }
        }
        plan
    }
}
