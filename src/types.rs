//! Data structures used throughout the update pipeline.
//!
//! Everything here is derived from the engine and the registry during a single
//! cycle and dropped at its end. Nothing is cached across cycles: tags such as
//! `latest` move without notice, so the only trustworthy view is a fresh one.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReferenceError, UpdateError};

pub const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// Label selecting the containers of a compose project.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
pub const COMPOSE_NUMBER_LABEL: &str = "com.docker.compose.container-number";
/// Setting this label to `false` removes a container from any scope.
pub const OPT_OUT_LABEL: &str = "freshd.enable";

/// Content-addressed image identifier, e.g. `sha256:4f2a…`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    pub fn parse(value: &str) -> Result<Self, ReferenceError> {
        match value.split_once(':') {
            Some((algorithm, hex))
                if !algorithm.is_empty()
                    && !hex.is_empty()
                    && hex.chars().all(|c| c.is_ascii_hexdigit()) =>
            {
                Ok(Self(value.to_string()))
            }
            _ => Err(ReferenceError::Digest(value.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Algorithm plus the first 12 hex characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.find(':').map_or(0, |i| i + 1) + 12;
        self.0.get(..end).unwrap_or(&self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = ReferenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

/// Registry + repository + tag, optionally pinned to a digest.
///
/// Equality is structural over the normalized form, so `nginx` and
/// `docker.io/library/nginx:latest` are the same reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: String,
    digest: Option<Digest>,
}

impl ImageReference {
    /// Parses an image string the way the engine does.
    ///
    /// The first path component is a registry host only when it contains a
    /// `.` or `:` or is `localhost`. Official Docker Hub images gain the
    /// `library/` prefix and a missing tag means `latest`.
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ReferenceError::Empty);
        }
        if input.starts_with("sha256:") && !input.contains('/') {
            return Err(ReferenceError::ImageId(input.to_string()));
        }

        let (name_tag, digest) = match input.split_once('@') {
            Some((name, digest)) => (name, Some(Digest::parse(digest)?)),
            None => (input, None),
        };

        let last_slash = name_tag.rfind('/');
        let (name, tag) = match name_tag.rfind(':') {
            Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
                (&name_tag[..colon], Some(&name_tag[colon + 1..]))
            }
            _ => (name_tag, None),
        };
        if name.is_empty() || name.ends_with('/') || tag == Some("") {
            return Err(ReferenceError::Malformed(input.to_string()));
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first, rest.to_string())
            }
            _ => (DEFAULT_REGISTRY, name.to_string()),
        };
        let registry = match registry {
            "index.docker.io" | "registry-1.docker.io" => DEFAULT_REGISTRY,
            other => other,
        };
        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        Ok(Self {
            registry: registry.to_string(),
            repository,
            tag: tag.unwrap_or(DEFAULT_TAG).to_string(),
            digest,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// `registry/repository`, the part shared by every tag and digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    pub fn pinned_digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    pub fn is_pinned(&self) -> bool {
        self.digest.is_some()
    }

    /// Whether both references name the same repository, ignoring tag and
    /// digest. Used to pick the matching entry out of an image's repo digests.
    pub fn same_repository(&self, other: &ImageReference) -> bool {
        self.registry == other.registry && self.repository == other.repository
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for ImageReference {
    type Error = ReferenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageReference> for String {
    fn from(reference: ImageReference) -> Self {
        reference.to_string()
    }
}

/// Operator-declared set of containers this process may inspect and mutate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scope {
    /// Containers named explicitly; the list order is the update order.
    Explicit { containers: Vec<String> },
    /// Every container labelled with the compose project.
    Compose {
        project: String,
        /// Update order hint. Services not listed follow alphabetically.
        #[serde(default)]
        services: Vec<String>,
        #[serde(default)]
        exclude: Vec<String>,
    },
}

impl Default for Scope {
    fn default() -> Self {
        Self::Explicit {
            containers: Vec::new(),
        }
    }
}

impl Scope {
    /// Strict membership test applied to everything the engine returns.
    pub fn admits(&self, name: &str, labels: &HashMap<String, String>) -> bool {
        if labels.get(OPT_OUT_LABEL).is_some_and(|v| v.eq_ignore_ascii_case("false")) {
            return false;
        }
        match self {
            Self::Explicit { containers } => containers.iter().any(|c| c == name),
            Self::Compose {
                project, exclude, ..
            } => {
                labels.get(COMPOSE_PROJECT_LABEL) == Some(project)
                    && !labels
                        .get(COMPOSE_SERVICE_LABEL)
                        .is_some_and(|service| exclude.contains(service))
            }
        }
    }

    /// Sort key giving the declaration order of a container in this scope.
    pub fn order_key(&self, container: &ManagedContainer) -> (usize, String, u32, String) {
        match self {
            Self::Explicit { containers } => {
                let position = containers
                    .iter()
                    .position(|c| *c == container.name)
                    .unwrap_or(containers.len());
                (position, String::new(), 0, container.name.clone())
            }
            Self::Compose { services, .. } => {
                let service = container.service.clone().unwrap_or_default();
                let position = services
                    .iter()
                    .position(|s| *s == service)
                    .unwrap_or(services.len());
                (
                    position,
                    service,
                    container.container_number.unwrap_or(0),
                    container.name.clone(),
                )
            }
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit { containers } => write!(f, "containers [{}]", containers.join(", ")),
            Self::Compose { project, .. } => write!(f, "compose project {project}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
}

/// A container inside the managed scope, as discovered this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedContainer {
    pub name: String,
    pub id: String,
    pub service: Option<String>,
    pub container_number: Option<u32>,
    /// `None` when the container was started from something that is not a
    /// followable reference, e.g. a bare image id.
    pub image: Option<ImageReference>,
    /// Registry digest of the image actually running. `None` for locally
    /// built images that were never pulled.
    pub digest: Option<Digest>,
    pub status: ContainerStatus,
    pub labels: HashMap<String, String>,
}

/// Digest a registry served for a reference at one point in time. Only valid
/// for the planning pass that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestRecord {
    pub reference: ImageReference,
    pub digest: Digest,
    pub observed_at: DateTime<Utc>,
}

impl DigestRecord {
    pub fn observed(reference: ImageReference, digest: Digest) -> Self {
        Self {
            reference,
            digest,
            observed_at: Utc::now(),
        }
    }
}

/// Replace `container` (running `old_digest`) with one running `new_digest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateAction {
    pub container: String,
    pub container_id: String,
    pub image: ImageReference,
    pub old_digest: Digest,
    pub new_digest: Digest,
}

impl fmt::Display for UpdateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}: {} -> {})",
            self.container,
            self.image,
            self.old_digest.short(),
            self.new_digest.short()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "error", rename_all = "snake_case")]
pub enum SkipReason {
    NoImageMetadata,
    Pinned,
    /// Inspecting the container failed; nothing was touched.
    Unavailable(String),
    Error(UpdateError),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoImageMetadata => f.write_str("no image metadata"),
            Self::Pinned => f.write_str("pinned by digest"),
            Self::Unavailable(detail) => write!(f, "unavailable: {detail}"),
            Self::Error(err) => write!(f, "{err}"),
        }
    }
}

/// A container left out of this cycle's plan, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedContainer {
    pub container: String,
    pub reason: SkipReason,
}

/// Ordered replace actions for one cycle, plus everything that needed none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdatePlan {
    pub actions: Vec<UpdateAction>,
    pub up_to_date: Vec<String>,
    pub skipped: Vec<SkippedContainer>,
}

impl UpdatePlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Executor states. Outcomes record the state an action ended in, or the
/// state it failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planned,
    Verifying,
    Pulling,
    Stopping,
    Starting,
    HealthChecking,
    Succeeded,
    RolledBack,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateResult {
    Succeeded,
    Skipped,
    RolledBack,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateOutcome {
    pub action: UpdateAction,
    pub result: UpdateResult,
    /// Last state reached; for failures, the state that failed.
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<UpdateError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl UpdateOutcome {
    pub fn succeeded(action: UpdateAction) -> Self {
        Self {
            action,
            result: UpdateResult::Succeeded,
            stage: Stage::Succeeded,
            error: None,
            detail: None,
        }
    }

    /// Left alone without touching the container. The stage stays `Planned`
    /// unless [`UpdateOutcome::at`] records how far the action got.
    pub fn skipped(action: UpdateAction, detail: impl Into<String>) -> Self {
        Self {
            action,
            result: UpdateResult::Skipped,
            stage: Stage::Planned,
            error: None,
            detail: Some(detail.into()),
        }
    }

    pub fn at(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    /// The replacement failed at `stage` but the previous container runs again.
    pub fn rolled_back(action: UpdateAction, stage: Stage, cause: UpdateError) -> Self {
        Self {
            action,
            result: UpdateResult::RolledBack,
            stage,
            error: Some(cause),
            detail: None,
        }
    }

    pub fn failed(action: UpdateAction, stage: Stage, error: UpdateError) -> Self {
        Self {
            action,
            result: UpdateResult::Failed,
            stage,
            error: Some(error),
            detail: None,
        }
    }

    pub fn is_escalation(&self) -> bool {
        self.error.as_ref().is_some_and(UpdateError::is_escalation)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleCounts {
    pub updated: usize,
    pub rolled_back: usize,
    pub failed: usize,
    pub skipped: usize,
    pub up_to_date: usize,
}

/// Everything needed to explain one cycle after the fact.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub outcomes: Vec<UpdateOutcome>,
    pub skipped: Vec<SkippedContainer>,
    pub up_to_date: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reclaimed_bytes: Option<u64>,
    /// Set when the cycle aborted before planning finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,
}

impl CycleReport {
    pub fn new(cycle: u64, host: impl Into<String>, dry_run: bool) -> Self {
        Self {
            cycle,
            host: host.into(),
            started_at: Utc::now(),
            finished_at: None,
            dry_run,
            outcomes: Vec::new(),
            skipped: Vec::new(),
            up_to_date: Vec::new(),
            reclaimed_bytes: None,
            fatal: None,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn counts(&self) -> CycleCounts {
        let mut counts = CycleCounts {
            skipped: self.skipped.len(),
            up_to_date: self.up_to_date.len(),
            ..CycleCounts::default()
        };
        for outcome in &self.outcomes {
            match outcome.result {
                UpdateResult::Succeeded => counts.updated += 1,
                UpdateResult::RolledBack => counts.rolled_back += 1,
                UpdateResult::Failed => counts.failed += 1,
                UpdateResult::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    pub fn escalations(&self) -> impl Iterator<Item = &UpdateOutcome> {
        self.outcomes.iter().filter(|o| o.is_escalation())
    }

    fn names(&self, result: UpdateResult) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.result == result)
            .map(|o| o.action.container.as_str())
            .collect()
    }

    /// Multi-line operator summary.
    pub fn summary(&self) -> String {
        fn list(names: Vec<&str>) -> String {
            if names.is_empty() {
                "none".to_string()
            } else {
                names.join(", ")
            }
        }

        if let Some(fatal) = &self.fatal {
            return format!("Cycle {} aborted: {}", self.cycle, fatal);
        }
        let mut skipped = self.names(UpdateResult::Skipped);
        skipped.extend(self.skipped.iter().map(|s| s.container.as_str()));
        let up_to_date = self.up_to_date.iter().map(String::as_str).collect();
        format!(
            "Updated: {}\nRolled back: {}\nFailed: {}\nSkipped: {}\nUp to date: {}",
            list(self.names(UpdateResult::Succeeded)),
            list(self.names(UpdateResult::RolledBack)),
            list(self.names(UpdateResult::Failed)),
            list(skipped),
            list(up_to_date),
        )
    }
}
