//! In-memory container engine and registry for exercising the update pipeline
//! without a Docker daemon.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bollard::models::ContainerConfig;

use freshd::config::Config;
use freshd::error::EngineError;
use freshd::runtime::{
    ContainerDetails, ContainerRuntime, ContainerSummary, ContainerTemplate, ListFilter,
    LocalImage,
};
use freshd::types::{ContainerStatus, Digest, HealthState, ImageReference, Scope};

pub const IMAGE_SIZE: u64 = 1_048_576;

/// What the fake registry answers for a reference.
#[derive(Debug, Clone)]
pub enum Published {
    Digest { digest: String, image_id: String },
    Unreachable,
    Unauthorized,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub status: ContainerStatus,
    pub health: Option<HealthState>,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
}

#[derive(Default)]
struct State {
    containers: Vec<FakeContainer>,
    images: HashMap<String, LocalImage>,
    tags: HashMap<String, String>,
    registry: HashMap<String, Published>,
    failing_pulls: HashSet<String>,
    broken_images: HashSet<String>,
    unhealthy_images: HashSet<String>,
    never_ready_images: HashSet<String>,
    purge_on_pull: HashSet<String>,
    failing_removals: HashSet<String>,
    image_env: HashMap<String, Vec<String>>,
    list_error: Option<EngineError>,
    calls: Vec<String>,
    next_id: u32,
}

#[derive(Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<State>>,
}

fn key(reference: &ImageReference) -> String {
    reference.to_string()
}

fn parse(image: &str) -> ImageReference {
    ImageReference::parse(image).expect("valid test reference")
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Makes `image_id` local, pulled from `image` as `digest`, and tags it.
    pub fn seed_image(&self, image: &str, digest: &str, image_id: &str) {
        let reference = parse(image);
        let mut state = self.state();
        let entry = state
            .images
            .entry(image_id.to_string())
            .or_insert_with(|| LocalImage {
                id: image_id.to_string(),
                ..Default::default()
            });
        entry
            .repo_digests
            .push(format!("{}@{}", reference.name(), digest));
        state.tags.insert(key(&reference), image_id.to_string());
    }

    /// Publishes `digest` (content `image_id`) under `image` in the registry.
    pub fn publish(&self, image: &str, digest: &str, image_id: &str) {
        self.set_registry(
            image,
            Published::Digest {
                digest: digest.to_string(),
                image_id: image_id.to_string(),
            },
        );
    }

    pub fn set_registry(&self, image: &str, published: Published) {
        self.state().registry.insert(key(&parse(image)), published);
    }

    /// Runs a container from whatever `image` is tagged to locally.
    pub fn run(&self, name: &str, image: &str, labels: &[(&str, &str)]) -> String {
        let mut state = self.state();
        let image_id = ImageReference::parse(image)
            .ok()
            .and_then(|reference| state.tags.get(&key(&reference)).cloned())
            .unwrap_or_else(|| image.to_string());
        let env = state.env_for(
            &image_id,
            vec![format!("SERVICE={name}"), "TZ=Europe/Berlin".to_string()],
        );
        state.next_id += 1;
        let id = format!("{:012x}{:04}", 0xc0ffee, state.next_id);
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: name.to_string(),
            image: image.to_string(),
            image_id,
            status: ContainerStatus::Running,
            health: None,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            env,
        });
        id
    }

    /// Environment that `image_id` bakes into every container made from it.
    pub fn image_env(&self, image_id: &str, env: &[&str]) {
        let env = env.iter().map(|e| e.to_string()).collect();
        self.state().image_env.insert(image_id.to_string(), env);
    }

    /// Removing the container named `name` fails.
    pub fn fail_removal(&self, name: &str) {
        self.state().failing_removals.insert(name.to_string());
    }

    pub fn fail_pulls(&self, image: &str) {
        self.state().failing_pulls.insert(key(&parse(image)));
    }

    /// Containers from `image_id` fail to start.
    pub fn break_image(&self, image_id: &str) {
        self.state().broken_images.insert(image_id.to_string());
    }

    pub fn make_unhealthy(&self, image_id: &str) {
        self.state().unhealthy_images.insert(image_id.to_string());
    }

    /// Containers from `image_id` stay in `starting` health forever.
    pub fn never_ready(&self, image_id: &str) {
        self.state().never_ready_images.insert(image_id.to_string());
    }

    /// Deletes `image_id` from the local store as soon as any pull happens.
    pub fn purge_on_pull(&self, image_id: &str) {
        self.state().purge_on_pull.insert(image_id.to_string());
    }

    pub fn fail_list(&self, error: EngineError) {
        self.state().list_error = Some(error);
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state()
            .containers
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.state().containers.clone()
    }

    pub fn has_image(&self, image_id: &str) -> bool {
        self.state().images.contains_key(image_id)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Recorded calls starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }
}

impl State {
    fn find(&self, name_or_id: &str) -> Option<usize> {
        self.containers
            .iter()
            .position(|c| c.id == name_or_id || c.name == name_or_id)
    }

    fn resolve_image(&self, image: &str) -> Option<String> {
        if self.images.contains_key(image) {
            return Some(image.to_string());
        }
        let reference = ImageReference::parse(image).ok()?;
        self.tags.get(&key(&reference)).cloned()
    }

    /// `env` on top of the image's defaults, as the engine merges them.
    fn env_for(&self, image_id: &str, env: Vec<String>) -> Vec<String> {
        let var = |entry: &str| entry.split('=').next().unwrap_or_default().to_string();
        let set: HashSet<String> = env.iter().map(|e| var(e)).collect();
        let mut merged: Vec<String> = self
            .image_env
            .get(image_id)
            .into_iter()
            .flatten()
            .filter(|entry| !set.contains(&var(entry)))
            .cloned()
            .collect();
        merged.extend(env);
        merged
    }

    fn details(&self, container: &FakeContainer) -> ContainerDetails {
        ContainerDetails {
            id: container.id.clone(),
            name: container.name.clone(),
            image: container.image.clone(),
            image_id: container.image_id.clone(),
            status: container.status,
            health: container.health,
            labels: container.labels.clone(),
            template: ContainerTemplate {
                name: container.name.clone(),
                source_id: container.id.clone(),
                config: ContainerConfig {
                    image: Some(container.image.clone()),
                    env: Some(container.env.clone()),
                    labels: Some(container.labels.clone()),
                    ..Default::default()
                },
                host_config: None,
                networks: HashMap::new(),
            },
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_containers(
        &self,
        filter: &ListFilter,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        self.record("list".to_string());
        let state = self.state();
        if let Some(err) = &state.list_error {
            return Err(err.clone());
        }
        let matches = |c: &FakeContainer| match filter {
            ListFilter::Names(names) => names.iter().any(|n| c.name.contains(n.as_str())),
            ListFilter::Label { key, value } => c.labels.get(key) == Some(value),
        };
        // Engines return newest first; callers must not rely on any order.
        Ok(state
            .containers
            .iter()
            .rev()
            .filter(|c| c.status == ContainerStatus::Running && matches(*c))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn inspect_container(&self, name_or_id: &str) -> Result<ContainerDetails, EngineError> {
        let state = self.state();
        let index = state
            .find(name_or_id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {name_or_id}")))?;
        Ok(state.details(&state.containers[index]))
    }

    async fn inspect_image(&self, image: &str) -> Result<LocalImage, EngineError> {
        let state = self.state();
        let mut local = state
            .resolve_image(image)
            .and_then(|id| state.images.get(&id).cloned())
            .ok_or_else(|| EngineError::NotFound(format!("No such image: {image}")))?;
        local.defaults.env = state.image_env.get(&local.id).cloned().unwrap_or_default();
        Ok(local)
    }

    async fn distribution_digest(
        &self,
        reference: &ImageReference,
    ) -> Result<Digest, EngineError> {
        self.record(format!("resolve {reference}"));
        let published = self.state().registry.get(&key(reference)).cloned();
        match published {
            Some(Published::Digest { digest, .. }) => {
                Digest::parse(&digest).map_err(|e| EngineError::Api(e.to_string()))
            }
            Some(Published::Unreachable) => {
                Err(EngineError::Api("connection refused".to_string()))
            }
            Some(Published::Unauthorized) => {
                Err(EngineError::Unauthorized("authentication required".to_string()))
            }
            Some(Published::NotFound) | None => {
                Err(EngineError::NotFound("manifest unknown".to_string()))
            }
        }
    }

    async fn pull_image(&self, reference: &ImageReference) -> Result<(), EngineError> {
        self.record(format!("pull {reference}"));
        let mut state = self.state();
        let purged: Vec<String> = state.purge_on_pull.drain().collect();
        for id in purged {
            state.images.remove(&id);
            state.tags.retain(|_, tagged| *tagged != id);
        }
        if state.failing_pulls.contains(&key(reference)) {
            return Err(EngineError::Api("toomanyrequests: rate limit exceeded".to_string()));
        }
        let published = state.registry.get(&key(reference)).cloned();
        let Some(Published::Digest { digest, image_id }) = published else {
            return Err(EngineError::NotFound("manifest unknown".to_string()));
        };
        let entry = state
            .images
            .entry(image_id.clone())
            .or_insert_with(|| LocalImage {
                id: image_id.clone(),
                ..Default::default()
            });
        entry
            .repo_digests
            .push(format!("{}@{}", reference.name(), digest));
        state.tags.insert(key(reference), image_id);
        Ok(())
    }

    async fn tag_image(
        &self,
        image_id: &str,
        reference: &ImageReference,
    ) -> Result<(), EngineError> {
        self.record(format!("tag {image_id} {reference}"));
        let mut state = self.state();
        if !state.images.contains_key(image_id) {
            return Err(EngineError::NotFound(format!("No such image: {image_id}")));
        }
        state.tags.insert(key(reference), image_id.to_string());
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), EngineError> {
        self.record(format!("stop {id}"));
        let mut state = self.state();
        let index = state
            .find(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))?;
        state.containers[index].status = ContainerStatus::Exited;
        state.containers[index].health = None;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        self.record(format!("remove {id}"));
        let mut state = self.state();
        let index = state
            .find(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))?;
        if state.failing_removals.contains(&state.containers[index].name) {
            return Err(EngineError::Api(format!(
                "removal of container {id} is already in progress"
            )));
        }
        if state.containers[index].status == ContainerStatus::Running && !force {
            return Err(EngineError::Api("container is running".to_string()));
        }
        state.containers.remove(index);
        Ok(())
    }

    async fn create_container(
        &self,
        template: &ContainerTemplate,
        image: &str,
    ) -> Result<String, EngineError> {
        self.record(format!("create {} {}", template.name, image));
        let mut state = self.state();
        if state.find(&template.name).is_some() {
            return Err(EngineError::Api(format!(
                "Conflict. The container name \"/{}\" is already in use",
                template.name
            )));
        }
        let image_id = state
            .resolve_image(image)
            .ok_or_else(|| EngineError::NotFound(format!("No such image: {image}")))?;
        let env = state.env_for(&image_id, template.config.env.clone().unwrap_or_default());
        state.next_id += 1;
        let id = format!("{:012x}{:04}", 0xc0ffee, state.next_id);
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: template.name.clone(),
            image: image.to_string(),
            image_id,
            status: ContainerStatus::Created,
            health: None,
            labels: template.config.labels.clone().unwrap_or_default(),
            env,
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(format!("start {id}"));
        let mut state = self.state();
        let index = state
            .find(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))?;
        let image_id = state.containers[index].image_id.clone();
        if state.broken_images.contains(&image_id) {
            return Err(EngineError::Api(
                "OCI runtime create failed: exec format error".to_string(),
            ));
        }
        let health = if state.unhealthy_images.contains(&image_id) {
            Some(HealthState::Unhealthy)
        } else if state.never_ready_images.contains(&image_id) {
            Some(HealthState::Starting)
        } else {
            None
        };
        let container = &mut state.containers[index];
        container.status = ContainerStatus::Running;
        container.health = health;
        Ok(())
    }

    async fn prune_dangling_images(&self) -> Result<u64, EngineError> {
        self.record("prune".to_string());
        let mut state = self.state();
        let in_use: HashSet<String> = state
            .tags
            .values()
            .cloned()
            .chain(state.containers.iter().map(|c| c.image_id.clone()))
            .collect();
        let before = state.images.len();
        state.images.retain(|id, _| in_use.contains(id));
        Ok((before - state.images.len()) as u64 * IMAGE_SIZE)
    }
}

/// Configuration with short timeouts and immediate retries.
pub fn test_config(scope: Scope) -> Config {
    let mut config = Config {
        scope,
        ..Config::default()
    };
    config.registry.backoff_ms = 100;
    config.timeouts.health_secs = 5;
    config.timeouts.health_poll_ms = 100;
    config.timeouts.stop_secs = 1;
    config
}

pub fn explicit(names: &[&str]) -> Scope {
    Scope::Explicit {
        containers: names.iter().map(|n| n.to_string()).collect(),
    }
}

pub fn digest(value: &str) -> Digest {
    Digest::parse(value).unwrap()
}
