use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bollard::models::{ContainerConfig, EndpointSettings, HostConfig};

use crate::error::EngineError;
use crate::types::{ContainerStatus, Digest, HealthState, ImageReference};

pub mod docker;
pub use docker::DockerRuntime;

/// Selection pushed down to the engine's list call. The engine may match more
/// loosely than asked (Docker's name filter is a substring match), so callers
/// re-check every result against their scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListFilter {
    Names(Vec<String>),
    Label { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

/// Everything needed to recreate a container with a different image.
#[derive(Debug, Clone, Default)]
pub struct ContainerTemplate {
    pub name: String,
    /// Id of the container this template was read from.
    pub source_id: String,
    pub config: ContainerConfig,
    pub host_config: Option<HostConfig>,
    pub networks: HashMap<String, EndpointSettings>,
}

impl ContainerTemplate {
    /// This template minus the values the container inherited from `image`.
    ///
    /// The engine reports a container's config merged with its image's
    /// defaults. Recreating from that on a newer image would pin the old
    /// image's env, labels, ports and command, so only values that differ from
    /// the image are kept.
    pub fn without_image_defaults(&self, image: &ImageDefaults) -> Self {
        let mut template = self.clone();
        let config = &mut template.config;
        if let Some(env) = config.env.as_mut() {
            env.retain(|entry| !image.env.contains(entry));
        }
        if let Some(labels) = config.labels.as_mut() {
            labels.retain(|key, value| image.labels.get(key) != Some(value));
        }
        if let Some(ports) = config.exposed_ports.as_mut() {
            ports.retain(|port, _| !image.exposed_ports.contains(port));
        }
        // An overridden entrypoint clears the image's cmd, so a cmd equal to
        // the image's was set explicitly in that case.
        if config.entrypoint == image.entrypoint {
            config.entrypoint = None;
            if config.cmd == image.cmd {
                config.cmd = None;
            }
        }
        template
    }
}

/// Container settings an image supplies when a container does not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageDefaults {
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub labels: HashMap<String, String>,
    pub exposed_ports: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    /// Image string as given when the container was created.
    pub image: String,
    /// Local id of the image the container runs.
    pub image_id: String,
    pub status: ContainerStatus,
    /// `None` when no healthcheck is configured.
    pub health: Option<HealthState>,
    pub labels: HashMap<String, String>,
    pub template: ContainerTemplate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalImage {
    pub id: String,
    /// `repository@digest` entries this image was pulled by.
    pub repo_digests: Vec<String>,
    pub defaults: ImageDefaults,
}

impl LocalImage {
    /// Registry digest of this image for the repository of `reference`.
    pub fn digest_for(&self, reference: &ImageReference) -> Option<Digest> {
        self.repo_digests.iter().find_map(|entry| {
            let parsed = ImageReference::parse(entry).ok()?;
            if parsed.same_repository(reference) {
                parsed.pinned_digest().cloned()
            } else {
                None
            }
        })
    }

    /// Whether this image was pulled as `digest` from the repository of
    /// `reference`.
    pub fn carries(&self, reference: &ImageReference, digest: &Digest) -> bool {
        self.repo_digests.iter().any(|entry| {
            ImageReference::parse(entry).is_ok_and(|parsed| {
                parsed.same_repository(reference) && parsed.pinned_digest() == Some(digest)
            })
        })
    }
}

/// Access to the container engine's control socket.
///
/// This is the only way the rest of the crate touches live infrastructure.
/// Registry credentials, when configured, are held by the implementation and
/// attached to manifest queries and pulls.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Running containers matching `filter`.
    async fn list_containers(&self, filter: &ListFilter)
        -> Result<Vec<ContainerSummary>, EngineError>;

    async fn inspect_container(&self, name_or_id: &str) -> Result<ContainerDetails, EngineError>;

    /// Local image by id or reference. `NotFound` when not cached.
    async fn inspect_image(&self, image: &str) -> Result<LocalImage, EngineError>;

    /// Digest the registry serves for `reference`, from the manifest only.
    async fn distribution_digest(&self, reference: &ImageReference)
        -> Result<Digest, EngineError>;

    async fn pull_image(&self, reference: &ImageReference) -> Result<(), EngineError>;

    /// Points `reference` at a local image id.
    async fn tag_image(&self, image_id: &str, reference: &ImageReference)
        -> Result<(), EngineError>;

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), EngineError>;

    /// Removes a container, keeping its volumes.
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError>;

    /// Creates (without starting) a container from `template` running `image`.
    /// Returns the new container id.
    async fn create_container(
        &self,
        template: &ContainerTemplate,
        image: &str,
    ) -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Removes dangling images, returning the bytes reclaimed.
    async fn prune_dangling_images(&self) -> Result<u64, EngineError>;
}

/// Bounds an engine call; an elapsed deadline becomes [`EngineError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(EngineError::Timeout(limit)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_for_picks_matching_repository() {
        let image = LocalImage {
            id: "sha256:ffff".into(),
            repo_digests: vec![
                "registry.example.com/api@sha256:1111".into(),
                "nginx@sha256:2222".into(),
            ],
            ..Default::default()
        };
        let nginx = ImageReference::parse("nginx:1.27").unwrap();
        assert_eq!(image.digest_for(&nginx).unwrap().as_str(), "sha256:2222");

        let missing = ImageReference::parse("registry.example.com/web").unwrap();
        assert!(image.digest_for(&missing).is_none());

        let digest = Digest::parse("sha256:2222").unwrap();
        assert!(image.carries(&nginx, &digest));
        assert!(!image.carries(&missing, &digest));
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn template_drops_values_inherited_from_image() {
        let template = ContainerTemplate {
            name: "web".into(),
            config: ContainerConfig {
                env: Some(strings(&["NGINX_VERSION=1.27.0", "TZ=Europe/Berlin"])),
                cmd: Some(strings(&["nginx", "-g", "daemon off;"])),
                entrypoint: Some(strings(&["/docker-entrypoint.sh"])),
                labels: Some(HashMap::from([
                    ("org.opencontainers.image.version".to_string(), "1.27.0".to_string()),
                    ("traefik.enable".to_string(), "true".to_string()),
                ])),
                exposed_ports: Some(HashMap::from([
                    ("80/tcp".to_string(), HashMap::new()),
                    ("8080/tcp".to_string(), HashMap::new()),
                ])),
                ..Default::default()
            },
            ..Default::default()
        };
        let image = ImageDefaults {
            env: strings(&["NGINX_VERSION=1.27.0"]),
            cmd: Some(strings(&["nginx", "-g", "daemon off;"])),
            entrypoint: Some(strings(&["/docker-entrypoint.sh"])),
            labels: HashMap::from([(
                "org.opencontainers.image.version".to_string(),
                "1.27.0".to_string(),
            )]),
            exposed_ports: strings(&["80/tcp"]),
        };

        let config = template.without_image_defaults(&image).config;
        assert_eq!(config.env, Some(strings(&["TZ=Europe/Berlin"])));
        assert_eq!(config.cmd, None);
        assert_eq!(config.entrypoint, None);
        let labels = config.labels.unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels["traefik.enable"], "true");
        let ports: Vec<_> = config.exposed_ports.unwrap().into_keys().collect();
        assert_eq!(ports, vec!["8080/tcp".to_string()]);
    }

    #[test]
    fn explicit_cmd_survives_an_overridden_entrypoint() {
        let cmd = Some(strings(&["nginx", "-g", "daemon off;"]));
        let template = ContainerTemplate {
            config: ContainerConfig {
                cmd: cmd.clone(),
                entrypoint: Some(strings(&["/bin/sh", "-c"])),
                ..Default::default()
            },
            ..Default::default()
        };
        let image = ImageDefaults {
            cmd: cmd.clone(),
            entrypoint: Some(strings(&["/docker-entrypoint.sh"])),
            ..Default::default()
        };

        let config = template.without_image_defaults(&image).config;
        assert_eq!(config.cmd, cmd);
        assert_eq!(config.entrypoint, Some(strings(&["/bin/sh", "-c"])));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_turns_elapsed_deadline_into_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, EngineError>(())
        };
        let result = bounded(Duration::from_secs(1), slow).await;
        assert_eq!(result, Err(EngineError::Timeout(Duration::from_secs(1))));
    }
}
