use super::{
    ContainerDetails, ContainerRuntime, ContainerSummary, ContainerTemplate, ImageDefaults,
    ListFilter, LocalImage,
};
use crate::config::RegistryCredentials;
use crate::error::EngineError;
use crate::types::{ContainerStatus, Digest, HealthState, ImageReference};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::{CreateImageOptions, PruneImagesOptions, TagImageOptions};
use bollard::models::{
    ContainerConfig, ContainerState, ContainerStateStatusEnum, EndpointSettings,
    HealthStatusEnum,
};
use bollard::network::ConnectNetworkOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, info};
use std::collections::HashMap;
use std::time::Duration;

/// Docker (or Podman in Docker-compatible mode) over its control socket.
pub struct DockerRuntime {
    docker: Docker,
    credentials: Option<RegistryCredentials>,
}

impl DockerRuntime {
    /// Connects using the local defaults: the unix socket on Linux, or
    /// whatever `DOCKER_HOST` points at.
    pub fn connect(credentials: Option<RegistryCredentials>) -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            credentials,
        })
    }

    pub async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await?;
        debug!("Container engine ping successful");
        Ok(())
    }

    /// Credentials apply to the configured registry only, or to every
    /// registry when no server is configured.
    fn credentials_for(&self, reference: &ImageReference) -> Option<DockerCredentials> {
        let credentials = self.credentials.as_ref()?;
        if let Some(server) = &credentials.server {
            if server != reference.registry() {
                return None;
            }
        }
        Some(DockerCredentials {
            username: Some(credentials.username.clone()),
            password: Some(credentials.password.clone()),
            serveraddress: credentials.server.clone(),
            ..Default::default()
        })
    }
}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 401 | 403,
                message,
            } => EngineError::Unauthorized(message),
            other => EngineError::Api(other.to_string()),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(
        &self,
        filter: &ListFilter,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        let filters = match filter {
            ListFilter::Names(names) => HashMap::from([("name".to_string(), names.clone())]),
            ListFilter::Label { key, value } => {
                HashMap::from([("label".to_string(), vec![format!("{}={}", key, value)])])
            }
        };
        let opts = ListContainersOptions::<String> {
            all: false,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;

        let mut summaries = Vec::with_capacity(containers.len());
        for c in containers {
            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string());
            let (Some(name), Some(id)) = (name, c.id) else {
                continue;
            };
            summaries.push(ContainerSummary {
                id,
                name,
                labels: c.labels.unwrap_or_default(),
            });
        }
        Ok(summaries)
    }

    async fn inspect_container(&self, name_or_id: &str) -> Result<ContainerDetails, EngineError> {
        let detail = self
            .docker
            .inspect_container(name_or_id, None::<InspectContainerOptions>)
            .await?;

        let id = detail
            .id
            .ok_or_else(|| EngineError::Api(format!("container {} has no id", name_or_id)))?;
        let name = detail
            .name
            .as_deref()
            .unwrap_or(name_or_id)
            .trim_start_matches('/')
            .to_string();
        let config = detail.config.unwrap_or_default();
        let (status, health) = match &detail.state {
            Some(state) => (status_of(state), health_of(state)),
            None => (ContainerStatus::Exited, None),
        };
        let networks = detail
            .network_settings
            .and_then(|s| s.networks)
            .unwrap_or_default();

        Ok(ContainerDetails {
            image: config.image.clone().unwrap_or_default(),
            image_id: detail.image.unwrap_or_default(),
            status,
            health,
            labels: config.labels.clone().unwrap_or_default(),
            template: ContainerTemplate {
                name: name.clone(),
                source_id: id.clone(),
                config,
                host_config: detail.host_config,
                networks,
            },
            id,
            name,
        })
    }

    async fn inspect_image(&self, image: &str) -> Result<LocalImage, EngineError> {
        let inspect = self.docker.inspect_image(image).await?;
        Ok(LocalImage {
            id: inspect.id.unwrap_or_default(),
            repo_digests: inspect.repo_digests.unwrap_or_default(),
            defaults: inspect.config.map(image_defaults).unwrap_or_default(),
        })
    }

    async fn distribution_digest(
        &self,
        reference: &ImageReference,
    ) -> Result<Digest, EngineError> {
        let inspect = self
            .docker
            .inspect_registry_image(&reference.to_string(), self.credentials_for(reference))
            .await?;
        let digest = inspect.descriptor.digest.ok_or_else(|| {
            EngineError::Api(format!("registry returned no digest for {}", reference))
        })?;
        Digest::parse(&digest).map_err(|e| EngineError::Api(e.to_string()))
    }

    async fn pull_image(&self, reference: &ImageReference) -> Result<(), EngineError> {
        let from_image = reference.to_string();
        info!("Pulling image: {}", from_image);

        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: from_image.as_str(),
                ..Default::default()
            }),
            None,
            self.credentials_for(reference),
        );

        while let Some(result) = stream.next().await {
            let info = result?;
            if let Some(error) = info.error {
                return Err(EngineError::Api(error));
            }
            if let Some(status) = info.status {
                debug!("Pull {}: {}", from_image, status);
            }
        }
        Ok(())
    }

    async fn tag_image(
        &self,
        image_id: &str,
        reference: &ImageReference,
    ) -> Result<(), EngineError> {
        self.docker
            .tag_image(
                image_id,
                Some(TagImageOptions {
                    repo: reference.name(),
                    tag: reference.tag().to_string(),
                }),
            )
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), EngineError> {
        let opts = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(opts)).await {
            // 304: already stopped
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let opts = RemoveContainerOptions {
            force,
            v: false,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(opts)).await?;
        Ok(())
    }

    async fn create_container(
        &self,
        template: &ContainerTemplate,
        image: &str,
    ) -> Result<String, EngineError> {
        let mut config: Config<String> = template.config.clone().into();
        config.image = Some(image.to_string());
        config.host_config = template.host_config.clone();

        let network_mode = template
            .host_config
            .as_ref()
            .and_then(|h| h.network_mode.clone())
            .unwrap_or_default();
        let shares_namespace = network_mode == "host" || network_mode.starts_with("container:");
        let short_id = template.source_id.get(..12).unwrap_or(&template.source_id);

        // The engine sets the hostname to the short id unless one was given.
        if shares_namespace || config.hostname.as_deref() == Some(short_id) {
            config.hostname = None;
        }

        let mut networks: Vec<(String, EndpointSettings)> =
            if shares_namespace || network_mode == "none" {
                Vec::new()
            } else {
                template
                    .networks
                    .iter()
                    .map(|(name, endpoint)| (name.clone(), reusable_endpoint(endpoint, short_id)))
                    .collect()
            };
        networks.sort_by(|a, b| a.0.cmp(&b.0));

        // Older engines accept a single network at creation; the rest are
        // connected before start.
        let primary = networks
            .iter()
            .position(|(name, _)| *name == network_mode)
            .unwrap_or(0);
        if !networks.is_empty() {
            let (name, endpoint) = networks.remove(primary);
            config.networking_config = Some(NetworkingConfig {
                endpoints_config: HashMap::from([(name, endpoint)]),
            });
        }

        let opts = CreateContainerOptions {
            name: template.name.clone(),
            platform: None,
        };
        let response = self.docker.create_container(Some(opts), config).await?;

        for (network, endpoint) in networks {
            debug!("Connecting {} to network {}", template.name, network);
            self.docker
                .connect_network(
                    &network,
                    ConnectNetworkOptions {
                        container: response.id.clone(),
                        endpoint_config: endpoint,
                    },
                )
                .await?;
        }

        info!("Created container: {} ({})", template.name, response.id);
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn prune_dangling_images(&self) -> Result<u64, EngineError> {
        let opts = PruneImagesOptions {
            filters: HashMap::from([("dangling", vec!["true"])]),
        };
        let response = self.docker.prune_images(Some(opts)).await?;
        Ok(response.space_reclaimed.unwrap_or(0).max(0) as u64)
    }
}

fn status_of(state: &ContainerState) -> ContainerStatus {
    match state.status {
        Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
        Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
        Some(ContainerStateStatusEnum::PAUSED) => ContainerStatus::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Restarting,
        Some(ContainerStateStatusEnum::DEAD) => ContainerStatus::Dead,
        _ if state.running.unwrap_or(false) => ContainerStatus::Running,
        _ => ContainerStatus::Exited,
    }
}

fn health_of(state: &ContainerState) -> Option<HealthState> {
    match state.health.as_ref()?.status.as_ref()? {
        HealthStatusEnum::STARTING => Some(HealthState::Starting),
        HealthStatusEnum::HEALTHY => Some(HealthState::Healthy),
        HealthStatusEnum::UNHEALTHY => Some(HealthState::Unhealthy),
        _ => None,
    }
}

fn image_defaults(config: ContainerConfig) -> ImageDefaults {
    ImageDefaults {
        env: config.env.unwrap_or_default(),
        cmd: config.cmd,
        entrypoint: config.entrypoint,
        labels: config.labels.unwrap_or_default(),
        exposed_ports: config
            .exposed_ports
            .map(|ports| ports.into_keys().collect())
            .unwrap_or_default(),
    }
}

/// Keeps the operator-set parts of an endpoint and drops what the engine
/// assigned to the old container (ids, addresses, the short-id alias).
fn reusable_endpoint(endpoint: &EndpointSettings, short_id: &str) -> EndpointSettings {
    EndpointSettings {
        ipam_config: endpoint.ipam_config.clone(),
        links: endpoint.links.clone(),
        aliases: endpoint.aliases.as_ref().map(|aliases| {
            aliases
                .iter()
                .filter(|alias| alias.as_str() != short_id)
                .cloned()
                .collect()
        }),
        driver_opts: endpoint.driver_opts.clone(),
        ..Default::default()
    }
}
