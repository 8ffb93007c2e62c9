//! Docker daemon client for provisioning service containers

use crate::spec::{ContainerSpec, MANAGED_LABEL, SERVICE_LABEL, SPEC_HASH_LABEL};
use crate::tunnel::{DockerHost, SshTunnel, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REMOTE_SOCKET};
use anyhow::Context;
use bollard::container::{
    CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::EndpointSettings;
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

/// Networks provided by the daemon itself
const BUILTIN_NETWORKS: &[&str] = &["host", "bridge", "none"];

/// When to pull a service image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum PullPolicy {
    /// Pull on every run; containers on a moved tag are replaced
    Always,
    /// Pull only when the image is absent on the host
    #[default]
    IfNotPresent,
}

/// A container found on the daemon under a service name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedContainer {
    pub id: String,
    /// Image reference the container was created with
    pub image: String,
    /// Image ID the container runs
    pub image_id: Option<String>,
    /// Value of the spec fingerprint label, when present
    pub fingerprint: Option<String>,
    pub running: bool,
}

/// A container carrying the management label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub service: Option<String>,
}

/// Whether `name` is a network the daemon always provides
pub fn is_builtin_network(name: &str) -> bool {
    BUILTIN_NETWORKS.contains(&name)
}

/// Remedy for daemon and registry failures seen in practice
fn failure_hint(message: &str) -> Option<&'static str> {
    if message.contains("port is already allocated")
        || message.contains("address already in use")
    {
        Some("a published port is already in use on the Docker host")
    } else if message.contains("Conflict") && message.contains("name") {
        Some("another container already uses this name; remove it with 'docker rm -f'")
    } else if message.contains("manifest unknown") {
        Some("the tag does not exist in the registry; check the image versions file")
    } else if message.contains("unauthorized") || message.contains("authentication") {
        Some("the registry requires a login; run 'docker login' on the Docker host")
    } else {
        None
    }
}

/// Error for a failed daemon call, with a remedy when one is known
fn docker_error(action: impl fmt::Display, err: impl fmt::Display) -> anyhow::Error {
    let message = err.to_string();
    match failure_hint(&message) {
        Some(hint) => anyhow::anyhow!("{}: {} ({})", action, message, hint),
        None => anyhow::anyhow!("{}: {}", action, message),
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Connection to the Docker daemon, optionally through an SSH tunnel
pub struct DockerManager {
    client: Docker,
    tunnel: Option<SshTunnel>,
}

impl DockerManager {
    /// Connect to `host` and verify the daemon responds
    pub async fn connect(host: &DockerHost) -> anyhow::Result<Self> {
        let (client, tunnel) = match host {
            DockerHost::Ssh(target) => {
                let tunnel =
                    SshTunnel::open(target, DEFAULT_REMOTE_SOCKET, DEFAULT_CONNECT_TIMEOUT).await?;
                let socket = tunnel.socket_path().to_string_lossy().into_owned();
                let client = connect_socket(&socket)
                    .with_context(|| format!("Cannot use forwarded Docker socket '{}'", socket))?;
                (client, Some(tunnel))
            }
            DockerHost::Unix(path) => {
                let socket = path.to_string_lossy();
                let client = connect_socket(&socket)
                    .with_context(|| format!("Cannot connect to Unix socket '{}'", socket))?;
                (client, None)
            }
            DockerHost::Tcp(url) => {
                let client = Docker::connect_with_http(url, 120, bollard::API_DEFAULT_VERSION)
                    .with_context(|| format!("Cannot connect to TCP endpoint '{}'", url))?;
                (client, None)
            }
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon at '{}' is not responding: {}. \
                 Ensure dockerd is running and the user may access its socket.",
                host,
                e
            )
        })?;

        match client.version().await {
            Ok(version) => info!(
                host = %host,
                version = version.version.as_deref().unwrap_or("unknown"),
                api = version.api_version.as_deref().unwrap_or("unknown"),
                "Connected to Docker daemon"
            ),
            Err(e) => debug!(host = %host, error = %e, "Connected, but daemon version unavailable"),
        }

        Ok(Self { client, tunnel })
    }

    /// Pull `image` according to `policy`
    pub async fn pull_image(&self, image: &str, policy: PullPolicy) -> anyhow::Result<()> {
        if policy == PullPolicy::IfNotPresent && self.image_id(image).await?.is_some() {
            debug!(image, "Image exists on host, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let progress =
                result.map_err(|e| docker_error(format!("Failed to pull image '{}'", image), e))?;
            if let Some(error) = progress.error {
                return Err(docker_error(format!("Failed to pull image '{}'", image), error));
            }
            if let Some(status) = progress.status {
                debug!(image, status, "Pull progress");
            }
        }

        info!(image, "Image pulled");
        Ok(())
    }

    /// ID of the local image `image` resolves to, if it is present
    pub async fn image_id(&self, image: &str) -> anyhow::Result<Option<String>> {
        match self.client.inspect_image(image).await {
            Ok(info) => Ok(info.id),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(docker_error(format!("Failed to inspect image '{}'", image), e)),
        }
    }

    /// Create the bridge network `name` unless it exists
    pub async fn ensure_network(&self, name: &str) -> anyhow::Result<()> {
        if is_builtin_network(name) {
            return Ok(());
        }

        match self.client.inspect_network::<String>(name, None).await {
            Ok(_) => {
                debug!(network = name, "Network already exists");
                return Ok(());
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => {
                let action = format!("Failed to inspect network '{}'", name);
                return Err(docker_error(action, e));
            }
        }

        info!(network = name, "Creating Docker network");
        let options = CreateNetworkOptions {
            name,
            driver: "bridge",
            ..Default::default()
        };
        self.client
            .create_network(options)
            .await
            .map_err(|e| docker_error(format!("Failed to create network '{}'", name), e))?;

        Ok(())
    }

    /// Look up the container named `name`
    pub async fn inspect(&self, name: &str) -> anyhow::Result<Option<ObservedContainer>> {
        let info = match self
            .client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => {
                let action = format!("Failed to inspect container '{}'", name);
                return Err(docker_error(action, e));
            }
        };

        let config = info.config.unwrap_or_default();
        let fingerprint = config
            .labels
            .as_ref()
            .and_then(|labels| labels.get(SPEC_HASH_LABEL))
            .cloned();
        Ok(Some(ObservedContainer {
            id: info.id.unwrap_or_default(),
            image: config.image.unwrap_or_default(),
            image_id: info.image,
            fingerprint,
            running: info.state.and_then(|s| s.running).unwrap_or(false),
        }))
    }

    /// Create a container from `spec`, attach its networks and start it
    pub async fn create_and_start(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), spec.to_container_config())
            .await
            .map_err(|e| {
                let action = format!(
                    "Failed to create container '{}' from image '{}'",
                    spec.name, spec.image
                );
                docker_error(action, e)
            })?;

        let container_id = response.id;
        info!(service = %spec.name, container_id, image = %spec.image, "Created container");

        // The first network is set as network mode at create time
        for network in spec.effective_networks().iter().skip(1) {
            let options = ConnectNetworkOptions {
                container: container_id.clone(),
                endpoint_config: EndpointSettings::default(),
            };
            if let Err(e) = self.client.connect_network(network, options).await {
                let action = format!("Failed to attach '{}' to network '{}'", spec.name, network);
                return Err(docker_error(action, e));
            }
            debug!(service = %spec.name, network, "Attached network");
        }

        self.start(&spec.name).await?;
        Ok(container_id)
    }

    /// Start an existing container
    pub async fn start(&self, name: &str) -> anyhow::Result<()> {
        self.client
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| docker_error(format!("Failed to start container '{}'", name), e))?;

        info!(service = name, "Started container");
        Ok(())
    }

    /// Force-remove a container, returning whether it existed
    pub async fn remove(&self, name: &str) -> anyhow::Result<bool> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(name, Some(options)).await {
            Ok(()) => {
                info!(service = name, "Removed container");
                Ok(true)
            }
            Err(e) if is_not_found(&e) => {
                debug!(service = name, "Container not found");
                Ok(false)
            }
            Err(e) => Err(docker_error(format!("Failed to remove container '{}'", name), e)),
        }
    }

    /// Containers created by this tool, running or not
    pub async fn list_managed(&self) -> anyhow::Result<Vec<ManagedContainer>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| docker_error("Failed to list managed containers", e))?;

        Ok(summaries
            .into_iter()
            .map(|summary| {
                let name = summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|name| name.trim_start_matches('/').to_string())
                    .unwrap_or_default();
                let service = summary
                    .labels
                    .and_then(|mut labels| labels.remove(SERVICE_LABEL));
                ManagedContainer {
                    id: summary.id.unwrap_or_default(),
                    name,
                    service,
                }
            })
            .collect())
    }

    /// Release the connection, stopping the SSH tunnel if one was opened
    pub async fn close(self) {
        if let Some(tunnel) = self.tunnel {
            tunnel.close().await;
        }
    }
}

fn connect_socket(path: &str) -> Result<Docker, DockerError> {
    Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
}
