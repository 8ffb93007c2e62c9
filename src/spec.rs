//! Declarative container specifications
//!
//! A [`ContainerSpec`] describes one service the way it should exist on the
//! Docker host. It is translated to a Docker Engine create body by
//! [`ContainerSpec::to_container_config`] and identified across runs by its
//! [`fingerprint`](ContainerSpec::fingerprint), which is stored on the
//! container as a label.

use crate::error::SpecError;
use bollard::container::Config;
use bollard::models::{
    HostConfig, PortBinding, RestartPolicy as DockerRestartPolicy, RestartPolicyNameEnum,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Network joined by containers that do not name one
pub const PROXY_NETWORK: &str = "proxy";

/// Marks containers owned by this tool
pub const MANAGED_LABEL: &str = "homelab.managed";
/// Service name the container was created for
pub const SERVICE_LABEL: &str = "homelab.service";
/// Fingerprint of the spec the container was created from
pub const SPEC_HASH_LABEL: &str = "homelab.spec-hash";

/// Environment keys whose values are masked when a spec is rendered
const SENSITIVE_ENV_MARKERS: &[&str] = &["PASSWORD", "SECRET", "KEY", "DATABASE_URL"];

/// Container restart policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    Always,
    OnFailure,
    #[default]
    UnlessStopped,
}

impl RestartPolicy {
    fn to_docker(self) -> DockerRestartPolicy {
        let name = match self {
            RestartPolicy::No => RestartPolicyNameEnum::NO,
            RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
            RestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
            RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        };
        DockerRestartPolicy {
            name: Some(name),
            maximum_retry_count: None,
        }
    }
}

/// A bind mount from the Docker host into the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

impl VolumeMount {
    pub fn new(host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }

    pub fn read_only(host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            read_only: true,
            ..Self::new(host_path, container_path)
        }
    }

    /// Docker bind string (`host:container[:ro]`)
    pub fn bind(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.host_path, self.container_path)
        } else {
            format!("{}:{}", self.host_path, self.container_path)
        }
    }
}

/// Desired state of a single service container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerSpec {
    /// Container name, unique on the host
    pub name: String,
    /// Image reference to run
    pub image: String,
    /// Port the service listens on inside the container
    pub internal_port: Option<u16>,
    /// Host port published for `internal_port`
    pub external_port: Option<u16>,
    /// Base domain for the Traefik router
    pub domain_name: String,
    /// Router and service name for Traefik; routing is off when empty
    pub service_name: String,
    pub environment: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    /// Networks to join; [`PROXY_NETWORK`] when empty
    pub networks: Vec<String>,
    /// Explicit network mode such as `host`, overrides `networks`
    pub network_mode: Option<String>,
    pub restart: RestartPolicy,
    /// Labels merged over the routing labels
    pub extra_labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        if self.name.is_empty() {
            return Err(SpecError::EmptyName);
        }
        if self.image.is_empty() {
            return Err(SpecError::EmptyImage(self.name.clone()));
        }
        for volume in &self.volumes {
            if volume.host_path.is_empty() {
                return Err(SpecError::EmptyVolumePath {
                    name: self.name.clone(),
                    field: "host path",
                });
            }
            if volume.container_path.is_empty() {
                return Err(SpecError::EmptyVolumePath {
                    name: self.name.clone(),
                    field: "container path",
                });
            }
        }
        if self.routed() && self.internal_port.unwrap_or(0) == 0 {
            return Err(SpecError::MissingRoutePort(self.name.clone()));
        }
        Ok(())
    }

    /// Whether Traefik routing labels are generated
    pub fn routed(&self) -> bool {
        !self.service_name.is_empty() && !self.domain_name.is_empty()
    }

    /// Networks the container is attached to
    pub fn effective_networks(&self) -> Vec<String> {
        if self.network_mode.is_some() {
            Vec::new()
        } else if self.networks.is_empty() {
            vec![PROXY_NETWORK.to_string()]
        } else {
            self.networks.clone()
        }
    }

    /// Host port binding as `(internal, external)`, when both are set
    pub fn port_binding(&self) -> Option<(u16, u16)> {
        match (self.internal_port, self.external_port) {
            (Some(internal), Some(external)) if internal > 0 && external > 0 => {
                Some((internal, external))
            }
            _ => None,
        }
    }

    /// Routing labels followed by the extra labels, without management labels
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        if self.routed() {
            let port = self.internal_port.unwrap_or(0);
            labels.extend(traefik_labels(&self.service_name, &self.domain_name, port));
            labels.extend(self.extra_labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        labels
    }

    /// SHA-256 of the canonical JSON form of this spec
    pub fn fingerprint(&self) -> String {
        // Maps are ordered so serialisation is stable across runs
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }

    /// Docker Engine create body for this spec
    pub fn to_container_config(&self) -> Config<String> {
        let mut labels: HashMap<String, String> = self.labels().into_iter().collect();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(SERVICE_LABEL.to_string(), self.name.clone());
        labels.insert(SPEC_HASH_LABEL.to_string(), self.fingerprint());

        let env: Vec<String> = self
            .environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let binds: Vec<String> = self.volumes.iter().map(VolumeMount::bind).collect();

        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        if let Some(internal) = self.internal_port.filter(|p| *p > 0) {
            exposed_ports.insert(format!("{}/tcp", internal), HashMap::new());
        }
        if let Some((internal, external)) = self.port_binding() {
            port_bindings.insert(
                format!("{}/tcp", internal),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(external.to_string()),
                }]),
            );
        }

        let network_mode = self
            .network_mode
            .clone()
            .or_else(|| self.effective_networks().into_iter().next());

        let host_config = HostConfig {
            binds: (!binds.is_empty()).then_some(binds),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            restart_policy: Some(self.restart.to_docker()),
            network_mode,
            ..Default::default()
        };

        Config {
            image: Some(self.image.clone()),
            env: (!env.is_empty()).then_some(env),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    /// Copy of this spec with sensitive environment values masked
    pub fn redacted(&self) -> Self {
        let mut spec = self.clone();
        for (key, value) in spec.environment.iter_mut() {
            let upper = key.to_uppercase();
            if SENSITIVE_ENV_MARKERS.iter().any(|m| upper.contains(m)) {
                *value = "<redacted>".to_string();
            }
        }
        spec
    }
}

/// Traefik labels routing `{service}.{domain}` to `port`
pub fn traefik_labels(
    service_name: &str,
    domain_name: &str,
    port: u16,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("traefik.enable".to_string(), "true".to_string()),
        (
            format!("traefik.http.routers.{}.rule", service_name),
            format!("Host(`{}.{}`)", service_name, domain_name),
        ),
        (
            format!("traefik.http.services.{}.loadbalancer.server.port", service_name),
            port.to_string(),
        ),
    ])
}

/// Validate every spec and reject duplicate container names
pub fn validate_all(specs: &[ContainerSpec]) -> Result<(), SpecError> {
    let mut seen = HashSet::new();
    for spec in specs {
        spec.validate()?;
        if !seen.insert(spec.name.as_str()) {
            return Err(SpecError::DuplicateName(spec.name.clone()));
        }
    }
    Ok(())
}
