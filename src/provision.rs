//! Sequential provisioning of container specs against a Docker daemon
//!
//! Each spec is compared with the container of the same name through the
//! fingerprint label written at create time. A container whose fingerprint
//! differs is replaced as a whole; there is no partial update. A container
//! whose image ID no longer matches the one its tag resolves to on the host
//! is replaced too, so a re-pushed tag takes effect.

use crate::docker::{DockerManager, ObservedContainer, PullPolicy};
use crate::spec::{validate_all, ContainerSpec};
use std::fmt;
use tracing::{info, warn};

/// What a run does for one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// No container with this name exists
    Create,
    /// The container differs from the spec and is recreated
    Replace { reason: String },
    /// The container matches but is stopped
    Start,
    Unchanged,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => f.write_str("create"),
            Action::Replace { reason } => write!(f, "replace ({})", reason),
            Action::Start => f.write_str("start"),
            Action::Unchanged => f.write_str("unchanged"),
        }
    }
}

/// Decide the action bringing `observed` in line with `desired`
///
/// `current_image_id` is the ID the desired image reference resolves to on
/// the host, when known.
pub fn plan_action(
    desired: &ContainerSpec,
    observed: Option<&ObservedContainer>,
    current_image_id: Option<&str>,
) -> Action {
    let Some(observed) = observed else {
        return Action::Create;
    };

    match observed.fingerprint.as_deref() {
        None => Action::Replace {
            reason: "container is not managed by homelab".to_string(),
        },
        Some(fingerprint) if fingerprint != desired.fingerprint() => {
            let reason = if observed.image != desired.image {
                format!("image {} -> {}", observed.image, desired.image)
            } else {
                "configuration changed".to_string()
            };
            Action::Replace { reason }
        }
        Some(_) if image_moved(observed.image_id.as_deref(), current_image_id) => {
            Action::Replace {
                reason: "image updated".to_string(),
            }
        }
        Some(_) if !observed.running => Action::Start,
        Some(_) => Action::Unchanged,
    }
}

fn image_moved(running: Option<&str>, current: Option<&str>) -> bool {
    matches!((running, current), (Some(running), Some(current)) if running != current)
}

/// Actions taken (or planned) per service, in provisioning order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub actions: Vec<(String, Action)>,
}

impl ApplySummary {
    /// Number of services that were (or would be) touched
    pub fn changed(&self) -> usize {
        self.actions
            .iter()
            .filter(|(_, action)| *action != Action::Unchanged)
            .count()
    }
}

impl fmt::Display for ApplySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .actions
            .iter()
            .map(|(name, _)| name.len())
            .max()
            .unwrap_or(0);
        for (name, action) in &self.actions {
            writeln!(f, "  {:width$}  {}", name, action, width = width)?;
        }
        write!(
            f,
            "{} service(s), {} change(s)",
            self.actions.len(),
            self.changed()
        )
    }
}

/// Drives specs onto a connected daemon one at a time
pub struct Provisioner<'a> {
    docker: &'a DockerManager,
    pull_policy: PullPolicy,
}

impl<'a> Provisioner<'a> {
    pub fn new(docker: &'a DockerManager, pull_policy: PullPolicy) -> Self {
        Self {
            docker,
            pull_policy,
        }
    }

    /// Plan every spec without changing the host
    pub async fn preview(&self, specs: &[ContainerSpec]) -> anyhow::Result<ApplySummary> {
        validate_all(specs)?;

        let mut summary = ApplySummary::default();
        for spec in specs {
            let observed = self.docker.inspect(&spec.name).await?;
            let image_id = self.docker.image_id(&spec.image).await?;
            let action = plan_action(spec, observed.as_ref(), image_id.as_deref());
            info!(service = %spec.name, action = %action, "Planned");
            summary.actions.push((spec.name.clone(), action));
        }
        Ok(summary)
    }

    /// Bring every spec into effect; the first failure aborts the run
    pub async fn apply(&self, specs: &[ContainerSpec]) -> anyhow::Result<ApplySummary> {
        validate_all(specs)?;

        let mut summary = ApplySummary::default();
        for spec in specs {
            let action = self.apply_one(spec).await?;
            summary.actions.push((spec.name.clone(), action));
        }
        Ok(summary)
    }

    async fn apply_one(&self, spec: &ContainerSpec) -> anyhow::Result<Action> {
        self.docker.pull_image(&spec.image, self.pull_policy).await?;
        for network in spec.effective_networks() {
            self.docker.ensure_network(&network).await?;
        }

        let observed = self.docker.inspect(&spec.name).await?;
        let image_id = self.docker.image_id(&spec.image).await?;
        let action = plan_action(spec, observed.as_ref(), image_id.as_deref());

        match &action {
            Action::Create => {
                self.docker.create_and_start(spec).await?;
            }
            Action::Replace { reason } => {
                info!(service = %spec.name, reason = %reason, "Replacing container");
                self.docker.remove(&spec.name).await?;
                self.docker.create_and_start(spec).await?;
            }
            Action::Start => {
                self.docker.start(&spec.name).await?;
            }
            Action::Unchanged => {
                info!(service = %spec.name, "Container up to date");
            }
        }

        Ok(action)
    }

    /// Remove managed containers named in `services`, or all of them when empty
    pub async fn destroy(&self, services: &[String]) -> anyhow::Result<Vec<String>> {
        let managed = self.docker.list_managed().await?;

        for requested in services {
            if !managed.iter().any(|c| &c.name == requested) {
                warn!(service = %requested, "No managed container with this name");
            }
        }

        let mut removed = Vec::new();
        for container in managed {
            if !services.is_empty() && !services.contains(&container.name) {
                continue;
            }
            if self.docker.remove(&container.name).await? {
                removed.push(container.name);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired() -> ContainerSpec {
        ContainerSpec {
            internal_port: Some(80),
            domain_name: "home.example.com".into(),
            service_name: "whoami".into(),
            ..ContainerSpec::new("whoami", "traefik/whoami:v1.10")
        }
    }

    fn observed(spec: &ContainerSpec, running: bool) -> ObservedContainer {
        ObservedContainer {
            id: "abc123".into(),
            image: spec.image.clone(),
            image_id: Some("sha256:aaaa".into()),
            fingerprint: Some(spec.fingerprint()),
            running,
        }
    }

    #[test]
    fn test_plan_create_when_absent() {
        assert_eq!(plan_action(&desired(), None, None), Action::Create);
    }

    #[test]
    fn test_plan_unchanged_when_fingerprint_matches() {
        let spec = desired();
        let action = plan_action(&spec, Some(&observed(&spec, true)), Some("sha256:aaaa"));
        assert_eq!(action, Action::Unchanged);
    }

    #[test]
    fn test_plan_start_when_stopped() {
        let spec = desired();
        let action = plan_action(&spec, Some(&observed(&spec, false)), None);
        assert_eq!(action, Action::Start);
    }

    #[test]
    fn test_plan_replace_on_image_bump() {
        let old = desired();
        let mut new = desired();
        new.image = "traefik/whoami:v1.11".into();

        let action = plan_action(&new, Some(&observed(&old, true)), None);
        assert_eq!(
            action,
            Action::Replace {
                reason: "image traefik/whoami:v1.10 -> traefik/whoami:v1.11".into()
            }
        );
    }

    #[test]
    fn test_plan_replace_on_config_change() {
        let old = desired();
        let mut new = desired();
        new.environment.insert("WHOAMI_NAME".into(), "lab".into());

        assert_eq!(
            plan_action(&new, Some(&observed(&old, false)), None),
            Action::Replace {
                reason: "configuration changed".into()
            }
        );
    }

    #[test]
    fn test_plan_replace_when_tag_moved() {
        let spec = desired();
        let deployed = observed(&spec, true);

        assert_eq!(
            plan_action(&spec, Some(&deployed), Some("sha256:bbbb")),
            Action::Replace {
                reason: "image updated".into()
            }
        );
        // a stopped container on a moved tag is replaced, not just started
        assert_eq!(
            plan_action(&spec, Some(&observed(&spec, false)), Some("sha256:bbbb")),
            Action::Replace {
                reason: "image updated".into()
            }
        );
    }

    #[test]
    fn test_plan_ignores_unknown_image_ids() {
        let spec = desired();
        let mut deployed = observed(&spec, true);
        assert_eq!(plan_action(&spec, Some(&deployed), None), Action::Unchanged);

        deployed.image_id = None;
        assert_eq!(
            plan_action(&spec, Some(&deployed), Some("sha256:bbbb")),
            Action::Unchanged
        );
    }

    #[test]
    fn test_plan_replace_unmanaged_container() {
        let spec = desired();
        let mut foreign = observed(&spec, true);
        foreign.fingerprint = None;

        assert!(matches!(
            plan_action(&spec, Some(&foreign), None),
            Action::Replace { .. }
        ));
    }

    #[test]
    fn test_summary_display() {
        let summary = ApplySummary {
            actions: vec![
                ("whoami".into(), Action::Unchanged),
                ("beszel-agent".into(), Action::Create),
            ],
        };
        assert_eq!(summary.changed(), 1);
        assert_eq!(
            summary.to_string(),
            "  whoami        unchanged\n  beszel-agent  create\n2 service(s), 1 change(s)"
        );
    }
}
