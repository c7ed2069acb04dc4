//! Core types for agent templates.

use serde::{Deserialize, Serialize};

/// Sentinel for an uncapped instance limit.
pub const UNCAPPED: u32 = u32::MAX;

/// A template describing how to build one provisioned agent.
///
/// Templates are configuration data, owned by the backend configuration and
/// mutated only through configuration changes. During provisioning they are
/// read-only; resolution produces a fresh resolved copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentTemplate {
    /// Template name, unique within a backend.
    pub name: String,
    /// Label selector used by the work queue to match this template.
    pub label: String,
    /// Namespace override; falls back to the backend namespace when empty.
    pub namespace: Option<String>,
    /// Ordered names of ancestor templates to inherit from.
    pub inherit_from: Vec<String>,
    /// Container definitions, in declaration order.
    pub containers: Vec<ContainerTemplate>,
    /// Volume declarations, keyed by normalised mount path.
    pub volumes: Vec<VolumeTemplate>,
    /// Template-scoped environment variables, applied to every container.
    pub env: Vec<TemplateEnv>,
    /// Pod annotations.
    pub annotations: Vec<Annotation>,
    /// Node selector expression (empty = unset).
    pub node_selector: String,
    /// Service account to run the pod as (empty = unset).
    pub service_account: String,
    /// Maximum concurrent agents from this template.
    #[serde(default = "default_instance_cap")]
    pub instance_cap: u32,
    /// Minutes of idleness before the agent is reaped (0 = unset).
    pub idle_minutes: u32,
    /// Seconds to wait for the agent process to connect (0 = backend default).
    pub connect_timeout_secs: u32,
    /// Raw supplemental pod document fragments, overlaid after construction.
    pub yaml_overrides: Vec<String>,
    /// Set once the template has been merged with its ancestor chain.
    /// A resolved template is never re-resolved.
    #[serde(skip)]
    pub resolved: bool,
}

const fn default_instance_cap() -> u32 {
    UNCAPPED
}

impl AgentTemplate {
    /// Create an empty template with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_cap: UNCAPPED,
            ..Self::default()
        }
    }

    /// Look up a container by name.
    #[must_use]
    pub fn container(&self, name: &str) -> Option<&ContainerTemplate> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// Effective connect timeout, falling back to the given default.
    #[must_use]
    pub const fn connect_timeout_or(&self, default_secs: u32) -> u32 {
        if self.connect_timeout_secs == 0 {
            default_secs
        } else {
            self.connect_timeout_secs
        }
    }
}

/// One container definition within a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerTemplate {
    /// Container name, unique within the template.
    pub name: String,
    /// Container image (empty = unset, inherited from an ancestor).
    pub image: String,
    /// Entrypoint override (empty = unset).
    pub command: Vec<String>,
    /// Arguments (empty = unset).
    pub args: Vec<String>,
    /// Working directory (empty = unset).
    pub working_dir: String,
    /// Allocate a TTY.
    pub tty: Option<bool>,
    /// Container-scoped environment variables.
    pub env: Vec<TemplateEnv>,
    /// Port mappings.
    pub ports: Vec<PortMapping>,
    /// Resource requests and limits.
    pub resources: ResourceSpec,
    /// Security context fields, inherited independently per sub-field.
    pub security: SecuritySpec,
    /// Optional liveness probe.
    pub liveness: Option<LivenessSpec>,
}

impl ContainerTemplate {
    /// Create an empty container definition with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A named environment variable declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateEnv {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

impl TemplateEnv {
    /// Create an environment variable declaration.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A pod annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    /// Annotation key.
    pub key: String,
    /// Annotation value; `${VAR}` references are substituted at build time.
    pub value: String,
}

/// A container port mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortMapping {
    /// Port name (optional; ports without a name are keyed by number).
    pub name: Option<String>,
    /// Port exposed by the container.
    pub container_port: i32,
    /// Host port to map to, if any.
    pub host_port: Option<i32>,
}

impl PortMapping {
    /// Merge key: the port name when present, otherwise the port number.
    #[must_use]
    pub fn key(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.container_port.to_string())
    }
}

/// A volume declaration, keyed by its mount path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeTemplate {
    /// Ephemeral empty directory.
    EmptyDir {
        /// Mount path inside each container.
        mount_path: String,
        /// Back the volume with memory instead of node storage.
        #[serde(default)]
        memory: bool,
    },
    /// Host directory bind mount.
    HostPath {
        /// Mount path inside each container.
        mount_path: String,
        /// Path on the host node.
        host_path: String,
    },
    /// Secret projected as files.
    Secret {
        /// Mount path inside each container.
        mount_path: String,
        /// Name of the secret to project.
        secret_name: String,
    },
    /// ConfigMap projected as files.
    ConfigMap {
        /// Mount path inside each container.
        mount_path: String,
        /// Name of the config map to project.
        config_map_name: String,
    },
}

impl VolumeTemplate {
    /// The declared mount path.
    #[must_use]
    pub fn mount_path(&self) -> &str {
        match self {
            Self::EmptyDir { mount_path, .. }
            | Self::HostPath { mount_path, .. }
            | Self::Secret { mount_path, .. }
            | Self::ConfigMap { mount_path, .. } => mount_path,
        }
    }

    /// Merge key: the mount path with any trailing slash removed.
    #[must_use]
    pub fn normalised_mount_path(&self) -> &str {
        normalise_mount_path(self.mount_path())
    }
}

/// Strip trailing slashes so `/cache` and `/cache/` key the same volume.
#[must_use]
pub fn normalise_mount_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// Resource requests and limits as Kubernetes quantity strings.
///
/// Empty strings are the unset sentinel; blank fields are omitted from the
/// built pod rather than emitted as empty quantities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSpec {
    /// CPU request (for example `500m`).
    pub request_cpu: String,
    /// Memory request (for example `256Mi`).
    pub request_memory: String,
    /// CPU limit.
    pub limit_cpu: String,
    /// Memory limit.
    pub limit_memory: String,
}

impl ResourceSpec {
    /// Returns true when no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.request_cpu.is_empty()
            && self.request_memory.is_empty()
            && self.limit_cpu.is_empty()
            && self.limit_memory.is_empty()
    }
}

/// Security context fields.
///
/// Each sub-field inherits independently; `capabilities_drop` replaces the
/// parent list wholesale when the child provides one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySpec {
    /// Run the container in privileged mode.
    pub privileged: Option<bool>,
    /// UID to run as.
    pub run_as_user: Option<i64>,
    /// GID to run as.
    pub run_as_group: Option<i64>,
    /// Capabilities to add.
    pub capabilities_add: Vec<String>,
    /// Capabilities to drop. Child lists replace parent lists.
    pub capabilities_drop: Vec<String>,
}

impl SecuritySpec {
    /// Returns true when no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.privileged.is_none()
            && self.run_as_user.is_none()
            && self.run_as_group.is_none()
            && self.capabilities_add.is_empty()
            && self.capabilities_drop.is_empty()
    }
}

/// An exec-based liveness probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessSpec {
    /// Command to execute inside the container.
    pub exec_command: Vec<String>,
    /// Seconds to wait before the first probe.
    pub initial_delay_secs: i32,
    /// Probe timeout in seconds.
    pub timeout_secs: i32,
    /// Seconds between probes.
    pub period_secs: i32,
    /// Consecutive failures before the container is restarted.
    pub failure_threshold: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_template_is_uncapped() {
        let template = AgentTemplate::new("base");
        assert_eq!(template.name, "base");
        assert_eq!(template.instance_cap, UNCAPPED);
        assert!(!template.resolved);
    }

    #[test]
    fn connect_timeout_falls_back_to_default() {
        let mut template = AgentTemplate::new("t");
        assert_eq!(template.connect_timeout_or(100), 100);
        template.connect_timeout_secs = 30;
        assert_eq!(template.connect_timeout_or(100), 30);
    }

    #[test]
    fn mount_path_normalisation() {
        assert_eq!(normalise_mount_path("/cache/"), "/cache");
        assert_eq!(normalise_mount_path("/cache"), "/cache");
        assert_eq!(normalise_mount_path("/"), "/");
    }

    #[test]
    fn port_key_prefers_name() {
        let named = PortMapping {
            name: Some("http".to_owned()),
            container_port: 8080,
            host_port: None,
        };
        assert_eq!(named.key(), "http");

        let unnamed = PortMapping {
            name: None,
            container_port: 9090,
            host_port: None,
        };
        assert_eq!(unnamed.key(), "9090");
    }

    #[test]
    fn template_deserialises_from_toml() {
        let toml = r#"
            name = "maven"
            label = "maven linux"
            inherit_from = ["base"]
            instance_cap = 4

            [[containers]]
            name = "maven"
            image = "maven:3.9-eclipse-temurin-17"
            working_dir = "/home/agent/workspace"

            [[volumes]]
            type = "empty_dir"
            mount_path = "/root/.m2"
        "#;

        let template: AgentTemplate = toml::from_str(toml).unwrap();
        assert_eq!(template.name, "maven");
        assert_eq!(template.inherit_from, vec!["base"]);
        assert_eq!(template.instance_cap, 4);
        assert_eq!(template.containers.len(), 1);
        assert_eq!(template.volumes[0].mount_path(), "/root/.m2");
        assert!(!template.resolved);
    }
}
