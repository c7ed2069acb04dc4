//! Pod document construction.
//!
//! [`PodBuilder::build`] is a pure function from a resolved template plus
//! one agent identity to the pod document submitted to the cluster. The
//! same inputs always produce the same document; nothing here does I/O.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    ExecAction, HostPathVolumeSource, Pod, PodSpec, Probe, ResourceRequirements,
    SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use gantry_template::{
    is_valid_quantity, normalise_mount_path, AgentTemplate, ContainerTemplate, LivenessSpec,
    TemplateError, TemplateEnv, VolumeTemplate,
};

use crate::config::BackendConfig;
use crate::error::{ProvisionError, ProvisionResult};
use crate::types::AgentIdentity;

/// Name of the container that runs the agent process.
pub const AGENT_CONTAINER: &str = "agent";

/// Working directory used when a container does not declare one.
pub const DEFAULT_WORKING_DIR: &str = "/home/agent/workspace";

/// Name of the synthesised workspace volume.
const WORKSPACE_VOLUME: &str = "workspace-volume";

/// Label marking pods owned by this provisioner, used for orphan sweeps.
pub const MANAGED_LABEL: &str = "gantry.io/managed";
/// Label carrying the originating template name.
pub const TEMPLATE_LABEL: &str = "gantry.io/template";
/// Label carrying the agent identifier.
pub const AGENT_ID_LABEL: &str = "gantry.io/agent-id";

/// A hook that mutates the built pod document before submission.
///
/// Decorators run in registration order, after structural construction and
/// YAML overlays, so they see the final document.
pub trait PodDecorator: Send + Sync {
    /// Decorator name, for logs.
    fn name(&self) -> &str;

    /// Mutate the pod in place.
    fn decorate(&self, template: &AgentTemplate, pod: &mut Pod) -> ProvisionResult<()>;
}

/// An ordered collection of [`PodDecorator`]s.
#[derive(Clone, Default)]
pub struct DecoratorRegistry {
    decorators: Vec<Arc<dyn PodDecorator>>,
}

impl DecoratorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a decorator. Decorators run in registration order.
    pub fn register(&mut self, decorator: Arc<dyn PodDecorator>) {
        self.decorators.push(decorator);
    }

    /// Run every decorator against the pod, stopping at the first error.
    pub fn apply(&self, template: &AgentTemplate, pod: &mut Pod) -> ProvisionResult<()> {
        for decorator in &self.decorators {
            tracing::trace!(decorator = decorator.name(), "applying pod decorator");
            decorator.decorate(template, pod)?;
        }
        Ok(())
    }

    /// Number of registered decorators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.decorators.len()
    }

    /// Returns true when no decorator is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decorators.is_empty()
    }
}

impl std::fmt::Debug for DecoratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoratorRegistry")
            .field("decorators", &self.decorators.len())
            .finish()
    }
}

/// Builds pod documents from resolved templates.
#[derive(Debug, Clone)]
pub struct PodBuilder {
    backend: BackendConfig,
    decorators: DecoratorRegistry,
}

impl PodBuilder {
    /// Create a builder for one backend.
    #[must_use]
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            decorators: DecoratorRegistry::new(),
        }
    }

    /// Attach a decorator registry.
    #[must_use]
    pub fn with_decorators(mut self, decorators: DecoratorRegistry) -> Self {
        self.decorators = decorators;
        self
    }

    /// Build the pod document for one provisioning attempt.
    pub fn build(&self, template: &AgentTemplate, identity: &AgentIdentity) -> ProvisionResult<Pod> {
        let substitutions = substitution_map(template, identity);

        let (volumes, shared_mounts, workspace_volume) = build_volumes(template);

        let mut containers = Vec::with_capacity(template.containers.len() + 1);
        for spec in &template.containers {
            containers.push(self.build_container(
                template,
                spec,
                identity,
                &shared_mounts,
                &workspace_volume,
            )?);
        }

        if template.container(AGENT_CONTAINER).is_none() {
            let synthesised = self.default_agent_container(identity);
            containers.push(self.build_container(
                template,
                &synthesised,
                identity,
                &shared_mounts,
                &workspace_volume,
            )?);
        }

        let metadata = self.build_metadata(template, identity, &substitutions);

        let mut pod = Pod {
            metadata,
            spec: Some(PodSpec {
                containers,
                volumes: Some(volumes),
                restart_policy: Some("Never".to_owned()),
                node_selector: parse_node_selector(&template.node_selector),
                service_account_name: non_empty(&template.service_account),
                ..PodSpec::default()
            }),
            ..Pod::default()
        };

        for fragment in &template.yaml_overrides {
            pod = overlay_fragment(template, pod, fragment)?;
        }

        self.decorators.apply(template, &mut pod)?;
        Ok(pod)
    }

    fn build_container(
        &self,
        template: &AgentTemplate,
        spec: &ContainerTemplate,
        identity: &AgentIdentity,
        shared_mounts: &[VolumeMount],
        workspace_volume: &str,
    ) -> ProvisionResult<Container> {
        let working_dir = if spec.working_dir.is_empty() {
            DEFAULT_WORKING_DIR
        } else {
            &spec.working_dir
        };

        let mut mounts = shared_mounts.to_vec();
        let covered = mounts
            .iter()
            .any(|m| normalise_mount_path(&m.mount_path) == normalise_mount_path(working_dir));
        if !covered {
            mounts.push(VolumeMount {
                name: workspace_volume.to_owned(),
                mount_path: working_dir.to_owned(),
                ..VolumeMount::default()
            });
        }

        Ok(Container {
            name: spec.name.clone(),
            image: non_empty(&spec.image),
            command: non_empty_list(&spec.command),
            args: non_empty_list(&spec.args),
            working_dir: Some(working_dir.to_owned()),
            tty: spec.tty,
            env: Some(self.build_env(template, spec, identity, working_dir)),
            ports: build_ports(spec),
            resources: build_resources(template, spec)?,
            security_context: build_security(spec),
            liveness_probe: spec.liveness.as_ref().map(build_probe),
            volume_mounts: Some(mounts),
            ..Container::default()
        })
    }

    /// Computed defaults first, then template-scoped variables, then
    /// container-scoped ones. Later declarations override earlier ones by
    /// name while keeping first-appearance order.
    fn build_env(
        &self,
        template: &AgentTemplate,
        spec: &ContainerTemplate,
        identity: &AgentIdentity,
        working_dir: &str,
    ) -> Vec<EnvVar> {
        let mut layered: Vec<TemplateEnv> = vec![
            TemplateEnv::new("GANTRY_SECRET", &identity.secret),
            TemplateEnv::new("GANTRY_AGENT_NAME", &identity.pod_name),
            TemplateEnv::new("GANTRY_URL", &identity.callback_url),
            TemplateEnv::new("GANTRY_WORKDIR", working_dir),
        ];

        if self.backend.proxy_passthrough {
            for key in ["HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY"] {
                if let Ok(value) = std::env::var(key) {
                    layered.push(TemplateEnv::new(key, value));
                }
            }
        }

        layered.extend(template.env.iter().cloned());
        layered.extend(spec.env.iter().cloned());

        let mut ordered: Vec<EnvVar> = Vec::with_capacity(layered.len());
        for entry in layered {
            match ordered.iter_mut().find(|v| v.name == entry.name) {
                Some(existing) => existing.value = Some(entry.value),
                None => ordered.push(EnvVar {
                    name: entry.name,
                    value: Some(entry.value),
                    ..EnvVar::default()
                }),
            }
        }
        ordered
    }

    fn default_agent_container(&self, identity: &AgentIdentity) -> ContainerTemplate {
        let mut agent = ContainerTemplate::new(AGENT_CONTAINER);
        agent.image = self.backend.agent_image.clone();
        agent.args = vec![identity.secret.clone(), identity.pod_name.clone()];
        agent
    }

    fn build_metadata(
        &self,
        template: &AgentTemplate,
        identity: &AgentIdentity,
        substitutions: &BTreeMap<&'static str, String>,
    ) -> ObjectMeta {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_LABEL.to_owned(), "true".to_owned());
        labels.insert(
            TEMPLATE_LABEL.to_owned(),
            sanitise_label_value(&template.name),
        );
        labels.insert(AGENT_ID_LABEL.to_owned(), identity.id.to_string());

        let annotations: BTreeMap<String, String> = template
            .annotations
            .iter()
            .map(|a| (a.key.clone(), substitute(&a.value, substitutions)))
            .collect();

        ObjectMeta {
            name: Some(substitute(&identity.pod_name, substitutions)),
            namespace: Some(
                template
                    .namespace
                    .clone()
                    .unwrap_or_else(|| self.backend.namespace.clone()),
            ),
            labels: Some(labels),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations)
            },
            ..ObjectMeta::default()
        }
    }
}

/// One volume per declared mount path, first declaration wins on
/// duplicates. A workspace volume always exists; when no declared volume
/// covers the default working directory, an ephemeral one is synthesised.
/// Returns the volumes, the shared mounts, and the workspace volume name.
fn build_volumes(template: &AgentTemplate) -> (Vec<Volume>, Vec<VolumeMount>, String) {
    let mut volumes = Vec::new();
    let mut mounts: Vec<VolumeMount> = Vec::new();
    let mut workspace_volume = None;

    for (i, declared) in template.volumes.iter().enumerate() {
        let path = declared.normalised_mount_path();
        if mounts
            .iter()
            .any(|m| normalise_mount_path(&m.mount_path) == path)
        {
            continue;
        }

        let name = format!("volume-{i}");
        if path == DEFAULT_WORKING_DIR {
            workspace_volume = Some(name.clone());
        }

        volumes.push(build_volume(&name, declared));
        mounts.push(VolumeMount {
            name,
            mount_path: path.to_owned(),
            ..VolumeMount::default()
        });
    }

    let workspace_volume = workspace_volume.unwrap_or_else(|| {
        volumes.push(Volume {
            name: WORKSPACE_VOLUME.to_owned(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        });
        WORKSPACE_VOLUME.to_owned()
    });

    (volumes, mounts, workspace_volume)
}

fn build_volume(name: &str, declared: &VolumeTemplate) -> Volume {
    match declared {
        VolumeTemplate::EmptyDir { memory, .. } => Volume {
            name: name.to_owned(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: memory.then(|| "Memory".to_owned()),
                ..EmptyDirVolumeSource::default()
            }),
            ..Volume::default()
        },
        VolumeTemplate::HostPath { host_path, .. } => Volume {
            name: name.to_owned(),
            host_path: Some(HostPathVolumeSource {
                path: host_path.clone(),
                type_: None,
            }),
            ..Volume::default()
        },
        VolumeTemplate::Secret { secret_name, .. } => Volume {
            name: name.to_owned(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name.clone()),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        },
        VolumeTemplate::ConfigMap {
            config_map_name, ..
        } => Volume {
            name: name.to_owned(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map_name.clone(),
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        },
    }
}

fn build_ports(spec: &ContainerTemplate) -> Option<Vec<ContainerPort>> {
    if spec.ports.is_empty() {
        return None;
    }
    Some(
        spec.ports
            .iter()
            .map(|p| ContainerPort {
                name: p.name.clone(),
                container_port: p.container_port,
                host_port: p.host_port,
                ..ContainerPort::default()
            })
            .collect(),
    )
}

/// Blank quantity fields are omitted rather than emitted as empty strings;
/// malformed ones fail construction before any network call.
fn build_resources(
    template: &AgentTemplate,
    spec: &ContainerTemplate,
) -> ProvisionResult<Option<ResourceRequirements>> {
    if spec.resources.is_empty() {
        return Ok(None);
    }

    let parse = |field: &str, value: &str| -> ProvisionResult<Option<Quantity>> {
        if value.is_empty() {
            return Ok(None);
        }
        if !is_valid_quantity(value) {
            return Err(ProvisionError::InvalidTemplate(
                TemplateError::InvalidQuantity {
                    template: template.name.clone(),
                    field: format!("{}.{field}", spec.name),
                    value: value.to_owned(),
                },
            ));
        }
        Ok(Some(Quantity(value.to_owned())))
    };

    let mut requests = BTreeMap::new();
    if let Some(q) = parse("request_cpu", &spec.resources.request_cpu)? {
        requests.insert("cpu".to_owned(), q);
    }
    if let Some(q) = parse("request_memory", &spec.resources.request_memory)? {
        requests.insert("memory".to_owned(), q);
    }

    let mut limits = BTreeMap::new();
    if let Some(q) = parse("limit_cpu", &spec.resources.limit_cpu)? {
        limits.insert("cpu".to_owned(), q);
    }
    if let Some(q) = parse("limit_memory", &spec.resources.limit_memory)? {
        limits.insert("memory".to_owned(), q);
    }

    Ok(Some(ResourceRequirements {
        requests: if requests.is_empty() {
            None
        } else {
            Some(requests)
        },
        limits: if limits.is_empty() { None } else { Some(limits) },
        ..ResourceRequirements::default()
    }))
}

fn build_security(spec: &ContainerTemplate) -> Option<SecurityContext> {
    if spec.security.is_empty() {
        return None;
    }

    let capabilities = if spec.security.capabilities_add.is_empty()
        && spec.security.capabilities_drop.is_empty()
    {
        None
    } else {
        Some(Capabilities {
            add: non_empty_list(&spec.security.capabilities_add),
            drop: non_empty_list(&spec.security.capabilities_drop),
        })
    };

    Some(SecurityContext {
        privileged: spec.security.privileged,
        run_as_user: spec.security.run_as_user,
        run_as_group: spec.security.run_as_group,
        capabilities,
        ..SecurityContext::default()
    })
}

fn build_probe(liveness: &LivenessSpec) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: non_empty_list(&liveness.exec_command),
        }),
        initial_delay_seconds: Some(liveness.initial_delay_secs),
        timeout_seconds: Some(liveness.timeout_secs),
        period_seconds: Some(liveness.period_secs),
        failure_threshold: Some(liveness.failure_threshold),
        ..Probe::default()
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

fn non_empty_list(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}

/// Parse a `key=value,key=value` selector expression. Entries without `=`
/// are skipped.
fn parse_node_selector(expression: &str) -> Option<BTreeMap<String, String>> {
    if expression.is_empty() {
        return None;
    }
    let selector: BTreeMap<String, String> = expression
        .split(',')
        .filter_map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        })
        .collect();
    if selector.is_empty() {
        None
    } else {
        Some(selector)
    }
}

fn substitution_map(
    template: &AgentTemplate,
    identity: &AgentIdentity,
) -> BTreeMap<&'static str, String> {
    let mut vars = BTreeMap::new();
    vars.insert("AGENT_NAME", identity.pod_name.clone());
    vars.insert("AGENT_ID", identity.id.to_string());
    vars.insert("AGENT_SECRET", identity.secret.clone());
    vars.insert("TEMPLATE_NAME", template.name.clone());
    vars
}

/// Replace `${VAR}` references with their values. Unknown references pass
/// through unchanged.
fn substitute(input: &str, vars: &BTreeMap<&'static str, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Restrict a string to a valid label value: alphanumerics plus `-_.`,
/// at most 63 characters, trimmed of leading and trailing punctuation.
#[must_use]
pub fn sanitise_label_value(value: &str) -> String {
    let mapped: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let truncated = if mapped.len() > 63 {
        &mapped[..63]
    } else {
        &mapped
    };
    truncated
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_owned()
}

/// Overlay one raw YAML fragment on the built document using the same
/// override-by-key rule as template merging, the fragment winning on
/// conflict.
fn overlay_fragment(template: &AgentTemplate, pod: Pod, fragment: &str) -> ProvisionResult<Pod> {
    let invalid = |message: String| {
        ProvisionError::InvalidTemplate(TemplateError::InvalidOverride {
            template: template.name.clone(),
            message,
        })
    };

    let overlay: serde_json::Value =
        serde_yaml::from_str(fragment).map_err(|e| invalid(e.to_string()))?;
    if overlay.is_null() {
        return Ok(pod);
    }

    let base = serde_json::to_value(&pod).map_err(|e| invalid(e.to_string()))?;
    let merged = merge_value(base, overlay);
    serde_json::from_value(merged).map_err(|e| invalid(e.to_string()))
}

/// Recursive override-by-key merge of two JSON trees, `child` winning.
/// Arrays of objects carrying a `name` field merge element-wise by name;
/// any other array is replaced wholesale.
fn merge_value(parent: serde_json::Value, child: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match (parent, child) {
        (Value::Object(mut parent), Value::Object(child)) => {
            for (key, child_value) in child {
                let merged = match parent.remove(&key) {
                    Some(parent_value) => merge_value(parent_value, child_value),
                    None => child_value,
                };
                parent.insert(key, merged);
            }
            Value::Object(parent)
        }
        (Value::Array(parent), Value::Array(child)) if all_named(&parent) && all_named(&child) => {
            let mut merged: Vec<Value> = Vec::with_capacity(parent.len() + child.len());
            let mut pending: Vec<Option<Value>> = child.into_iter().map(Some).collect();

            for parent_entry in parent {
                let name = entry_name(&parent_entry);
                let matched = pending.iter_mut().find_map(|slot| {
                    if slot.as_ref().is_some_and(|c| entry_name(c) == name) {
                        slot.take()
                    } else {
                        None
                    }
                });
                merged.push(match matched {
                    Some(child_entry) => merge_value(parent_entry, child_entry),
                    None => parent_entry,
                });
            }
            merged.extend(pending.into_iter().flatten());
            Value::Array(merged)
        }
        (parent, Value::Null) => parent,
        (_, child) => child,
    }
}

fn all_named(entries: &[serde_json::Value]) -> bool {
    !entries.is_empty()
        && entries
            .iter()
            .all(|e| e.get("name").is_some_and(serde_json::Value::is_string))
}

fn entry_name(entry: &serde_json::Value) -> &str {
    entry
        .get("name")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_template::{Annotation, PortMapping, ResourceSpec, SecuritySpec};

    fn backend() -> BackendConfig {
        BackendConfig {
            name: "ci".to_owned(),
            namespace: "agents".to_owned(),
            callback_url: "http://gantry:8080".to_owned(),
            ..BackendConfig::default()
        }
    }

    fn identity() -> AgentIdentity {
        AgentIdentity {
            id: crate::types::AgentId::new("01hv2k7p9qabcdef"),
            pod_name: "maven-bcdef".to_owned(),
            secret: "s3cret".to_owned(),
            callback_url: "http://gantry:8080".to_owned(),
        }
    }

    fn container_names(pod: &Pod) -> Vec<&str> {
        pod.spec
            .as_ref()
            .unwrap()
            .containers
            .iter()
            .map(|c| c.name.as_str())
            .collect()
    }

    #[test]
    fn empty_template_yields_exactly_one_agent_container() {
        let template = AgentTemplate::new("bare");
        let pod = PodBuilder::new(backend())
            .build(&template, &identity())
            .unwrap();

        assert_eq!(container_names(&pod), vec![AGENT_CONTAINER]);

        let agent = &pod.spec.as_ref().unwrap().containers[0];
        assert_eq!(agent.image.as_deref(), Some("gantry/inbound-agent:latest"));
        assert_eq!(
            agent.args.as_deref(),
            Some(&["s3cret".to_owned(), "maven-bcdef".to_owned()][..])
        );
        assert_eq!(agent.working_dir.as_deref(), Some(DEFAULT_WORKING_DIR));
    }

    #[test]
    fn declared_agent_container_is_not_duplicated() {
        let mut template = AgentTemplate::new("custom");
        let mut agent = ContainerTemplate::new(AGENT_CONTAINER);
        agent.image = "custom/agent:1".to_owned();
        template.containers.push(agent);

        let pod = PodBuilder::new(backend())
            .build(&template, &identity())
            .unwrap();
        assert_eq!(container_names(&pod), vec![AGENT_CONTAINER]);
        assert_eq!(
            pod.spec.as_ref().unwrap().containers[0].image.as_deref(),
            Some("custom/agent:1")
        );
    }

    #[test]
    fn template_env_overrides_computed_defaults() {
        let mut template = AgentTemplate::new("t");
        template.env.push(TemplateEnv::new("GANTRY_URL", "http://other"));
        let mut build = ContainerTemplate::new("build");
        build.image = "img".to_owned();
        build.env.push(TemplateEnv::new("EXTRA", "1"));
        template.containers.push(build);

        let pod = PodBuilder::new(backend())
            .build(&template, &identity())
            .unwrap();

        let env = pod.spec.as_ref().unwrap().containers[0]
            .env
            .clone()
            .unwrap();
        let get = |name: &str| {
            env.iter()
                .find(|v| v.name == name)
                .and_then(|v| v.value.clone())
        };

        assert_eq!(get("GANTRY_SECRET").as_deref(), Some("s3cret"));
        assert_eq!(get("GANTRY_URL").as_deref(), Some("http://other"));
        assert_eq!(get("EXTRA").as_deref(), Some("1"));
        // Overriding keeps the variable at its original position.
        assert_eq!(env[2].name, "GANTRY_URL");
    }

    #[test]
    fn volumes_dedupe_by_normalised_mount_path() {
        let mut template = AgentTemplate::new("t");
        template.volumes.push(VolumeTemplate::EmptyDir {
            mount_path: "/cache".to_owned(),
            memory: false,
        });
        template.volumes.push(VolumeTemplate::HostPath {
            mount_path: "/cache/".to_owned(),
            host_path: "/mnt/cache".to_owned(),
        });

        let pod = PodBuilder::new(backend())
            .build(&template, &identity())
            .unwrap();
        let volumes = pod.spec.as_ref().unwrap().volumes.clone().unwrap();

        // One for /cache plus the synthesised workspace volume.
        assert_eq!(volumes.len(), 2);
        assert!(volumes[0].empty_dir.is_some());
        assert_eq!(volumes[1].name, "workspace-volume");
    }

    #[test]
    fn workspace_mount_injected_at_working_directory() {
        let mut template = AgentTemplate::new("t");
        let mut build = ContainerTemplate::new("build");
        build.image = "img".to_owned();
        build.working_dir = "/work".to_owned();
        template.containers.push(build);

        let pod = PodBuilder::new(backend())
            .build(&template, &identity())
            .unwrap();
        let mounts = pod.spec.as_ref().unwrap().containers[0]
            .volume_mounts
            .clone()
            .unwrap();

        assert!(mounts
            .iter()
            .any(|m| m.name == "workspace-volume" && m.mount_path == "/work"));
    }

    #[test]
    fn blank_quantities_omitted_and_invalid_ones_rejected() {
        let mut template = AgentTemplate::new("t");
        let mut build = ContainerTemplate::new("build");
        build.image = "img".to_owned();
        build.resources = ResourceSpec {
            request_memory: "256Mi".to_owned(),
            ..ResourceSpec::default()
        };
        template.containers.push(build);

        let pod = PodBuilder::new(backend())
            .build(&template, &identity())
            .unwrap();
        let resources = pod.spec.as_ref().unwrap().containers[0]
            .resources
            .clone()
            .unwrap();
        let requests = resources.requests.unwrap();
        assert_eq!(requests.get("memory"), Some(&Quantity("256Mi".to_owned())));
        assert!(!requests.contains_key("cpu"));
        assert!(resources.limits.is_none());

        template.containers[0].resources.limit_cpu = "lots".to_owned();
        let err = PodBuilder::new(backend())
            .build(&template, &identity())
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidTemplate(_)));
    }

    #[test]
    fn metadata_carries_labels_and_substituted_annotations() {
        let mut template = AgentTemplate::new("maven");
        template.annotations.push(Annotation {
            key: "gantry.io/owner".to_owned(),
            value: "${TEMPLATE_NAME}/${AGENT_ID}".to_owned(),
        });

        let pod = PodBuilder::new(backend())
            .build(&template, &identity())
            .unwrap();

        assert_eq!(pod.metadata.name.as_deref(), Some("maven-bcdef"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("agents"));

        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[MANAGED_LABEL], "true");
        assert_eq!(labels[TEMPLATE_LABEL], "maven");
        assert_eq!(labels[AGENT_ID_LABEL], "01hv2k7p9qabcdef");

        let annotations = pod.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations["gantry.io/owner"], "maven/01hv2k7p9qabcdef");
    }

    #[test]
    fn template_namespace_overrides_backend() {
        let mut template = AgentTemplate::new("t");
        template.namespace = Some("special".to_owned());
        let pod = PodBuilder::new(backend())
            .build(&template, &identity())
            .unwrap();
        assert_eq!(pod.metadata.namespace.as_deref(), Some("special"));
    }

    #[test]
    fn node_selector_expression_parsed() {
        let mut template = AgentTemplate::new("t");
        template.node_selector = "kubernetes.io/arch=amd64, pool=builds".to_owned();
        let pod = PodBuilder::new(backend())
            .build(&template, &identity())
            .unwrap();

        let selector = pod.spec.as_ref().unwrap().node_selector.clone().unwrap();
        assert_eq!(selector["kubernetes.io/arch"], "amd64");
        assert_eq!(selector["pool"], "builds");
    }

    #[test]
    fn security_context_built_per_sub_field() {
        let mut template = AgentTemplate::new("t");
        let mut build = ContainerTemplate::new("build");
        build.image = "img".to_owned();
        build.security = SecuritySpec {
            run_as_user: Some(1000),
            capabilities_drop: vec!["ALL".to_owned()],
            ..SecuritySpec::default()
        };
        template.containers.push(build);

        let pod = PodBuilder::new(backend())
            .build(&template, &identity())
            .unwrap();
        let security = pod.spec.as_ref().unwrap().containers[0]
            .security_context
            .clone()
            .unwrap();
        assert_eq!(security.run_as_user, Some(1000));
        assert!(security.privileged.is_none());
        assert_eq!(
            security.capabilities.unwrap().drop.unwrap(),
            vec!["ALL".to_owned()]
        );
    }

    #[test]
    fn ports_preserved() {
        let mut template = AgentTemplate::new("t");
        let mut build = ContainerTemplate::new("build");
        build.image = "img".to_owned();
        build.ports.push(PortMapping {
            name: Some("http".to_owned()),
            container_port: 8080,
            host_port: None,
        });
        template.containers.push(build);

        let pod = PodBuilder::new(backend())
            .build(&template, &identity())
            .unwrap();
        let ports = pod.spec.as_ref().unwrap().containers[0]
            .ports
            .clone()
            .unwrap();
        assert_eq!(ports[0].name.as_deref(), Some("http"));
        assert_eq!(ports[0].container_port, 8080);
    }

    #[test]
    fn yaml_overlay_merges_by_container_name() {
        let mut template = AgentTemplate::new("t");
        let mut build = ContainerTemplate::new("build");
        build.image = "img".to_owned();
        template.containers.push(build);
        template.yaml_overrides.push(
            r#"
spec:
  priorityClassName: build-agents
  containers:
    - name: build
      imagePullPolicy: Always
"#
            .to_owned(),
        );

        let pod = PodBuilder::new(backend())
            .build(&template, &identity())
            .unwrap();
        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.priority_class_name.as_deref(), Some("build-agents"));

        let build = spec.containers.iter().find(|c| c.name == "build").unwrap();
        assert_eq!(build.image.as_deref(), Some("img"));
        assert_eq!(build.image_pull_policy.as_deref(), Some("Always"));
        // The overlay must not drop the other containers.
        assert!(spec.containers.iter().any(|c| c.name == AGENT_CONTAINER));
    }

    #[test]
    fn malformed_overlay_is_rejected() {
        let mut template = AgentTemplate::new("t");
        template.yaml_overrides.push(": not yaml :".to_owned());
        let err = PodBuilder::new(backend())
            .build(&template, &identity())
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::InvalidTemplate(TemplateError::InvalidOverride { .. })
        ));
    }

    #[test]
    fn decorators_run_in_registration_order() {
        struct Tag(&'static str);
        impl PodDecorator for Tag {
            fn name(&self) -> &str {
                self.0
            }
            fn decorate(&self, _: &AgentTemplate, pod: &mut Pod) -> ProvisionResult<()> {
                pod.metadata
                    .annotations
                    .get_or_insert_with(BTreeMap::new)
                    .entry("order".to_owned())
                    .and_modify(|v| {
                        v.push(',');
                        v.push_str(self.0);
                    })
                    .or_insert_with(|| self.0.to_owned());
                Ok(())
            }
        }

        let mut registry = DecoratorRegistry::new();
        registry.register(Arc::new(Tag("first")));
        registry.register(Arc::new(Tag("second")));

        let pod = PodBuilder::new(backend())
            .with_decorators(registry)
            .build(&AgentTemplate::new("t"), &identity())
            .unwrap();
        assert_eq!(
            pod.metadata.annotations.as_ref().unwrap()["order"],
            "first,second"
        );
    }

    #[test]
    fn substitution_leaves_unknown_references() {
        let vars = substitution_map(&AgentTemplate::new("t"), &identity());
        assert_eq!(substitute("${AGENT_NAME}-x", &vars), "maven-bcdef-x");
        assert_eq!(substitute("${UNKNOWN}", &vars), "${UNKNOWN}");
        assert_eq!(substitute("${broken", &vars), "${broken");
    }

    #[test]
    fn label_values_sanitised() {
        assert_eq!(sanitise_label_value("Maven JDK 17"), "Maven_JDK_17");
        assert_eq!(sanitise_label_value("--x--"), "x");
        let long = "a".repeat(100);
        assert!(sanitise_label_value(&long).len() <= 63);
    }
}
