//! Field-level template merging.
//!
//! [`combine`] folds a child template onto a parent. For scalar fields the
//! child wins unless its value equals the field's unset sentinel (empty
//! string, zero, `None`, [`UNCAPPED`]). Collection fields merge
//! override-by-key rather than replace-by-list: parent entries keep their
//! order, entries present in both are combined, and child-only entries are
//! appended.
//!
//! All functions here are pure; the same inputs always produce the same
//! output and no input is mutated.

use std::collections::HashMap;
use std::hash::Hash;

use crate::types::{
    AgentTemplate, ContainerTemplate, PortMapping, ResourceSpec, SecuritySpec, TemplateEnv,
    UNCAPPED,
};

/// Merge `child` onto `parent`, producing a resolved template.
#[must_use]
pub fn combine(parent: &AgentTemplate, child: &AgentTemplate) -> AgentTemplate {
    AgentTemplate {
        name: child.name.clone(),
        label: non_empty(&child.label, &parent.label),
        namespace: child.namespace.clone().or_else(|| parent.namespace.clone()),
        inherit_from: child.inherit_from.clone(),
        containers: merge_keyed(
            &parent.containers,
            &child.containers,
            |c| c.name.clone(),
            combine_container,
        ),
        volumes: merge_keyed(
            &parent.volumes,
            &child.volumes,
            |v| v.normalised_mount_path().to_owned(),
            |_, child| child.clone(),
        ),
        env: merge_env(&parent.env, &child.env),
        annotations: merge_keyed(
            &parent.annotations,
            &child.annotations,
            |a| a.key.clone(),
            |_, child| child.clone(),
        ),
        node_selector: non_empty(&child.node_selector, &parent.node_selector),
        service_account: non_empty(&child.service_account, &parent.service_account),
        instance_cap: if child.instance_cap == UNCAPPED {
            parent.instance_cap
        } else {
            child.instance_cap
        },
        idle_minutes: non_zero(child.idle_minutes, parent.idle_minutes),
        connect_timeout_secs: non_zero(child.connect_timeout_secs, parent.connect_timeout_secs),
        // Parent fragments first so child fragments win at overlay time.
        yaml_overrides: parent
            .yaml_overrides
            .iter()
            .chain(&child.yaml_overrides)
            .cloned()
            .collect(),
        resolved: true,
    }
}

/// Merge a child container onto the parent container sharing its name.
#[must_use]
pub fn combine_container(parent: &ContainerTemplate, child: &ContainerTemplate) -> ContainerTemplate {
    ContainerTemplate {
        name: child.name.clone(),
        image: non_empty(&child.image, &parent.image),
        command: non_empty_list(&child.command, &parent.command),
        args: non_empty_list(&child.args, &parent.args),
        working_dir: non_empty(&child.working_dir, &parent.working_dir),
        tty: child.tty.or(parent.tty),
        env: merge_env(&parent.env, &child.env),
        ports: merge_keyed(&parent.ports, &child.ports, PortMapping::key, |_, child| {
            child.clone()
        }),
        resources: combine_resources(&parent.resources, &child.resources),
        security: combine_security(&parent.security, &child.security),
        liveness: child.liveness.clone().or_else(|| parent.liveness.clone()),
    }
}

fn combine_resources(parent: &ResourceSpec, child: &ResourceSpec) -> ResourceSpec {
    ResourceSpec {
        request_cpu: non_empty(&child.request_cpu, &parent.request_cpu),
        request_memory: non_empty(&child.request_memory, &parent.request_memory),
        limit_cpu: non_empty(&child.limit_cpu, &parent.limit_cpu),
        limit_memory: non_empty(&child.limit_memory, &parent.limit_memory),
    }
}

fn combine_security(parent: &SecuritySpec, child: &SecuritySpec) -> SecuritySpec {
    SecuritySpec {
        privileged: child.privileged.or(parent.privileged),
        run_as_user: child.run_as_user.or(parent.run_as_user),
        run_as_group: child.run_as_group.or(parent.run_as_group),
        capabilities_add: merge_keyed(
            &parent.capabilities_add,
            &child.capabilities_add,
            Clone::clone,
            |_, child| child.clone(),
        ),
        // Drop lists replace wholesale rather than union.
        capabilities_drop: if child.capabilities_drop.is_empty() {
            parent.capabilities_drop.clone()
        } else {
            child.capabilities_drop.clone()
        },
    }
}

/// Merge environment variables keyed by name. Child wins on collision;
/// insertion order is parent order followed by child-only entries.
#[must_use]
pub fn merge_env(parent: &[TemplateEnv], child: &[TemplateEnv]) -> Vec<TemplateEnv> {
    merge_keyed(parent, child, |e| e.name.clone(), |_, child| child.clone())
}

/// Generic override-by-key merge.
///
/// Parent entries keep their order; entries present in both are combined via
/// `combine`; child-only entries are appended in child order.
fn merge_keyed<T: Clone, K: Eq + Hash>(
    parent: &[T],
    child: &[T],
    key: impl Fn(&T) -> K,
    combine: impl Fn(&T, &T) -> T,
) -> Vec<T> {
    let child_index: HashMap<K, &T> = child.iter().map(|item| (key(item), item)).collect();

    let mut merged: Vec<T> = parent
        .iter()
        .map(|item| match child_index.get(&key(item)) {
            Some(overriding) => combine(item, overriding),
            None => item.clone(),
        })
        .collect();

    let parent_keys: Vec<K> = parent.iter().map(&key).collect();
    for item in child {
        if !parent_keys.contains(&key(item)) {
            merged.push(item.clone());
        }
    }

    merged
}

fn non_empty(child: &str, parent: &str) -> String {
    if child.is_empty() {
        parent.to_owned()
    } else {
        child.to_owned()
    }
}

fn non_empty_list(child: &[String], parent: &[String]) -> Vec<String> {
    if child.is_empty() {
        parent.to_vec()
    } else {
        child.to_vec()
    }
}

const fn non_zero(child: u32, parent: u32) -> u32 {
    if child == 0 {
        parent
    } else {
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Annotation, VolumeTemplate};

    fn container(name: &str, image: &str) -> ContainerTemplate {
        ContainerTemplate {
            image: image.to_owned(),
            ..ContainerTemplate::new(name)
        }
    }

    #[test]
    fn unset_child_is_identity() {
        let mut parent = AgentTemplate::new("base");
        parent.label = "linux".to_owned();
        parent.node_selector = "pool=build".to_owned();
        parent.instance_cap = 5;
        parent.idle_minutes = 10;
        parent.containers.push(container("maven", "maven:3.9"));
        parent.env.push(TemplateEnv::new("X", "1"));

        let mut blank = AgentTemplate::new("base");
        blank.instance_cap = UNCAPPED;

        let merged = combine(&parent, &blank);
        assert_eq!(merged.label, parent.label);
        assert_eq!(merged.node_selector, parent.node_selector);
        assert_eq!(merged.instance_cap, 5);
        assert_eq!(merged.idle_minutes, 10);
        assert_eq!(merged.containers, parent.containers);
        assert_eq!(merged.env, parent.env);
        assert!(merged.resolved);
    }

    #[test]
    fn container_level_override() {
        // combine(parent={image:"a", env:{X:"1"}}, child={image:"", env:{Y:"2"}})
        // yields {image:"a", env:{X:"1", Y:"2"}}
        let mut parent_container = container("c", "a");
        parent_container.env.push(TemplateEnv::new("X", "1"));

        let mut child_container = container("c", "");
        child_container.env.push(TemplateEnv::new("Y", "2"));

        let merged = combine_container(&parent_container, &child_container);
        assert_eq!(merged.image, "a");
        assert_eq!(
            merged.env,
            vec![TemplateEnv::new("X", "1"), TemplateEnv::new("Y", "2")]
        );
    }

    #[test]
    fn parent_container_order_preserved_child_only_appended() {
        let mut parent = AgentTemplate::new("base");
        parent.containers.push(container("agent", "agent:1"));
        parent.containers.push(container("maven", "maven:3.9"));

        let mut child = AgentTemplate::new("child");
        child.containers.push(container("kaniko", "kaniko:1"));
        child.containers.push(container("maven", "maven:3.10"));

        let merged = combine(&parent, &child);
        let names: Vec<&str> = merged.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["agent", "maven", "kaniko"]);
        assert_eq!(merged.containers[1].image, "maven:3.10");
    }

    #[test]
    fn env_child_wins_on_collision() {
        let parent = vec![TemplateEnv::new("A", "1"), TemplateEnv::new("B", "2")];
        let child = vec![TemplateEnv::new("B", "3"), TemplateEnv::new("C", "4")];

        let merged = merge_env(&parent, &child);
        assert_eq!(
            merged,
            vec![
                TemplateEnv::new("A", "1"),
                TemplateEnv::new("B", "3"),
                TemplateEnv::new("C", "4"),
            ]
        );
    }

    #[test]
    fn volumes_keyed_by_normalised_mount_path() {
        let mut parent = AgentTemplate::new("base");
        parent.volumes.push(VolumeTemplate::EmptyDir {
            mount_path: "/cache/".to_owned(),
            memory: false,
        });

        let mut child = AgentTemplate::new("child");
        child.volumes.push(VolumeTemplate::HostPath {
            mount_path: "/cache".to_owned(),
            host_path: "/var/cache".to_owned(),
        });

        let merged = combine(&parent, &child);
        assert_eq!(merged.volumes.len(), 1);
        assert!(matches!(merged.volumes[0], VolumeTemplate::HostPath { .. }));
    }

    #[test]
    fn capabilities_drop_replaces_wholesale() {
        let parent = SecuritySpec {
            privileged: Some(true),
            capabilities_add: vec!["NET_ADMIN".to_owned()],
            capabilities_drop: vec!["ALL".to_owned()],
            ..SecuritySpec::default()
        };
        let child = SecuritySpec {
            run_as_user: Some(1000),
            capabilities_drop: vec!["SYS_ADMIN".to_owned(), "NET_RAW".to_owned()],
            ..SecuritySpec::default()
        };

        let merged = combine_security(&parent, &child);
        assert_eq!(merged.privileged, Some(true));
        assert_eq!(merged.run_as_user, Some(1000));
        assert_eq!(merged.capabilities_add, vec!["NET_ADMIN"]);
        assert_eq!(merged.capabilities_drop, vec!["SYS_ADMIN", "NET_RAW"]);
    }

    #[test]
    fn yaml_overrides_concatenate_parent_first() {
        let mut parent = AgentTemplate::new("base");
        parent.yaml_overrides.push("spec: {}".to_owned());
        let mut child = AgentTemplate::new("child");
        child.yaml_overrides.push("metadata: {}".to_owned());

        let merged = combine(&parent, &child);
        assert_eq!(merged.yaml_overrides, vec!["spec: {}", "metadata: {}"]);
    }

    #[test]
    fn combine_is_deterministic() {
        let mut parent = AgentTemplate::new("base");
        parent.containers.push(container("a", "a:1"));
        let mut child = AgentTemplate::new("child");
        child.containers.push(container("b", "b:1"));

        assert_eq!(combine(&parent, &child), combine(&parent, &child));
    }

    #[test]
    fn annotations_merge_by_key() {
        let mut parent = AgentTemplate::new("base");
        parent.annotations.push(Annotation {
            key: "team".to_owned(),
            value: "build".to_owned(),
        });
        let mut child = AgentTemplate::new("child");
        child.annotations.push(Annotation {
            key: "team".to_owned(),
            value: "release".to_owned(),
        });
        child.annotations.push(Annotation {
            key: "tier".to_owned(),
            value: "2".to_owned(),
        });

        let merged = combine(&parent, &child);
        assert_eq!(merged.annotations.len(), 2);
        assert_eq!(merged.annotations[0].value, "release");
    }
}
