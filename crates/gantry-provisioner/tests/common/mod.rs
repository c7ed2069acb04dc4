//! Common test utilities for provisioner integration tests.

use std::sync::Arc;
use std::time::Duration;

use gantry_provisioner::pod::AGENT_ID_LABEL;
use gantry_provisioner::{
    AgentId, BackendConfig, ClusterClient, GantryConfig, MockCluster, MockNodes, Provisioner,
};
use gantry_template::AgentTemplate;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStatus, Pod,
    PodStatus,
};

/// Complete provisioner setup against scriptable collaborators.
pub struct TestHarness {
    pub cluster: Arc<MockCluster>,
    pub nodes: Arc<MockNodes>,
    pub provisioner: Arc<Provisioner>,
}

impl TestHarness {
    /// Harness with default backend settings and the given templates.
    pub fn new(templates: Vec<AgentTemplate>) -> Self {
        Self::with_backend(Self::backend(), templates)
    }

    /// Default backend used by tests.
    pub fn backend() -> BackendConfig {
        BackendConfig {
            name: "ci".to_owned(),
            namespace: "agents".to_owned(),
            callback_url: "http://gantry:8080".to_owned(),
            ..BackendConfig::default()
        }
    }

    /// Harness with a custom backend configuration.
    pub fn with_backend(backend: BackendConfig, templates: Vec<AgentTemplate>) -> Self {
        let cluster = Arc::new(MockCluster::new());
        let nodes = MockNodes::new();
        let provisioner = Arc::new(Provisioner::new(
            cluster.clone(),
            nodes.clone(),
            GantryConfig { backend, templates },
        ));

        Self {
            cluster,
            nodes,
            provisioner,
        }
    }

    /// Wait until the provisioning task has submitted a pod and return
    /// its name.
    pub async fn wait_for_submission(&self) -> String {
        loop {
            if let Some(name) = self.cluster.created().first().cloned() {
                return name;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Push a state where every declared container is running and ready.
    /// Returns the agent id carried by the pod's labels.
    pub async fn make_ready(&self, pod_name: &str) -> AgentId {
        let pod = self
            .cluster
            .get_pod("agents", pod_name)
            .await
            .unwrap()
            .expect("pod should exist");
        let id = agent_id_of(&pod);
        self.cluster.push_pod_state(with_statuses(
            pod.clone(),
            declared(&pod).iter().map(|n| running(n, true)).collect(),
        ));
        id
    }

    /// Push a state where one container has terminated.
    pub async fn make_terminated(&self, pod_name: &str, container: &str) {
        let pod = self
            .cluster
            .get_pod("agents", pod_name)
            .await
            .unwrap()
            .expect("pod should exist");
        let statuses = declared(&pod)
            .iter()
            .map(|n| {
                if n == container {
                    terminated(n)
                } else {
                    running(n, true)
                }
            })
            .collect();
        self.cluster.push_pod_state(with_statuses(pod, statuses));
    }
}

/// Read the agent id from the pod's ownership labels.
pub fn agent_id_of(pod: &Pod) -> AgentId {
    AgentId::new(
        pod.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(AGENT_ID_LABEL))
            .expect("pod should carry an agent id label")
            .clone(),
    )
}

fn declared(pod: &Pod) -> Vec<String> {
    pod.spec
        .as_ref()
        .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default()
}

fn with_statuses(mut pod: Pod, statuses: Vec<ContainerStatus>) -> Pod {
    pod.status = Some(PodStatus {
        container_statuses: Some(statuses),
        ..PodStatus::default()
    });
    pod
}

fn running(name: &str, ready: bool) -> ContainerStatus {
    ContainerStatus {
        name: name.to_owned(),
        ready,
        state: Some(ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..ContainerState::default()
        }),
        ..ContainerStatus::default()
    }
}

fn terminated(name: &str) -> ContainerStatus {
    ContainerStatus {
        name: name.to_owned(),
        ready: false,
        state: Some(ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: 1,
                ..ContainerStateTerminated::default()
            }),
            ..ContainerState::default()
        }),
        ..ContainerStatus::default()
    }
}

/// A simple one-container template.
pub fn template(name: &str) -> AgentTemplate {
    let mut template = AgentTemplate::new(name);
    template.label = "linux".to_owned();
    template
}
