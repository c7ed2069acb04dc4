//! Cluster client abstraction.
//!
//! The provisioning engine talks to the orchestration API through the
//! narrow [`ClusterClient`] contract. The production implementation is
//! [`KubeCluster`]; [`MockCluster`] provides a scriptable in-memory cluster
//! for tests.

mod kube;

pub use self::kube::KubeCluster;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Errors surfaced by the cluster client.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The orchestration API rejected or failed a request.
    #[error("cluster API error: {0}")]
    Api(String),

    /// The watch subscription failed to establish.
    #[error("pod watch error: {0}")]
    Watch(String),
}

impl From<::kube::Error> for ClusterError {
    fn from(err: ::kube::Error) -> Self {
        Self::Api(err.to_string())
    }
}

/// Minimal cluster contract consumed by the provisioning engine.
///
/// Watch subscriptions are push-based and may stop delivering without
/// notice; callers combine them with periodic [`get_pod`](Self::get_pod)
/// refetches.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Submit a pod document. Returns the pod as accepted by the API.
    async fn create_pod(&self, namespace: &str, pod: Pod) -> Result<Pod, ClusterError>;

    /// Fetch the current state of a pod. `Ok(None)` means not found.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError>;

    /// Delete a pod. Returns false when the pod was already gone.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool, ClusterError>;

    /// Subscribe to state changes for a single pod.
    async fn watch_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BoxStream<'static, Pod>, ClusterError>;

    /// Fetch the last `lines` lines of one container's log.
    async fn tail_logs(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        lines: u32,
    ) -> Result<String, ClusterError>;
}

/// In-memory cluster for tests.
///
/// Pod state is scripted by the test: [`MockCluster::push_pod_state`]
/// upserts a pod and notifies any watch subscribers, and
/// [`MockCluster::forget_pod`] simulates the pod disappearing.
#[derive(Default)]
pub struct MockCluster {
    pods: Mutex<HashMap<String, Pod>>,
    watchers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Pod>>>>,
    logs: Mutex<HashMap<(String, String), String>>,
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    fail_next_create: AtomicBool,
}

impl MockCluster {
    /// Create an empty mock cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a pod's observed state and notify watch subscribers.
    pub fn push_pod_state(&self, pod: Pod) {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.pods.lock().insert(name.clone(), pod.clone());

        let mut watchers = self.watchers.lock();
        if let Some(senders) = watchers.get_mut(&name) {
            senders.retain(|tx| tx.send(pod.clone()).is_ok());
        }
    }

    /// Remove a pod from the store, simulating disappearance.
    pub fn forget_pod(&self, name: &str) {
        self.pods.lock().remove(name);
    }

    /// Script the log tail returned for one container.
    pub fn set_logs(&self, pod: &str, container: &str, tail: impl Into<String>) {
        self.logs
            .lock()
            .insert((pod.to_owned(), container.to_owned()), tail.into());
    }

    /// Make the next `create_pod` call fail.
    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    /// Names of pods passed to `create_pod`, in order.
    #[must_use]
    pub fn created(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    /// Names of pods passed to `delete_pod`, in order.
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn create_pod(&self, _namespace: &str, pod: Pod) -> Result<Pod, ClusterError> {
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(ClusterError::Api("simulated submission failure".to_owned()));
        }

        let name = pod.metadata.name.clone().unwrap_or_default();
        self.created.lock().push(name.clone());
        self.pods.lock().insert(name, pod.clone());
        Ok(pod)
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError> {
        Ok(self.pods.lock().get(name).cloned())
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<bool, ClusterError> {
        self.deleted.lock().push(name.to_owned());
        Ok(self.pods.lock().remove(name).is_some())
    }

    async fn watch_pod(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<BoxStream<'static, Pod>, ClusterError> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        if let Some(current) = self.pods.lock().get(name) {
            let _ = tx.send(current.clone());
        }
        self.watchers
            .lock()
            .entry(name.to_owned())
            .or_default()
            .push(tx);

        Ok(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    async fn tail_logs(
        &self,
        _namespace: &str,
        name: &str,
        container: &str,
        _lines: u32,
    ) -> Result<String, ClusterError> {
        self.logs
            .lock()
            .get(&(name.to_owned(), container.to_owned()))
            .cloned()
            .ok_or_else(|| ClusterError::Api(format!("no logs for {name}/{container}")))
    }
}
