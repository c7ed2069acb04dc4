//! Production cluster client backed by the kube crate.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, LogParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tracing::debug;

use super::{ClusterClient, ClusterError};

/// Cluster client over a real Kubernetes API server.
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Create a client that auto-discovers cluster configuration: the
    /// in-cluster service account when running inside Kubernetes, then
    /// `KUBECONFIG`, then `~/.kube/config`.
    pub async fn new() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        debug!("kubernetes client initialised");
        Ok(Self { client })
    }

    /// Wrap an existing client.
    #[must_use]
    pub const fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn create_pod(&self, namespace: &str, pod: Pod) -> Result<Pod, ClusterError> {
        let created = self
            .pods(namespace)
            .create(&PostParams::default(), &pod)
            .await?;
        Ok(created)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError> {
        let pod = self.pods(namespace).get_opt(name).await?;
        Ok(pod)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        match self
            .pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn watch_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BoxStream<'static, Pod>, ClusterError> {
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        let stream = watcher(self.pods(namespace), config)
            .applied_objects()
            .filter_map(|event| futures::future::ready(event.ok()))
            .boxed();
        Ok(stream)
    }

    async fn tail_logs(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
        lines: u32,
    ) -> Result<String, ClusterError> {
        let params = LogParams {
            container: Some(container.to_owned()),
            tail_lines: Some(i64::from(lines)),
            ..LogParams::default()
        };
        let logs = self.pods(namespace).logs(name, &params).await?;
        Ok(logs)
    }
}
