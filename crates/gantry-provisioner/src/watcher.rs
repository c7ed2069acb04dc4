//! Readiness watching for one submitted pod.
//!
//! Watch subscriptions push state changes but may silently stop
//! delivering, so every poll iteration re-fetches the pod state and only
//! uses push events to wake up early. The wait is bounded by an absolute
//! deadline; once the deadline has elapsed a retry budget caps the final
//! re-checks before the timeout is reported.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cluster::ClusterClient;
use crate::error::{ProvisionError, ProvisionResult};
use crate::types::{ContainerLog, DiagnosticLogs};

/// Lines captured per container when collecting failure diagnostics.
const LOG_TAIL_LINES: u32 = 30;

/// Self-adjusting poll interval: a tenth of the remaining budget, clamped
/// to [1s, 10s], so the number of discrete checks stays bounded no matter
/// the total timeout.
pub(crate) fn poll_interval(remaining: Duration) -> Duration {
    (remaining / 10).clamp(Duration::from_secs(1), Duration::from_secs(10))
}

/// Watches a single pod until all of its containers are running.
pub struct PodWatcher {
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    pod_name: String,
    latest: watch::Receiver<u64>,
    feed: JoinHandle<()>,
    retry_budget: u32,
}

impl PodWatcher {
    /// Subscribe to a pod and start feeding its state changes.
    pub async fn start(
        cluster: Arc<dyn ClusterClient>,
        namespace: &str,
        pod_name: &str,
        retry_budget: u32,
    ) -> ProvisionResult<Self> {
        let mut events = cluster.watch_pod(namespace, pod_name).await?;

        // The channel carries an event counter rather than the pod itself;
        // waits re-fetch authoritative state and only use this to wake.
        let (tx, rx) = watch::channel(0u64);
        let feed = tokio::spawn(async move {
            let mut seen = 0u64;
            while events.next().await.is_some() {
                seen += 1;
                if tx.send(seen).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            cluster,
            namespace: namespace.to_owned(),
            pod_name: pod_name.to_owned(),
            latest: rx,
            feed,
            retry_budget,
        })
    }

    /// Wait until every declared container reports ready.
    ///
    /// Fails fast with [`ProvisionError::ContainersTerminated`] as soon as
    /// any container is observed terminated, without waiting out the
    /// remaining budget. A pod that disappears mid-wait is
    /// [`ProvisionError::PodGone`], distinct from a timeout.
    pub async fn await_all_containers_running(&mut self, budget: Duration) -> ProvisionResult<Pod> {
        let started = Instant::now();
        let deadline = started + budget;
        let mut late_polls = 0u32;

        loop {
            let pod = self
                .cluster
                .get_pod(&self.namespace, &self.pod_name)
                .await?
                .ok_or_else(|| ProvisionError::PodGone {
                    pod: self.pod_name.clone(),
                })?;

            match inspect(&pod) {
                Readiness::Ready => {
                    debug!(pod = %self.pod_name, "all containers running");
                    return Ok(pod);
                }
                Readiness::Terminated(containers) => {
                    warn!(
                        pod = %self.pod_name,
                        containers = ?containers,
                        "containers terminated before becoming ready"
                    );
                    let logs = capture_logs(
                        self.cluster.as_ref(),
                        &self.namespace,
                        &self.pod_name,
                        &containers,
                    )
                    .await;
                    return Err(ProvisionError::ContainersTerminated {
                        pod: self.pod_name.clone(),
                        containers,
                        logs,
                    });
                }
                Readiness::Pending => {}
            }

            let now = Instant::now();
            let interval = if now < deadline {
                poll_interval(deadline - now)
            } else {
                // The retry budget never pre-empts the deadline; it only
                // caps the re-checks once the deadline has passed.
                late_polls += 1;
                if late_polls > self.retry_budget {
                    break;
                }
                Duration::from_secs(1)
            };
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                changed = self.latest.changed() => {
                    // A closed channel means the subscription died; fall
                    // back to pure polling.
                    if changed.is_err() {
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }

        Err(ProvisionError::SchedulingTimedOut {
            pod: self.pod_name.clone(),
            waited: started.elapsed(),
        })
    }
}

impl Drop for PodWatcher {
    fn drop(&mut self) {
        self.feed.abort();
    }
}

enum Readiness {
    Pending,
    Ready,
    Terminated(Vec<String>),
}

/// All containers running means the number of reported statuses equals
/// the number of declared containers and every status is ready.
fn inspect(pod: &Pod) -> Readiness {
    let declared = pod.spec.as_ref().map_or(0, |s| s.containers.len());
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref());

    let Some(statuses) = statuses else {
        return Readiness::Pending;
    };

    let terminated: Vec<String> = statuses
        .iter()
        .filter(|s| {
            s.state
                .as_ref()
                .is_some_and(|state| state.terminated.is_some())
        })
        .map(|s| s.name.clone())
        .collect();
    if !terminated.is_empty() {
        return Readiness::Terminated(terminated);
    }

    if statuses.len() == declared && statuses.iter().all(|s| s.ready) {
        Readiness::Ready
    } else {
        Readiness::Pending
    }
}

/// Best-effort log capture for failure diagnostics. Containers whose logs
/// cannot be fetched are skipped rather than masking the original error.
pub(crate) async fn capture_logs(
    cluster: &dyn ClusterClient,
    namespace: &str,
    pod_name: &str,
    containers: &[String],
) -> DiagnosticLogs {
    let mut logs = Vec::new();
    for container in containers {
        match cluster
            .tail_logs(namespace, pod_name, container, LOG_TAIL_LINES)
            .await
        {
            Ok(tail) => logs.push(ContainerLog {
                container: container.clone(),
                tail,
            }),
            Err(err) => {
                debug!(pod = %pod_name, container = %container, error = %err, "log capture failed");
            }
        }
    }
    DiagnosticLogs(logs)
}

/// Names of every declared container, used when capturing logs for
/// failures that are not tied to specific containers.
pub(crate) fn declared_containers(pod: &Pod) -> Vec<String> {
    pod.spec
        .as_ref()
        .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default()
}
