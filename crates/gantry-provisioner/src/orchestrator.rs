//! Core provisioning orchestration logic.

use std::sync::Arc;
use std::time::Duration;

use gantry_template::{resolve, validate, AgentTemplate, TemplateMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capacity::{CapacitySlot, CapacityTracker};
use crate::cluster::ClusterClient;
use crate::config::{BackendConfig, GantryConfig};
use crate::error::{ProvisionError, ProvisionResult};
use crate::node::NodeLifecycle;
use crate::pod::{DecoratorRegistry, PodBuilder};
use crate::state::{AgentConnected, Attempt, AttemptData, CapacityReserved, Requested};
use crate::types::{AgentId, AgentIdentity};
use crate::watcher::{capture_logs, declared_containers, poll_interval, PodWatcher};

/// A successfully provisioned, connected agent.
///
/// Holds the capacity slot for the lifetime of the agent; the reservation
/// is released when the agent is terminated (or the record is dropped).
#[derive(Debug)]
pub struct ActiveAgent {
    /// Agent identifier.
    pub id: AgentId,
    /// Name of the backing pod.
    pub pod_name: String,
    /// Namespace the pod lives in.
    pub namespace: String,
    /// Template the agent was built from.
    pub template: String,
    /// Backend hosting the agent.
    pub backend: String,
    slot: CapacitySlot,
}

/// Orchestrates the provisioning lifecycle.
///
/// One provisioner serves one backend. Provisioning requests run as
/// independent tasks; the only contended state is the capacity tracker.
pub struct Provisioner {
    cluster: Arc<dyn ClusterClient>,
    nodes: Arc<dyn NodeLifecycle>,
    capacity: Arc<CapacityTracker>,
    builder: PodBuilder,
    backend: BackendConfig,
    templates: TemplateMap,
}

impl Provisioner {
    /// Create a provisioner for one backend.
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        nodes: Arc<dyn NodeLifecycle>,
        config: GantryConfig,
    ) -> Self {
        let templates = config.template_map();
        let builder = PodBuilder::new(config.backend.clone());
        Self {
            cluster,
            nodes,
            capacity: Arc::new(CapacityTracker::new()),
            builder,
            backend: config.backend,
            templates,
        }
    }

    /// Attach pod decorators, run against every built pod document.
    #[must_use]
    pub fn with_decorators(mut self, decorators: DecoratorRegistry) -> Self {
        self.builder = self.builder.with_decorators(decorators);
        self
    }

    /// The capacity tracker, shared for inspection and tests.
    #[must_use]
    pub fn capacity(&self) -> Arc<CapacityTracker> {
        Arc::clone(&self.capacity)
    }

    /// Provision one agent from a named template.
    pub async fn provision(&self, template_name: &str) -> ProvisionResult<ActiveAgent> {
        self.provision_with_cancel(template_name, CancellationToken::new())
            .await
    }

    /// Provision one agent, abandoning the attempt when `cancel` fires.
    ///
    /// Cancellation after submission goes through the same cleanup path as
    /// any other failure: the pod is deleted, the node record removed and
    /// the capacity slot released.
    pub async fn provision_with_cancel(
        &self,
        template_name: &str,
        cancel: CancellationToken,
    ) -> ProvisionResult<ActiveAgent> {
        let template = self
            .templates
            .get(template_name)
            .ok_or_else(|| ProvisionError::config(format!("unknown template {template_name}")))?;

        let resolved = if template.resolved {
            template.clone()
        } else {
            resolve(
                template,
                &self.templates,
                self.backend.defaults_template.as_deref(),
            )?
        };
        validate(&resolved)?;

        self.prime_capacity().await?;

        let slot = match self.capacity.register(
            &self.backend.name,
            &resolved.name,
            self.backend.container_cap,
            resolved.instance_cap,
            1,
        ) {
            Ok(slot) => slot,
            Err(err) => {
                info!(
                    backend = %self.backend.name,
                    template = %resolved.name,
                    "provisioning rejected at capacity"
                );
                return Err(err);
            }
        };

        let identity = AgentIdentity::for_template(&resolved.name, &self.backend.callback_url);
        let attempt = Attempt::<Requested>::create(AttemptData {
            agent_id: identity.id.clone(),
            backend: self.backend.name.clone(),
            template: resolved.name.clone(),
            pod_name: identity.pod_name.clone(),
            namespace: self.namespace_for(&resolved).to_owned(),
            started_at: chrono::Utc::now(),
        })
        .reserve();

        info!(
            agent_id = %identity.id,
            template = %resolved.name,
            pod = %identity.pod_name,
            "starting provisioning attempt"
        );

        match self.execute(&resolved, &identity, attempt, &cancel).await {
            Ok(connected) => {
                let data = connected.into_data();
                info!(
                    agent_id = %data.agent_id,
                    pod = %data.pod_name,
                    "agent provisioned and connected"
                );
                Ok(ActiveAgent {
                    id: data.agent_id,
                    pod_name: data.pod_name,
                    namespace: data.namespace,
                    template: data.template,
                    backend: data.backend,
                    slot,
                })
            }
            Err((node_created, err)) => {
                error!(
                    agent_id = %identity.id,
                    pod = %identity.pod_name,
                    error = %err,
                    "provisioning failed"
                );
                self.cleanup_failed(&resolved, &identity, node_created).await;
                slot.release();
                Err(err)
            }
        }
    }

    /// Tear down an active agent: delete the pod, remove the node record
    /// and release the capacity slot.
    pub async fn terminate(&self, agent: ActiveAgent) -> ProvisionResult<()> {
        info!(agent_id = %agent.id, pod = %agent.pod_name, "terminating agent");

        let existed = self
            .cluster
            .delete_pod(&agent.namespace, &agent.pod_name)
            .await?;
        if !existed {
            debug!(pod = %agent.pod_name, "pod already gone at termination");
        }
        self.nodes.remove_node(&agent.id).await?;
        agent.slot.release();
        Ok(())
    }

    /// Walk the attempt from capacity reserved to agent connected.
    ///
    /// Failures carry whether the node record had been created, so that
    /// cleanup removes exactly what exists.
    async fn execute(
        &self,
        template: &AgentTemplate,
        identity: &AgentIdentity,
        attempt: Attempt<CapacityReserved>,
        cancel: &CancellationToken,
    ) -> Result<Attempt<AgentConnected>, (bool, ProvisionError)> {
        let namespace = self.namespace_for(template).to_owned();

        self.nodes
            .create_node(template, &identity.id)
            .await
            .map_err(|e| (false, e))?;

        let pod = self
            .builder
            .build(template, identity)
            .map_err(|e| (true, e))?;

        self.cluster
            .create_pod(&namespace, pod)
            .await
            .map_err(|source| {
                (
                    true,
                    ProvisionError::SubmissionFailed {
                        backend: self.backend.name.clone(),
                        template: template.name.clone(),
                        pod: identity.pod_name.clone(),
                        source,
                    },
                )
            })?;
        let attempt = attempt.submit();
        debug!(pod = %identity.pod_name, "pod accepted by cluster");

        let mut watcher = PodWatcher::start(
            Arc::clone(&self.cluster),
            &namespace,
            &identity.pod_name,
            self.backend.watch_retry_budget,
        )
        .await
        .map_err(|e| (true, e))?;

        let ready_pod = tokio::select! {
            () = cancel.cancelled() => Err(ProvisionError::Cancelled {
                pod: identity.pod_name.clone(),
            }),
            ready = watcher.await_all_containers_running(self.backend.scheduling_timeout()) => ready,
        }
        .map_err(|e| (true, e))?;
        let attempt = attempt.containers_ready();

        let connect_timeout = Duration::from_secs(u64::from(
            template.connect_timeout_or(self.backend.connect_timeout_secs),
        ));
        self.await_agent_online(identity, &namespace, &ready_pod, connect_timeout, cancel)
            .await
            .map_err(|e| (true, e))?;

        Ok(attempt.agent_connected())
    }

    /// Poll the node lifecycle collaborator until the agent reports
    /// online, with the same self-adjusting interval as readiness waits.
    async fn await_agent_online(
        &self,
        identity: &AgentIdentity,
        namespace: &str,
        pod: &k8s_openapi::api::core::v1::Pod,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> ProvisionResult<()> {
        let deadline = tokio::time::Instant::now() + budget;

        loop {
            if self.nodes.is_online(&identity.id).await? {
                return Ok(());
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                warn!(
                    agent_id = %identity.id,
                    pod = %identity.pod_name,
                    "agent never connected within budget"
                );
                let logs = capture_logs(
                    self.cluster.as_ref(),
                    namespace,
                    &identity.pod_name,
                    &declared_containers(pod),
                )
                .await;
                return Err(ProvisionError::AgentConnectTimedOut {
                    pod: identity.pod_name.clone(),
                    waited: budget,
                    logs,
                });
            }

            let interval = poll_interval(deadline - now);
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(ProvisionError::Cancelled {
                        pod: identity.pod_name.clone(),
                    });
                }
                () = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Guaranteed cleanup after any post-reservation failure. Errors here
    /// are logged rather than propagated so they never mask the original
    /// failure.
    async fn cleanup_failed(
        &self,
        template: &AgentTemplate,
        identity: &AgentIdentity,
        node_created: bool,
    ) {
        let namespace = self.namespace_for(template);

        match self.cluster.delete_pod(namespace, &identity.pod_name).await {
            Ok(true) => debug!(pod = %identity.pod_name, "failed pod deleted"),
            Ok(false) => {}
            Err(err) => {
                warn!(pod = %identity.pod_name, error = %err, "failed to delete pod during cleanup");
            }
        }

        if node_created {
            if let Err(err) = self.nodes.remove_node(&identity.id).await {
                warn!(
                    agent_id = %identity.id,
                    error = %err,
                    "failed to remove node record during cleanup"
                );
            }
        }
    }

    /// Lazily reconcile capacity counters from the set of agents that were
    /// already active when the process started.
    async fn prime_capacity(&self) -> ProvisionResult<()> {
        if self.capacity.is_primed() {
            return Ok(());
        }
        let active = self.nodes.active_agents().await?;
        if self.capacity.prime(active) {
            debug!(backend = %self.backend.name, "capacity counters primed");
        }
        Ok(())
    }

    fn namespace_for<'a>(&'a self, template: &'a AgentTemplate) -> &'a str {
        template
            .namespace
            .as_deref()
            .unwrap_or(&self.backend.namespace)
    }
}
