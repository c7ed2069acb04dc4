//! Controller-side agent registration.
//!
//! Pods are only half of an agent: the build server must also know about
//! the agent node before the remote process can connect back. The
//! [`NodeLifecycle`] trait is that registration seam; production wires it
//! to the server's node registry, tests use [`MockNodes`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gantry_template::AgentTemplate;
use parking_lot::Mutex;

use crate::error::ProvisionResult;
use crate::types::AgentId;

/// Registration of agent nodes with the controlling build server.
#[async_trait]
pub trait NodeLifecycle: Send + Sync {
    /// Register a node record ahead of pod submission so the agent can
    /// connect back as soon as its container starts.
    async fn create_node(&self, template: &AgentTemplate, id: &AgentId) -> ProvisionResult<()>;

    /// Whether the remote agent process has connected and completed its
    /// handshake.
    async fn is_online(&self, id: &AgentId) -> ProvisionResult<bool>;

    /// Remove the node record. Must be idempotent: removing an unknown
    /// node succeeds.
    async fn remove_node(&self, id: &AgentId) -> ProvisionResult<()>;

    /// (backend, template) pairs for agents currently registered, used to
    /// prime capacity counters after a restart.
    async fn active_agents(&self) -> ProvisionResult<Vec<(String, String)>>;
}

/// In-memory [`NodeLifecycle`] for tests.
#[derive(Debug, Default)]
pub struct MockNodes {
    inner: Mutex<MockNodesInner>,
}

#[derive(Debug, Default)]
struct MockNodesInner {
    nodes: HashMap<AgentId, String>,
    online: HashMap<AgentId, bool>,
    removed: Vec<AgentId>,
    active: Vec<(String, String)>,
}

impl MockNodes {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark an agent as connected; subsequent `is_online` calls return true.
    pub fn set_online(&self, id: &AgentId) {
        self.inner.lock().online.insert(id.clone(), true);
    }

    /// Seed the active-agent set reported to capacity priming.
    pub fn set_active(&self, active: Vec<(String, String)>) {
        self.inner.lock().active = active;
    }

    /// Ids passed to `remove_node`, in call order.
    #[must_use]
    pub fn removed(&self) -> Vec<AgentId> {
        self.inner.lock().removed.clone()
    }

    /// Whether a node record currently exists.
    #[must_use]
    pub fn has_node(&self, id: &AgentId) -> bool {
        self.inner.lock().nodes.contains_key(id)
    }
}

#[async_trait]
impl NodeLifecycle for MockNodes {
    async fn create_node(&self, template: &AgentTemplate, id: &AgentId) -> ProvisionResult<()> {
        self.inner
            .lock()
            .nodes
            .insert(id.clone(), template.name.clone());
        Ok(())
    }

    async fn is_online(&self, id: &AgentId) -> ProvisionResult<bool> {
        Ok(self.inner.lock().online.get(id).copied().unwrap_or(false))
    }

    async fn remove_node(&self, id: &AgentId) -> ProvisionResult<()> {
        let mut inner = self.inner.lock();
        inner.nodes.remove(id);
        inner.online.remove(id);
        inner.removed.push(id.clone());
        Ok(())
    }

    async fn active_agents(&self) -> ProvisionResult<Vec<(String, String)>> {
        Ok(self.inner.lock().active.clone())
    }
}
