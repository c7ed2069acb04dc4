//! Typestate pattern for the provisioning state machine.
//!
//! This module encodes provisioning states in the type system, making
//! invalid state transitions a compile-time error rather than a runtime
//! error.
//!
//! # Example
//!
//! ```ignore
//! let requested = Attempt::<Requested>::create(data);
//! let reserved = requested.reserve();
//! let submitted = reserved.submit();
//! // submitted.reserve() would not compile - invalid transition
//! ```

use std::marker::PhantomData;

use crate::types::{AgentId, ProvisionPhase};

/// Marker trait for provisioning states.
pub trait AttemptState: private::Sealed + Send + Sync {
    /// Get the runtime phase representation.
    fn phase() -> ProvisionPhase;

    /// Get the state name for logs.
    fn name() -> &'static str;
}

mod private {
    pub trait Sealed {}
}

/// Provisioning requested, nothing reserved yet.
#[derive(Debug, Clone, Copy)]
pub struct Requested;

/// A capacity slot is held.
#[derive(Debug, Clone, Copy)]
pub struct CapacityReserved;

/// The pod document was accepted by the cluster.
#[derive(Debug, Clone, Copy)]
pub struct Submitted;

/// Every declared container is running and ready.
#[derive(Debug, Clone, Copy)]
pub struct ContainersReady;

/// The agent process connected back.
#[derive(Debug, Clone, Copy)]
pub struct AgentConnected;

impl private::Sealed for Requested {}
impl private::Sealed for CapacityReserved {}
impl private::Sealed for Submitted {}
impl private::Sealed for ContainersReady {}
impl private::Sealed for AgentConnected {}

impl AttemptState for Requested {
    fn phase() -> ProvisionPhase {
        ProvisionPhase::Requested
    }
    fn name() -> &'static str {
        "requested"
    }
}

impl AttemptState for CapacityReserved {
    fn phase() -> ProvisionPhase {
        ProvisionPhase::CapacityReserved
    }
    fn name() -> &'static str {
        "capacity_reserved"
    }
}

impl AttemptState for Submitted {
    fn phase() -> ProvisionPhase {
        ProvisionPhase::Submitted
    }
    fn name() -> &'static str {
        "submitted"
    }
}

impl AttemptState for ContainersReady {
    fn phase() -> ProvisionPhase {
        ProvisionPhase::ContainersReady
    }
    fn name() -> &'static str {
        "containers_ready"
    }
}

impl AttemptState for AgentConnected {
    fn phase() -> ProvisionPhase {
        ProvisionPhase::AgentConnected
    }
    fn name() -> &'static str {
        "agent_connected"
    }
}

/// Context carried across one provisioning attempt.
#[derive(Debug, Clone)]
pub struct AttemptData {
    /// Agent being provisioned.
    pub agent_id: AgentId,
    /// Backend the attempt targets.
    pub backend: String,
    /// Template the attempt was created from.
    pub template: String,
    /// Name of the submitted pod.
    pub pod_name: String,
    /// Namespace the pod lives in.
    pub namespace: String,
    /// When the attempt started.
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// A provisioning attempt in a specific state.
///
/// The state parameter `S` determines which transitions are available.
/// Invalid transitions are caught at compile time.
#[derive(Debug)]
pub struct Attempt<S: AttemptState> {
    data: AttemptData,
    _state: PhantomData<S>,
}

impl<S: AttemptState> Attempt<S> {
    /// Get a reference to the attempt data.
    #[must_use]
    pub const fn data(&self) -> &AttemptData {
        &self.data
    }

    /// Get the current phase.
    #[must_use]
    pub fn phase(&self) -> ProvisionPhase {
        S::phase()
    }

    /// Get the state name.
    #[must_use]
    pub fn state_name(&self) -> &'static str {
        S::name()
    }

    /// Convert into the underlying data (consuming the attempt).
    #[must_use]
    pub fn into_data(self) -> AttemptData {
        self.data
    }

    fn transition<T: AttemptState>(self) -> Attempt<T> {
        Attempt {
            data: self.data,
            _state: PhantomData,
        }
    }
}

impl Attempt<Requested> {
    /// Create a new attempt in the requested state.
    #[must_use]
    pub const fn create(data: AttemptData) -> Self {
        Self {
            data,
            _state: PhantomData,
        }
    }

    /// A capacity slot was granted.
    #[must_use]
    pub fn reserve(self) -> Attempt<CapacityReserved> {
        self.transition()
    }
}

impl Attempt<CapacityReserved> {
    /// The pod document was accepted by the cluster.
    #[must_use]
    pub fn submit(self) -> Attempt<Submitted> {
        self.transition()
    }
}

impl Attempt<Submitted> {
    /// Every declared container is running.
    #[must_use]
    pub fn containers_ready(self) -> Attempt<ContainersReady> {
        self.transition()
    }
}

impl Attempt<ContainersReady> {
    /// The agent process completed its connect-back handshake.
    #[must_use]
    pub fn agent_connected(self) -> Attempt<AgentConnected> {
        self.transition()
    }
}
