//! Gantry Provisioning Engine
//!
//! This crate provisions ephemeral Kubernetes-hosted build agents on
//! demand and tears them down on failure or termination. It sits between
//! the build server's work queue (which decides *when* capacity is
//! needed) and the cluster API (which hosts the agents).
//!
//! # Architecture
//!
//! One [`Provisioner`] serves one backend and coordinates:
//!
//! - **Capacity accounting**: [`CapacityTracker`] enforces per-backend and
//!   per-template concurrency caps atomically across parallel requests
//! - **Pod construction**: [`PodBuilder`] deterministically builds the pod
//!   document from a resolved template plus one agent identity
//! - **Readiness watching**: [`PodWatcher`] combines push events with
//!   periodic re-fetches until every container runs, failing fast when a
//!   container terminates
//! - **Guaranteed cleanup**: every failure after capacity reservation
//!   deletes the pod, removes the node record and releases the slot,
//!   exactly once
//!
//! # State Machine
//!
//! Provisioning attempts follow a strict state machine enforced at
//! compile time using the typestate pattern:
//!
//! ```text
//! Requested ──▶ CapacityReserved ──▶ Submitted ──▶ ContainersReady ──▶ AgentConnected
//! ```
//!
//! Failure states (`CapacityRejected`, `SubmissionFailed`,
//! `ContainersTerminated`, `SchedulingTimedOut`, `AgentConnectTimedOut`)
//! are carried by [`ProvisionError`] rather than the typestate, since
//! every post-reservation failure funnels into the same cleanup path.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use gantry_provisioner::{GantryConfig, KubeCluster, Provisioner};
//!
//! let config = GantryConfig::load()?;
//! let cluster = Arc::new(KubeCluster::new().await?);
//! let provisioner = Provisioner::new(cluster, nodes, config);
//!
//! let agent = provisioner.provision("maven").await?;
//! // ... agent executes queued work ...
//! provisioner.terminate(agent).await?;
//! ```

#![forbid(unsafe_code)]

pub mod capacity;
pub mod cluster;
pub mod config;
pub mod error;
pub mod node;
pub mod orchestrator;
pub mod pod;
pub mod state;
pub mod types;
pub mod watcher;

pub use capacity::{CapacitySlot, CapacityTracker};
pub use cluster::{ClusterClient, ClusterError, KubeCluster, MockCluster};
pub use config::{BackendConfig, GantryConfig};
pub use error::{ProvisionError, ProvisionResult};
pub use node::{MockNodes, NodeLifecycle};
pub use orchestrator::{ActiveAgent, Provisioner};
pub use pod::{DecoratorRegistry, PodBuilder, PodDecorator};
pub use state::{Attempt, AttemptData, AttemptState};
pub use types::{AgentId, AgentIdentity, DiagnosticLogs, ProvisionPhase};
pub use watcher::PodWatcher;
