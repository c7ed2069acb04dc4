//! Core types for gantry-provisioner.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for one provisioned agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Create an agent ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique agent ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short suffix used when deriving pod names.
    #[must_use]
    pub fn short(&self) -> &str {
        let len = self.0.len();
        &self.0[len.saturating_sub(6)..]
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identity of one provisioning attempt, fed into the pod document.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    /// Unique agent identifier.
    pub id: AgentId,
    /// Name of the pod to create. May contain `${VAR}` references that are
    /// substituted at build time.
    pub pod_name: String,
    /// One-time connection secret handed to the agent process.
    pub secret: String,
    /// URL the agent process calls back to.
    pub callback_url: String,
}

impl AgentIdentity {
    /// Derive an identity for a template, generating the ID and secret.
    #[must_use]
    pub fn for_template(template_name: &str, callback_url: impl Into<String>) -> Self {
        let id = AgentId::generate();
        let pod_name = format!("{}-{}", sanitise_name(template_name), id.short());
        Self {
            id,
            pod_name,
            secret: ulid::Ulid::new().to_string().to_lowercase(),
            callback_url: callback_url.into(),
        }
    }
}

/// Maximum length of a pod name component derived from a template name.
const MAX_NAME_COMPONENT: usize = 56;

/// Sanitise a template name into a valid DNS-1123 pod name component.
#[must_use]
pub fn sanitise_name(value: &str) -> String {
    let lowered: String = value
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let trimmed = lowered.trim_matches('-');
    let truncated = if trimmed.len() > MAX_NAME_COMPONENT {
        &trimmed[..MAX_NAME_COMPONENT]
    } else {
        trimmed
    };
    let result = truncated.trim_end_matches('-');

    if result.is_empty() {
        "agent".to_owned()
    } else {
        result.to_owned()
    }
}

/// Runtime mirror of the provisioning state machine, used for logging and
/// failure context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionPhase {
    /// Provisioning requested, nothing reserved yet.
    Requested,
    /// A capacity slot is held.
    CapacityReserved,
    /// The pod document was accepted by the cluster.
    Submitted,
    /// Every declared container is running and ready.
    ContainersReady,
    /// The agent process connected back.
    AgentConnected,
    /// The agent is live and accepting work.
    Active,
}

impl ProvisionPhase {
    /// Get the phase name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::CapacityReserved => "capacity_reserved",
            Self::Submitted => "submitted",
            Self::ContainersReady => "containers_ready",
            Self::AgentConnected => "agent_connected",
            Self::Active => "active",
        }
    }
}

impl fmt::Display for ProvisionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The captured tail of one container's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLog {
    /// Container name.
    pub container: String,
    /// Captured log tail.
    pub tail: String,
}

/// Best-effort diagnostic log tails captured on failure paths.
///
/// Retrieval failures degrade to an empty collection rather than masking
/// the original error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticLogs(pub Vec<ContainerLog>);

impl DiagnosticLogs {
    /// Returns true when no logs could be captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DiagnosticLogs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "no logs available");
        }
        for (i, log) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "---- {} ----\n{}", log.container, log.tail.trim_end())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(AgentId::generate(), AgentId::generate());
    }

    #[test]
    fn sanitise_name_handles_awkward_input() {
        assert_eq!(sanitise_name("Maven JDK-17"), "maven-jdk-17");
        assert_eq!(sanitise_name("--weird--"), "weird");
        assert_eq!(sanitise_name("!!!"), "agent");

        let long = "x".repeat(100);
        assert!(sanitise_name(&long).len() <= MAX_NAME_COMPONENT);
    }

    #[test]
    fn identity_derives_pod_name_from_template() {
        let identity = AgentIdentity::for_template("Maven Build", "http://gantry:8080");
        assert!(identity.pod_name.starts_with("maven-build-"));
        assert!(!identity.secret.is_empty());
    }

    #[test]
    fn empty_logs_display_placeholder() {
        assert_eq!(DiagnosticLogs::default().to_string(), "no logs available");
    }

    #[test]
    fn logs_display_per_container() {
        let logs = DiagnosticLogs(vec![ContainerLog {
            container: "maven".to_owned(),
            tail: "OOMKilled\n".to_owned(),
        }]);
        let rendered = logs.to_string();
        assert!(rendered.contains("---- maven ----"));
        assert!(rendered.contains("OOMKilled"));
    }
}
