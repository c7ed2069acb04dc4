//! Provisioner configuration with layered loading.
//!
//! Configuration is read from a TOML file (`gantry.toml` by default) with
//! `GANTRY_`-prefixed environment variables layered on top.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use gantry_template::{AgentTemplate, TemplateMap, UNCAPPED};
use serde::Deserialize;

use crate::error::ProvisionError;

/// One provisioning backend: a target cluster plus its agent templates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend name, used in logs and capacity accounting.
    pub name: String,
    /// Namespace pods are created in unless a template overrides it.
    pub namespace: String,
    /// Maximum concurrent agents across all templates of this backend.
    pub container_cap: u32,
    /// Seconds to wait for a submitted pod to reach running containers.
    pub scheduling_timeout_secs: u64,
    /// Default seconds to wait for the agent process to connect, used by
    /// templates that do not set their own timeout.
    pub connect_timeout_secs: u32,
    /// Template merged underneath every other template of this backend.
    pub defaults_template: Option<String>,
    /// Image used when a template declares no agent container.
    pub agent_image: String,
    /// URL injected into agent pods for the connect-back handshake.
    pub callback_url: String,
    /// Forward `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY` from the provisioner
    /// environment into agent pods.
    pub proxy_passthrough: bool,
    /// Upper bound on the final re-checks after the scheduling deadline
    /// has elapsed.
    pub watch_retry_budget: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
            namespace: "default".to_owned(),
            container_cap: UNCAPPED,
            scheduling_timeout_secs: default_scheduling_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            defaults_template: None,
            agent_image: default_agent_image(),
            callback_url: String::new(),
            proxy_passthrough: false,
            watch_retry_budget: default_watch_retry_budget(),
        }
    }
}

const fn default_scheduling_timeout_secs() -> u64 {
    600
}

const fn default_connect_timeout_secs() -> u32 {
    100
}

const fn default_watch_retry_budget() -> u32 {
    100
}

fn default_agent_image() -> String {
    "gantry/inbound-agent:latest".to_owned()
}

impl BackendConfig {
    /// Scheduling timeout as a [`Duration`].
    #[must_use]
    pub const fn scheduling_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduling_timeout_secs)
    }
}

/// Top-level provisioner configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GantryConfig {
    /// Backend settings.
    pub backend: BackendConfig,
    /// Agent templates, unresolved.
    pub templates: Vec<AgentTemplate>,
}

impl GantryConfig {
    /// Load configuration from the default path (`gantry.toml`).
    pub fn load() -> Result<Self, ProvisionError> {
        Self::load_from("gantry.toml")
    }

    /// Load configuration from a file path, with `GANTRY_`-prefixed
    /// environment variables layered on top.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ProvisionError> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("GANTRY_").split("__"))
            .extract::<Self>()
            .map_err(|err| ProvisionError::config(err.to_string()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ProvisionError> {
        Figment::new()
            .merge(Toml::string(content))
            .extract::<Self>()
            .map_err(|err| ProvisionError::config(err.to_string()))
    }

    /// Templates keyed by name, for resolution.
    #[must_use]
    pub fn template_map(&self) -> TemplateMap {
        self.templates
            .iter()
            .map(|t| (t.name.clone(), t.clone()))
            .collect::<HashMap<_, _>>()
    }
}
