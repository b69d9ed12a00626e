//! Backend collaborators
//!
//! This module holds the data shapes exchanged with reporting agents and
//! the three collaborator contracts the server consumes: [`Scan`] for
//! vulnerability analysis, [`Monitor`] for pushing findings to an alerting
//! sink, and [`Store`] for the shared key-value persistence that agents
//! publish their inventories into.
//!
//! Concrete implementations are selected by name through
//! [`registry::BackendRegistry`].

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod fanout;
pub mod file_store;
pub mod http;
pub mod log_monitor;
pub mod memory_store;
pub mod registry;

pub use registry::BackendRegistry;

/// Identity of a reporting agent.
///
/// The tuple `(hostname, host_id, version, disambiguator)` is the identity;
/// [`Agent::key`] rebuilds the registry lookup key from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Agent {
    /// Host the agent runs on
    pub hostname: String,
    /// Container runtime / cluster identifier
    pub host_id: String,
    /// Agent software version
    pub version: String,
    /// Random disambiguator chosen by the agent at startup
    pub disambiguator: String,
    /// Maximum silence before the agent is considered dead
    pub lifetime: Duration,
}

impl Agent {
    /// Registry lookup key: the identity fields joined with `&`
    pub fn key(&self) -> String {
        format!(
            "{}&{}&{}&{}",
            self.hostname, self.host_id, self.version, self.disambiguator
        )
    }

    /// Key safe to use as a single path segment in a store
    pub fn encoded_key(&self) -> String {
        URL_SAFE.encode(self.key().as_bytes())
    }

    /// Rebuild an agent identity from an encoded key.
    ///
    /// The lifetime is not part of the identity and comes back as zero.
    pub fn decode_key(encoded: &str) -> Result<Self> {
        let raw = URL_SAFE
            .decode(encoded)
            .with_context(|| format!("agent key '{}' is not valid base64", encoded))?;
        let raw = String::from_utf8(raw).context("agent key is not valid UTF-8")?;
        let parts: Vec<&str> = raw.split('&').collect();
        if parts.len() != 4 {
            return Err(anyhow!("'{}' does not match an agent key", raw));
        }
        Ok(Self {
            hostname: parts[0].to_string(),
            host_id: parts[1].to_string(),
            version: parts[2].to_string(),
            disambiguator: parts[3].to_string(),
            lifetime: Duration::ZERO,
        })
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// A single running container as observed by an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub id: String,
    pub hostname: String,
    /// Image reference (tag) the container was started from
    pub image: String,
    pub image_id: String,
    /// Owner / assignee label
    pub owner: String,
    pub timestamp: DateTime<Utc>,
}

/// Containers published by one agent at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerGroup {
    /// Time bucket id (unix seconds)
    pub id: i64,
    pub date: DateTime<Utc>,
    pub containers: Vec<Container>,
}

/// Image identity plus the owners accumulated from its containers
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Image {
    pub tag: String,
    pub image_id: String,
    /// Batch the image was extracted from, 0 when unknown
    #[serde(default)]
    pub batch_id: i64,
    #[serde(default)]
    pub owners: Vec<String>,
}

/// Vulnerability severity.
///
/// Smaller is worse: `High < Medium < Low < Negligible`, so "at or above a
/// threshold" means `severity <= threshold`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    High = 0,
    Medium = 1,
    Low = 2,
    Negligible = 3,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::High => "High",
            Severity::Medium => "Medium",
            Severity::Low => "Low",
            Severity::Negligible => "Negligible",
        };
        f.write_str(name)
    }
}

/// A single finding reported by a scanner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cve {
    #[serde(default)]
    pub fix: String,
    #[serde(default)]
    pub package: String,
    pub severity: Severity,
    #[serde(default)]
    pub url: String,
    pub vuln: String,
    #[serde(default)]
    pub description: String,
}

/// Scan result for one image
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Vulnerabilities {
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub scanner: String,
    #[serde(default)]
    pub cves: Vec<Cve>,
}

/// An image together with its findings and the containers running it
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageStack {
    pub metadata: Image,
    #[serde(default)]
    pub vulnerabilities: Vulnerabilities,
    #[serde(default)]
    pub containers: Vec<Container>,
}

/// Overall status pushed to a monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Ok,
    Error,
}

impl MonitorStatus {
    /// Numeric check status (0 ok, 2 critical)
    pub fn code(self) -> u8 {
        match self {
            MonitorStatus::Ok => 0,
            MonitorStatus::Error => 2,
        }
    }
}

/// Connection settings handed to a backend constructor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Registry key of the backend (`memory`, `file`, `http`, `log`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Assignee used by ticketing monitors when an image has no owner
    #[serde(default)]
    pub default_assignee: Option<String>,
    #[serde(default)]
    pub create_tickets: bool,
    /// Backend specific settings
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl BackendConfig {
    /// Shorthand for a config that only names a backend
    pub fn named(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Default::default()
        }
    }
}

/// Vulnerability scanner
#[async_trait::async_trait]
pub trait Scan: Send + Sync {
    /// Scan an image and return its findings
    async fn scan(&self, image: &Image) -> Result<Vulnerabilities>;
}

/// Alerting / ticketing sink
#[async_trait::async_trait]
pub trait Monitor: Send + Sync {
    /// Report the current findings of an image
    async fn push(&self, stack: &ImageStack, status: MonitorStatus) -> Result<()>;

    /// Report that an image (or some of its owners) is gone
    async fn resolve(&self, stack: &ImageStack) -> Result<()>;
}

/// Shared persistence between agents and the server
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Record a container for an agent, in the batch of its timestamp
    async fn store_container(&self, container: &Container, agent: &Agent) -> Result<()>;

    /// Persist an image stack under `prefix`, keyed by image id
    async fn store_image_stack(&self, stack: &ImageStack, prefix: &str) -> Result<()>;

    /// All agents that have published data
    async fn load_agents(&self) -> Result<Vec<Agent>>;

    /// Latest batch published by an agent
    async fn load_container_group(&self, agent: &Agent) -> Result<ContainerGroup>;

    /// Every image stack persisted under `prefix`
    async fn load_image_stacks(&self, prefix: &str) -> Result<Vec<ImageStack>>;

    /// Drop every batch of the agent except `latest_batch_id`
    async fn maintain(&self, agent: &Agent, latest_batch_id: i64) -> Result<()>;

    /// Remove an agent and everything it published
    async fn delete_agent(&self, agent: &Agent) -> Result<()>;

    /// Remove a key (and anything nested below it)
    async fn delete(&self, key: &str) -> Result<()>;
}

/// The collaborator instances one server runs with
#[derive(Clone)]
pub struct Backends {
    pub scanner: Arc<dyn Scan>,
    pub monitor: Arc<dyn Monitor>,
    pub store: Arc<dyn Store>,
}

/// Store key of an image stack persisted under `prefix`
pub fn stack_key(prefix: &str, image_id: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), image_id)
}
