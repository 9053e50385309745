//! Resource data models.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::kind::ResourceKind;
use crate::ports::PortPair;
use crate::proxy::RoutingConfig;

/// Observed lifecycle state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// No container is running.
    Stopped,
    /// Container created; waiting for readiness.
    Starting,
    /// Ready to serve.
    Running,
    /// Being torn down.
    Stopping,
    /// Failed to start or lost its container.
    Error,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Stopped => "stopped",
            ResourceStatus::Starting => "starting",
            ResourceStatus::Running => "running",
            ResourceStatus::Stopping => "stopping",
            ResourceStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stopped" => Ok(ResourceStatus::Stopped),
            "starting" => Ok(ResourceStatus::Starting),
            "running" => Ok(ResourceStatus::Running),
            "stopping" => Ok(ResourceStatus::Stopping),
            "error" => Ok(ResourceStatus::Error),
            _ => Err(format!("unknown resource status: {}", s)),
        }
    }
}

impl TryFrom<String> for ResourceStatus {
    type Error = String;

    // `Self::Error` would be ambiguous with the `Error` variant.
    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// A container-backed resource.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Resource {
    /// Externally assigned identifier.
    pub id: String,
    #[sqlx(try_from = "String")]
    pub kind: ResourceKind,
    #[sqlx(try_from = "String")]
    pub status: ResourceStatus,
    pub image: String,
    /// Per-resource environment, JSON object.
    #[sqlx(rename = "env")]
    #[serde(skip_serializing)]
    pub env_json: String,
    pub memory_limit: Option<String>,
    pub cpu_shares: Option<i64>,
    /// Runtime container id while a container exists.
    pub container_ref: Option<String>,
    pub container_name: String,
    pub volume_name: String,
    pub primary_port: Option<i64>,
    pub aux_port: Option<i64>,
    pub routing_domain: Option<String>,
    pub routing_subdomain: Option<String>,
    pub routing_path: Option<String>,
    /// Monitor session allowed to write the terminal state.
    #[serde(skip_serializing)]
    pub monitor_session: Option<String>,
    /// RUNNING was reached through the failsafe path.
    pub degraded_readiness: bool,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
    pub last_access_at: Option<String>,
}

impl Resource {
    /// Build a fresh STOPPED record.
    pub fn new(
        id: impl Into<String>,
        kind: ResourceKind,
        image: impl Into<String>,
        env: &BTreeMap<String, String>,
        routing: Option<&RoutingConfig>,
    ) -> Self {
        let id = id.into();
        Self {
            container_name: container_name_for(&id),
            volume_name: volume_name_for(&id),
            id,
            kind,
            status: ResourceStatus::Stopped,
            image: image.into(),
            env_json: serde_json::to_string(env).unwrap_or_else(|_| "{}".to_string()),
            memory_limit: None,
            cpu_shares: None,
            container_ref: None,
            primary_port: None,
            aux_port: None,
            routing_domain: routing.map(|r| r.domain.clone()),
            routing_subdomain: routing.and_then(|r| r.subdomain.clone()),
            routing_path: routing.and_then(|r| r.path.clone()),
            monitor_session: None,
            degraded_readiness: false,
            error_message: None,
            created_at: timestamp(chrono::Utc::now()),
            started_at: None,
            stopped_at: None,
            last_access_at: None,
        }
    }

    /// Routing intent, if the resource is exposed through the proxy.
    pub fn routing(&self) -> Option<RoutingConfig> {
        self.routing_domain.as_ref().map(|domain| RoutingConfig {
            domain: domain.clone(),
            subdomain: self.routing_subdomain.clone(),
            path: self.routing_path.clone(),
        })
    }

    /// Host ports held by this resource.
    pub fn ports(&self) -> Option<PortPair> {
        let primary = u16::try_from(self.primary_port?).ok()?;
        let aux = u16::try_from(self.aux_port?).ok()?;
        Some(PortPair { primary, aux })
    }

    /// Per-resource environment variables.
    pub fn env(&self) -> BTreeMap<String, String> {
        serde_json::from_str(&self.env_json).unwrap_or_default()
    }

    /// Whether a container is expected to be up.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            ResourceStatus::Starting | ResourceStatus::Running
        )
    }
}

/// Fixed-width RFC 3339 so stored timestamps compare lexically.
pub fn timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Deterministic container name for a resource id.
pub fn container_name_for(id: &str) -> String {
    format!("dockyard-{}", id)
}

/// Deterministic volume name for a resource id.
pub fn volume_name_for(id: &str) -> String {
    format!("dockyard-{}-data", id)
}

/// Request to register a new resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResourceRequest {
    pub id: String,
    pub kind: ResourceKind,
    /// Overrides the kind's default image.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub routing: Option<RoutingConfig>,
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub cpu_shares: Option<u32>,
}
