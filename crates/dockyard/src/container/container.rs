//! Container types and configuration.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::error::{ContainerError, ContainerResult};

/// Port mapping configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port in the container.
    pub container_port: u16,
}

impl PortMapping {
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
        }
    }
}

/// Configuration for creating a new container.
///
/// Maps are ordered so the generated command line is stable.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name (optional).
    pub name: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// Command to run.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Port mappings.
    pub ports: Vec<PortMapping>,
    /// Volume mounts (named volume or host path -> container path).
    pub volumes: Vec<(String, String)>,
    /// Labels for the container.
    pub labels: BTreeMap<String, String>,
    /// Network to attach to.
    pub network: Option<String>,
    /// Memory limit in runtime notation (e.g. "512m", "2g").
    pub memory_limit: Option<String>,
    /// Relative CPU weight.
    pub cpu_shares: Option<u32>,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all container configuration fields.
    ///
    /// Arguments are passed to the runtime binary without a shell, but names
    /// and paths still end up in runtime state, so reject anything odd early.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        for (source, target) in &self.volumes {
            validate_volume_path(source, "host")?;
            validate_container_path(target)?;
        }

        for key in self.labels.keys() {
            validate_label_key(key)?;
        }

        if let Some(ref network) = self.network {
            validate_container_name(network)?;
        }

        if let Some(ref memory) = self.memory_limit {
            validate_memory_limit(memory)?;
        }

        Ok(())
    }

    /// Set the container name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the command to run.
    pub fn command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add multiple environment variables. Later values win.
    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in envs {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    /// Add a port mapping.
    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortMapping::new(host_port, container_port));
        self
    }

    /// Add a volume mount.
    pub fn volume(mut self, source: impl Into<String>, container_path: impl Into<String>) -> Self {
        self.volumes.push((source.into(), container_path.into()));
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add multiple labels.
    pub fn labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels.extend(labels);
        self
    }

    /// Attach the container to a network.
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Set the memory limit.
    pub fn memory_limit(mut self, limit: impl Into<String>) -> Self {
        self.memory_limit = Some(limit.into());
        self
    }

    /// Set the CPU shares.
    pub fn cpu_shares(mut self, shares: u32) -> Self {
        self.cpu_shares = Some(shares);
        self
    }

    /// Render the `run` arguments for this config.
    pub(crate) fn run_args(&self, selinux_labels: bool) -> Vec<String> {
        let mut args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

        if let Some(ref name) = self.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }

        if let Some(ref network) = self.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }

        for port in &self.ports {
            args.push("-p".to_string());
            args.push(format!("{}:{}", port.host_port, port.container_port));
        }

        for (source, target) in &self.volumes {
            args.push("-v".to_string());
            // Relabelling only applies to bind mounts of host paths.
            if selinux_labels && source.starts_with('/') {
                args.push(format!("{}:{}:Z", source, target));
            } else {
                args.push(format!("{}:{}", source, target));
            }
        }

        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        if let Some(ref memory) = self.memory_limit {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }

        if let Some(shares) = self.cpu_shares {
            args.push("--cpu-shares".to_string());
            args.push(shares.to_string());
        }

        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());

        args
    }
}

/// Container state as reported by `inspect`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    /// Parse the `{{.State.Status}}` string. Podman reports "stopped" where
    /// Docker reports "exited".
    pub fn from_status(status: &str) -> Self {
        match status.trim().trim_matches('"').to_lowercase().as_str() {
            "created" | "configured" | "initialized" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" | "stopped" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Parse `{{.State.StartedAt}}`. Docker prints RFC 3339, Podman prints Go's
/// default layout (`2024-05-01 10:00:00.123456789 +0000 UTC`).
pub fn parse_started_at(raw: &str) -> ContainerResult<DateTime<Utc>> {
    let raw = raw.trim().trim_matches('"');
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }

    // Go appends the zone abbreviation after the numeric offset.
    let without_zone = match raw.rsplit_once(' ') {
        Some((head, zone)) if !zone.is_empty() && zone.chars().all(|c| c.is_ascii_alphabetic()) => {
            head
        }
        _ => raw,
    };
    DateTime::parse_from_str(without_zone, "%Y-%m-%d %H:%M:%S%.f %z")
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| ContainerError::ParseError(format!("start time '{}': {}", raw, e)))
}

/// Output of a command run inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Container information from `ps --format json`.
///
/// Podman emits a JSON array with list/map fields; Docker emits one object per
/// line with comma-joined strings. Both shapes deserialize into this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Container {
    /// Container ID.
    #[serde(alias = "Id", alias = "ID")]
    pub id: String,

    /// Container names.
    #[serde(default, deserialize_with = "deserialize_names")]
    pub names: Vec<String>,

    /// Image used.
    #[serde(default)]
    pub image: String,

    /// Container state.
    #[serde(default)]
    pub state: ContainerState,

    /// Container labels.
    #[serde(default, deserialize_with = "deserialize_labels")]
    pub labels: BTreeMap<String, String>,
}

impl Container {
    /// Label value, if present.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// One line of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub source: LogSource,
    pub text: String,
}

/// Which output stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
}

fn deserialize_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Names {
        List(Vec<String>),
        Joined(String),
        Missing(Option<()>),
    }

    Ok(match Names::deserialize(deserializer)? {
        Names::List(list) => list,
        Names::Joined(joined) => joined
            .split(',')
            .map(|s| s.trim().trim_start_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Names::Missing(_) => Vec::new(),
    })
}

fn deserialize_labels<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Labels {
        Map(BTreeMap<String, String>),
        Joined(String),
        Missing(Option<()>),
    }

    Ok(match Labels::deserialize(deserializer)? {
        Labels::Map(map) => map,
        Labels::Joined(joined) => joined
            .split(',')
            .filter_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                Some((k.trim().to_string(), v.to_string()))
            })
            .collect(),
        Labels::Missing(_) => BTreeMap::new(),
    })
}

/// Parse `ps --format json` output from either runtime.
pub fn parse_container_list(stdout: &str) -> ContainerResult<Vec<Container>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| ContainerError::ParseError(e.to_string()));
    }

    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| ContainerError::ParseError(e.to_string()))
        })
        .collect()
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@')
    };

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters; only alphanumeric, '.', '-', '_', '/', ':', '@' are allowed",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container, volume or network name.
///
/// Names must start with an alphanumeric character or underscore and contain
/// only alphanumerics, hyphens, underscores and dots.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    let Some(first_char) = name.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    };

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters; only alphanumeric, '-', '_', '.' are allowed",
            name
        )));
    }

    Ok(())
}

/// Validate a single DNS label. Returns the reason on failure.
pub fn validate_dns_label(label: &str) -> Result<(), &'static str> {
    let (Some(first), Some(last)) = (label.chars().next(), label.chars().last()) else {
        return Err("empty label");
    };

    if label.len() > 63 {
        return Err("label exceeds 63 characters");
    }

    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return Err("labels must start and end with alphanumeric characters");
    }

    if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err("labels may only contain alphanumerics and '-'");
    }

    Ok(())
}

/// Validate an environment variable key (POSIX style).
fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    let Some(first_char) = key.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    };

    if key.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "environment variable key exceeds maximum length of 256 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters; only alphanumeric and '_' are allowed",
            key
        )));
    }

    Ok(())
}

/// Validate a label key (`a.b-c_d/e` style).
fn validate_label_key(key: &str) -> ContainerResult<()> {
    if key.is_empty() || key.len() > 256 {
        return Err(ContainerError::InvalidInput(format!(
            "label key '{}' must be 1-256 characters",
            key
        )));
    }

    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/'))
    {
        return Err(ContainerError::InvalidInput(format!(
            "label key '{}' contains invalid characters",
            key
        )));
    }

    Ok(())
}

/// Validate a volume source (named volume or host path).
fn validate_volume_path(path: &str, side: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path cannot be empty",
            side
        )));
    }

    if path.len() > 4096 {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path exceeds maximum length of 4096 characters",
            side
        )));
    }

    if path.contains('\0') {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path cannot contain null bytes",
            side
        )));
    }

    const DANGEROUS: [char; 22] = [
        '$', '`', '!', '&', '|', ';', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?', '\\', '"',
        '\'', '\n', '\r', ':',
    ];
    if let Some(c) = DANGEROUS.iter().find(|c| path.contains(**c)) {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path contains dangerous character '{}'",
            side, c
        )));
    }

    Ok(())
}

/// Validate a container-internal path.
fn validate_container_path(path: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container path cannot be empty".to_string(),
        ));
    }

    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(
            "container path must be absolute (start with '/')".to_string(),
        ));
    }

    if path.contains('\0') || path.contains(':') {
        return Err(ContainerError::InvalidInput(
            "container path cannot contain null bytes or ':'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a memory limit such as `512m`, `2g` or `1073741824`.
fn validate_memory_limit(limit: &str) -> ContainerResult<()> {
    let digits = limit.trim_end_matches(['b', 'k', 'm', 'g', 'B', 'K', 'M', 'G']);
    let suffix_len = limit.len() - digits.len();
    if digits.is_empty() || suffix_len > 1 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ContainerError::InvalidInput(format!(
            "memory limit '{}' must be a number with an optional b/k/m/g suffix",
            limit
        )));
    }
    Ok(())
}
