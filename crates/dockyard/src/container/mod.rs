//! Container runtime management module.
//!
//! Provides an async interface to manage containers via Docker or Podman CLI.
//! The runtime is auto-detected or can be configured explicitly.

mod container;
mod error;

pub use container::{
    Container, ContainerConfig, ContainerState, ExecOutput, LogLine, LogSource, PortMapping,
    parse_container_list, parse_started_at, validate_container_name, validate_dns_label,
    validate_image_name,
};
pub use error::{ContainerError, ContainerResult};

use std::collections::BTreeMap;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Stream of followed log lines. Ends when the container stops logging or the
/// consumer drops it (which also kills the underlying `logs -f` process).
pub type LogLineStream = BoxStream<'static, ContainerResult<LogLine>>;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime
    Docker,
    /// Podman runtime
    #[default]
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether this runtime requires SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        match self {
            RuntimeType::Docker => false,
            RuntimeType::Podman => true,
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Validate a container ID or name.
///
/// Container IDs are hex strings (12 or 64 chars for docker/podman).
/// Container names follow the same rules as container creation.
fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if !id.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Which runtime backs this client.
    fn runtime_type(&self) -> RuntimeType;
    /// Check the runtime responds; returns its version payload.
    async fn health_check(&self) -> ContainerResult<String>;

    async fn image_exists(&self, image: &str) -> ContainerResult<bool>;
    async fn pull_image(&self, image: &str) -> ContainerResult<()>;

    /// Create and start a container, returning its id.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;
    async fn start_container(&self, container_id: &str) -> ContainerResult<()>;
    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;
    async fn restart_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;

    /// `Ok(None)` only when the runtime positively reports the container as
    /// absent. Any other failure is an error.
    async fn container_state_status(
        &self,
        id_or_name: &str,
    ) -> ContainerResult<Option<ContainerState>>;
    /// When the container's current run began. `Ok(None)` when it does not
    /// exist.
    async fn container_started_at(
        &self,
        id_or_name: &str,
    ) -> ContainerResult<Option<DateTime<Utc>>>;
    /// List all containers (running or not) carrying the given label filter.
    async fn list_containers(&self, label_filter: Option<&str>) -> ContainerResult<Vec<Container>>;

    /// Recent combined stdout/stderr, optionally only output after `since`
    /// (RFC 3339).
    async fn get_logs(
        &self,
        container_id: &str,
        tail: Option<u32>,
        since: Option<&str>,
    ) -> ContainerResult<String>;
    /// Follow output, each line tagged with the stream it came from.
    async fn follow_logs(&self, container_id: &str, tail: u32) -> ContainerResult<LogLineStream>;

    async fn volume_exists(&self, name: &str) -> ContainerResult<bool>;
    async fn create_volume(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> ContainerResult<()>;
    async fn remove_volume(&self, name: &str) -> ContainerResult<()>;

    async fn network_exists(&self, name: &str) -> ContainerResult<bool>;
    async fn create_network(&self, name: &str) -> ContainerResult<()>;

    /// Run a command in a running container and collect its output. A
    /// non-zero exit of the command itself is not an error.
    async fn exec_output(
        &self,
        container_id: &str,
        command: &[String],
    ) -> ContainerResult<ExecOutput>;
}

/// Container runtime client for managing containers.
///
/// Stateless: every call shells out to the runtime binary.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    /// The runtime type (docker or podman)
    runtime_type: RuntimeType,
    /// Path to the container binary
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Docker on macOS and Podman elsewhere.
    pub fn new() -> Self {
        #[cfg(target_os = "macos")]
        {
            if Self::is_binary_available("docker") {
                return Self::with_type(RuntimeType::Docker);
            }
        }

        if Self::is_binary_available("podman") {
            Self::with_type(RuntimeType::Podman)
        } else if Self::is_binary_available("docker") {
            Self::with_type(RuntimeType::Docker)
        } else {
            // Fall back to podman, will fail at runtime
            Self::with_type(RuntimeType::Podman)
        }
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run the binary and collect its output without judging the exit code.
    async fn output<I, S>(&self, command: &str, args: I) -> ContainerResult<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ContainerError::NoRuntimeAvailable
                } else {
                    ContainerError::CommandFailed {
                        command: command.to_string(),
                        message: e.to_string(),
                    }
                }
            })
    }

    /// Run the binary and fail on a non-zero exit, returning stdout.
    async fn run_checked<I, S>(&self, command: &str, target: &str, args: I) -> ContainerResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let output = self.output(command, args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::from_stderr(command, target, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run an existence check (`inspect`-style). Missing objects are `false`,
    /// an unreachable runtime is an error.
    async fn object_exists<I, S>(&self, command: &str, target: &str, args: I) -> ContainerResult<bool>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        match self.run_checked(command, target, args).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    async fn health_check(&self) -> ContainerResult<String> {
        self.run_checked("version", "", ["version", "--format", "json"])
            .await
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;
        self.object_exists("image inspect", image, ["image", "inspect", image])
            .await
    }

    async fn pull_image(&self, image: &str) -> ContainerResult<()> {
        validate_image_name(image)?;
        self.run_checked("pull", image, ["pull", image]).await?;
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let args = config.run_args(self.runtime_type.needs_selinux_labels());
        let target = config.name.clone().unwrap_or_else(|| config.image.clone());
        let stdout = self.run_checked("run", &target, &args).await?;

        // Image pull progress can precede the id; the id is the last line.
        stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ContainerError::ParseError("run returned no container id".to_string()))
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;
        self.run_checked("start", container_id, ["start", container_id])
            .await?;
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["stop".to_string()];
        if let Some(t) = timeout_seconds {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        args.push(container_id.to_string());

        self.run_checked("stop", container_id, &args).await?;
        Ok(())
    }

    async fn restart_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["restart".to_string()];
        if let Some(t) = timeout_seconds {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        args.push(container_id.to_string());

        self.run_checked("restart", container_id, &args).await?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(container_id);

        self.run_checked("rm", container_id, &args).await?;
        Ok(())
    }

    async fn container_state_status(
        &self,
        id_or_name: &str,
    ) -> ContainerResult<Option<ContainerState>> {
        validate_container_id_or_name(id_or_name)?;

        let result = self
            .run_checked(
                "inspect",
                id_or_name,
                ["inspect", "--format", "{{.State.Status}}", id_or_name],
            )
            .await;

        match result {
            Ok(stdout) => {
                let status = stdout.trim();
                if status.is_empty() {
                    return Err(ContainerError::ParseError(format!(
                        "inspect returned no state for {}",
                        id_or_name
                    )));
                }
                Ok(Some(ContainerState::from_status(status)))
            }
            Err(ContainerError::ContainerNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn container_started_at(
        &self,
        id_or_name: &str,
    ) -> ContainerResult<Option<DateTime<Utc>>> {
        validate_container_id_or_name(id_or_name)?;

        let result = self
            .run_checked(
                "inspect",
                id_or_name,
                ["inspect", "--format", "{{.State.StartedAt}}", id_or_name],
            )
            .await;

        match result {
            Ok(stdout) => parse_started_at(&stdout).map(Some),
            Err(ContainerError::ContainerNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_containers(&self, label_filter: Option<&str>) -> ContainerResult<Vec<Container>> {
        let mut args: Vec<String> = vec!["ps".to_string(), "-a".to_string()];
        if let Some(filter) = label_filter {
            args.push("--filter".to_string());
            args.push(format!("label={}", filter));
        }
        args.push("--format".to_string());
        args.push("json".to_string());

        let stdout = self.run_checked("ps", "", &args).await?;
        parse_container_list(&stdout)
    }

    async fn get_logs(
        &self,
        container_id: &str,
        tail: Option<u32>,
        since: Option<&str>,
    ) -> ContainerResult<String> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["logs".to_string()];
        if let Some(n) = tail {
            args.push("--tail".to_string());
            args.push(n.to_string());
        }
        if let Some(since) = since {
            args.push("--since".to_string());
            args.push(since.to_string());
        }
        args.push(container_id.to_string());

        let output = self.output("logs", &args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(ContainerError::from_stderr("logs", container_id, &stderr));
        }

        // The container's stderr arrives on our stderr.
        Ok(format!("{}{}", stdout, stderr))
    }

    async fn follow_logs(&self, container_id: &str, tail: u32) -> ContainerResult<LogLineStream> {
        validate_container_id_or_name(container_id)?;

        let mut child = Command::new(&self.binary)
            .args(["logs", "--follow", "--tail", &tail.to_string(), container_id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ContainerError::CommandFailed {
                command: "logs".to_string(),
                message: e.to_string(),
            })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ContainerError::CommandFailed {
                command: "logs".to_string(),
                message: "log pipes were not captured".to_string(),
            });
        };

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(pump_lines(stdout, LogSource::Stdout, tx.clone()));
        tokio::spawn(pump_lines(stderr, LogSource::Stderr, tx.clone()));

        let target = container_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let failure = match status {
                        Ok(status) if status.success() => None,
                        Ok(status) => Some(format!("log follower for {} exited with {}", target, status)),
                        Err(e) => Some(e.to_string()),
                    };
                    if let Some(message) = failure {
                        let _ = tx
                            .send(Err(ContainerError::CommandFailed {
                                command: "logs".to_string(),
                                message,
                            }))
                            .await;
                    }
                }
                // Consumer went away; dropping `child` kills the follower.
                _ = tx.closed() => {}
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn volume_exists(&self, name: &str) -> ContainerResult<bool> {
        validate_container_name(name)?;
        self.object_exists("volume inspect", name, ["volume", "inspect", name])
            .await
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> ContainerResult<()> {
        validate_container_name(name)?;

        let mut args: Vec<String> = vec!["volume".to_string(), "create".to_string()];
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(name.to_string());

        self.run_checked("volume create", name, &args).await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> ContainerResult<()> {
        validate_container_name(name)?;
        self.run_checked("volume rm", name, ["volume", "rm", "-f", name])
            .await?;
        Ok(())
    }

    async fn network_exists(&self, name: &str) -> ContainerResult<bool> {
        validate_container_name(name)?;
        self.object_exists("network inspect", name, ["network", "inspect", name])
            .await
    }

    async fn create_network(&self, name: &str) -> ContainerResult<()> {
        validate_container_name(name)?;
        self.run_checked("network create", name, ["network", "create", name])
            .await?;
        Ok(())
    }

    async fn exec_output(
        &self,
        container_id: &str,
        command: &[String],
    ) -> ContainerResult<ExecOutput> {
        validate_container_id_or_name(container_id)?;
        if command.is_empty() {
            return Err(ContainerError::InvalidInput(
                "exec command cannot be empty".to_string(),
            ));
        }

        let mut args: Vec<&str> = vec!["exec", container_id];
        args.extend(command.iter().map(String::as_str));

        let output = self.output("exec", &args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        // 125 is the runtime's own failure; anything else is the command's.
        let lower = stderr.to_lowercase();
        if output.status.code() == Some(125)
            || lower.contains("error response from daemon")
            || lower.contains("no such container")
            || error::is_unreachable_message(&lower)
        {
            return Err(ContainerError::from_stderr("exec", container_id, &stderr));
        }

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }
}

/// Forward newline-framed output into the channel. `read_until` keeps partial
/// lines buffered across reads, so a line is never split between two events.
async fn pump_lines<R>(reader: R, source: LogSource, tx: mpsc::Sender<ContainerResult<LogLine>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(1024);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if tx.send(Ok(LogLine { source, text })).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(ContainerError::Io(e))).await;
                break;
            }
        }
    }
}
