//! Test utilities and common setup.
//!
//! `FakeRuntime` is an in-memory container runtime the tests can script:
//! set log output, make a container vanish, or make inspect fail.
//!
//! Log output is timestamped like a real runtime's: a line counts as written
//! when it was set or when its container last started, whichever is later,
//! and `since` filters on that.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, Utc};
use futures::StreamExt;

use dockyard::api;
use dockyard::container::{
    Container, ContainerConfig, ContainerError, ContainerResult, ContainerRuntimeApi,
    ContainerState, ExecOutput, LogLine, LogLineStream, LogSource, RuntimeType,
};
use dockyard::db::Database;
use dockyard::lifecycle::{LifecycleConfig, LifecycleController};
use dockyard::ports::{PortAllocator, PortAllocatorConfig};
use dockyard::readiness::ReadinessSettings;
use dockyard::resource::{
    RegisterResourceRequest, Resource, ResourceKind, ResourceRepository, ResourceStatus,
};
use dockyard::stream::StreamSettings;

/// Log output that satisfies both workspace readiness markers.
pub const WORKSPACE_READY_LOGS: &str = "booting\nserver listening on :8080\ncontrol channel ready\n";

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub config: ContainerConfig,
    /// Start of the current run.
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct FakeState {
    containers: Vec<FakeContainer>,
    volumes: BTreeSet<String>,
    networks: BTreeSet<String>,
    images: BTreeSet<String>,
    unpullable: BTreeSet<String>,
    /// Log output keyed by container name, with when it was written.
    logs: HashMap<String, (String, DateTime<Utc>)>,
    /// Exec results keyed by container name.
    exec_outputs: HashMap<String, ExecOutput>,
    next_id: u64,
    fail_inspect: bool,
    fail_create: bool,
}

impl FakeState {
    fn find(&self, reference: &str) -> Option<&FakeContainer> {
        self.containers
            .iter()
            .find(|c| c.id == reference || c.name == reference)
    }

    fn find_mut(&mut self, reference: &str) -> Option<&mut FakeContainer> {
        self.containers
            .iter_mut()
            .find(|c| c.id == reference || c.name == reference)
    }
}

/// Scriptable in-memory runtime.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    pub create_calls: AtomicUsize,
    pub pull_calls: AtomicUsize,
    pub restart_calls: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Output returned for the container with this name, now and after
    /// it is (re)created.
    pub fn set_logs(&self, container_name: &str, logs: &str) {
        self.state()
            .logs
            .insert(container_name.to_string(), (logs.to_string(), Utc::now()));
    }

    /// Result of any exec in the container with this name. Without one the
    /// command line is echoed back.
    pub fn set_exec_output(&self, container_name: &str, output: ExecOutput) {
        self.state()
            .exec_outputs
            .insert(container_name.to_string(), output);
    }

    /// Delete a container behind the engine's back.
    pub fn remove_externally(&self, reference: &str) {
        self.state()
            .containers
            .retain(|c| c.id != reference && c.name != reference);
    }

    pub fn set_fail_inspect(&self, fail: bool) {
        self.state().fail_inspect = fail;
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state().fail_create = fail;
    }

    pub fn mark_unpullable(&self, image: &str) {
        self.state().unpullable.insert(image.to_string());
    }

    /// Add a container the engine did not create.
    pub fn add_foreign_container(&self, name: &str, labels: BTreeMap<String, String>) -> String {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("f{:011x}", state.next_id);
        let config = ContainerConfig::new("busybox:latest").name(name).labels(labels);
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: name.to_string(),
            state: ContainerState::Running,
            config,
            started_at: Utc::now(),
        });
        id
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.state().containers.clone()
    }

    pub fn container(&self, reference: &str) -> Option<FakeContainer> {
        self.state().find(reference).cloned()
    }

    pub fn volumes(&self) -> Vec<String> {
        self.state().volumes.iter().cloned().collect()
    }

    pub fn networks(&self) -> Vec<String> {
        self.state().networks.iter().cloned().collect()
    }

    pub fn create_count(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }
}

fn not_found(reference: &str) -> ContainerError {
    ContainerError::ContainerNotFound(reference.to_string())
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::Podman
    }

    async fn health_check(&self) -> ContainerResult<String> {
        Ok("fake 1.0".to_string())
    }

    async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        Ok(self.state().images.contains(image))
    }

    async fn pull_image(&self, image: &str) -> ContainerResult<()> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if state.unpullable.contains(image) {
            return Err(ContainerError::ImageNotFound(image.to_string()));
        }
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        // Give concurrent callers a chance to interleave.
        tokio::task::yield_now().await;
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state();
        if state.fail_create {
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: "scripted failure".to_string(),
            });
        }

        let name = config.name.clone().unwrap_or_default();
        if state.find(&name).is_some() {
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: format!("the container name \"{}\" is already in use", name),
            });
        }

        state.next_id += 1;
        let id = format!("c{:011x}", state.next_id);
        state.containers.push(FakeContainer {
            id: id.clone(),
            name,
            state: ContainerState::Running,
            config: config.clone(),
            started_at: Utc::now(),
        });
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        let mut state = self.state();
        let container = state.find_mut(container_id).ok_or_else(|| not_found(container_id))?;
        container.state = ContainerState::Running;
        container.started_at = Utc::now();
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        let mut state = self.state();
        let container = state.find_mut(container_id).ok_or_else(|| not_found(container_id))?;
        container.state = ContainerState::Exited;
        Ok(())
    }

    async fn restart_container(
        &self,
        container_id: &str,
        _timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        self.restart_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        let container = state.find_mut(container_id).ok_or_else(|| not_found(container_id))?;
        container.state = ContainerState::Running;
        container.started_at = Utc::now();
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> ContainerResult<()> {
        let mut state = self.state();
        let before = state.containers.len();
        state
            .containers
            .retain(|c| c.id != container_id && c.name != container_id);
        if state.containers.len() == before {
            return Err(not_found(container_id));
        }
        Ok(())
    }

    async fn container_state_status(
        &self,
        id_or_name: &str,
    ) -> ContainerResult<Option<ContainerState>> {
        let state = self.state();
        if state.fail_inspect {
            return Err(ContainerError::RuntimeUnreachable("scripted outage".to_string()));
        }
        Ok(state.find(id_or_name).map(|c| c.state))
    }

    async fn list_containers(&self, label_filter: Option<&str>) -> ContainerResult<Vec<Container>> {
        let filter = label_filter.and_then(|f| f.split_once('='));
        let state = self.state();
        Ok(state
            .containers
            .iter()
            .filter(|c| match filter {
                Some((key, value)) => c.config.labels.get(key).map(String::as_str) == Some(value),
                None => true,
            })
            .map(|c| Container {
                id: c.id.clone(),
                names: vec![c.name.clone()],
                image: c.config.image.clone(),
                state: c.state,
                labels: c.config.labels.clone(),
            })
            .collect())
    }

    async fn container_started_at(
        &self,
        id_or_name: &str,
    ) -> ContainerResult<Option<DateTime<Utc>>> {
        let state = self.state();
        if state.fail_inspect {
            return Err(ContainerError::RuntimeUnreachable("scripted outage".to_string()));
        }
        Ok(state.find(id_or_name).map(|c| c.started_at))
    }

    async fn get_logs(
        &self,
        container_id: &str,
        _tail: Option<u32>,
        since: Option<&str>,
    ) -> ContainerResult<String> {
        let state = self.state();
        let container = state.find(container_id).ok_or_else(|| not_found(container_id))?;
        let Some((logs, written_at)) = state.logs.get(&container.name) else {
            return Ok(String::new());
        };

        let since = since
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| ContainerError::InvalidInput(format!("bad since {raw}: {e}")))
            })
            .transpose()?;
        let stamped = (*written_at).max(container.started_at);
        if since.is_some_and(|since| stamped < since) {
            return Ok(String::new());
        }
        Ok(logs.clone())
    }

    async fn exec_output(
        &self,
        container_id: &str,
        command: &[String],
    ) -> ContainerResult<ExecOutput> {
        let state = self.state();
        let container = state.find(container_id).ok_or_else(|| not_found(container_id))?;
        if container.state != ContainerState::Running {
            return Err(ContainerError::CommandFailed {
                command: "exec".to_string(),
                message: format!("container {} is not running", container.name),
            });
        }
        Ok(state
            .exec_outputs
            .get(&container.name)
            .cloned()
            .unwrap_or_else(|| ExecOutput {
                exit_code: 0,
                stdout: format!("{}\n", command.join(" ")),
                stderr: String::new(),
            }))
    }

    async fn follow_logs(&self, container_id: &str, _tail: u32) -> ContainerResult<LogLineStream> {
        let logs = self.get_logs(container_id, None, None).await?;
        let lines: Vec<ContainerResult<LogLine>> = logs
            .lines()
            .map(|line| {
                Ok(LogLine {
                    source: LogSource::Stdout,
                    text: line.to_string(),
                })
            })
            .collect();
        Ok(futures::stream::iter(lines).boxed())
    }

    async fn volume_exists(&self, name: &str) -> ContainerResult<bool> {
        Ok(self.state().volumes.contains(name))
    }

    async fn create_volume(
        &self,
        name: &str,
        _labels: &BTreeMap<String, String>,
    ) -> ContainerResult<()> {
        self.state().volumes.insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> ContainerResult<()> {
        if !self.state().volumes.remove(name) {
            return Err(ContainerError::ContainerNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn network_exists(&self, name: &str) -> ContainerResult<bool> {
        Ok(self.state().networks.contains(name))
    }

    async fn create_network(&self, name: &str) -> ContainerResult<()> {
        self.state().networks.insert(name.to_string());
        Ok(())
    }
}

/// Readiness timing short enough for tests.
pub fn fast_readiness() -> ReadinessSettings {
    ReadinessSettings {
        log_interval_ms: 5,
        status_interval_ms: 10,
        base_budget: 200,
        extended_budget: 400,
        degraded_readiness_after_checks: 150,
        log_tail: 50,
    }
}

pub fn test_config(readiness: ReadinessSettings) -> LifecycleConfig {
    let mut config = LifecycleConfig::default();
    config.readiness = readiness;
    config
}

pub async fn test_controller_with(
    runtime: Arc<FakeRuntime>,
    config: LifecycleConfig,
) -> (Arc<LifecycleController>, Database) {
    let db = Database::in_memory().await.unwrap();
    let ports = PortAllocator::new(PortAllocatorConfig {
        range_start: 41000,
        range_end: 41099,
        probe_host: false,
    });
    let controller = LifecycleController::new(
        ResourceRepository::new(db.pool().clone()),
        runtime,
        ports,
        config,
    );
    (Arc::new(controller), db)
}

/// Controller over a fresh in-memory database and the given fake runtime.
pub async fn test_controller(runtime: Arc<FakeRuntime>) -> Arc<LifecycleController> {
    test_controller_with(runtime, test_config(fast_readiness()))
        .await
        .0
}

pub fn workspace_request(id: &str) -> RegisterResourceRequest {
    request(id, ResourceKind::Workspace)
}

pub fn request(id: &str, kind: ResourceKind) -> RegisterResourceRequest {
    RegisterResourceRequest {
        id: id.to_string(),
        kind,
        image: None,
        env: BTreeMap::new(),
        routing: None,
        memory_limit: None,
        cpu_shares: None,
    }
}

/// Poll the record until it reaches `status` or the deadline passes.
pub async fn wait_for_status(
    controller: &LifecycleController,
    id: &str,
    status: ResourceStatus,
) -> Resource {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let resource = controller.get(id).await.unwrap();
        if resource.status == status {
            return resource;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "{} never reached {} (last status {}, error {:?})",
                id, status, resource.status, resource.error_message
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Router over a controller backed by the fake runtime.
pub async fn test_app(runtime: Arc<FakeRuntime>) -> (Router, Arc<LifecycleController>) {
    let stream = StreamSettings {
        poll_interval_ms: 10,
        caller_timeout_ms: 5_000,
        log_tail: 10,
    };
    test_app_with(runtime, stream).await
}

/// Router with explicit progress stream settings.
pub async fn test_app_with(
    runtime: Arc<FakeRuntime>,
    stream: StreamSettings,
) -> (Router, Arc<LifecycleController>) {
    let controller = test_controller(runtime).await;
    let state = api::AppState::new(Arc::clone(&controller), stream);
    (api::create_router(state), controller)
}

/// The monitor deregisters just after its terminal write; wait for that.
pub async fn wait_for_monitor_exit(controller: &LifecycleController, id: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while controller.monitors().is_active(id) {
        if tokio::time::Instant::now() >= deadline {
            panic!("monitor for {} never finished", id);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
