//! Lifecycle controller.
//!
//! Owns the port allocator, the single-flight table and the monitor registry.
//! Synchronous work (image, network, volume, container) happens inside the
//! request; readiness is left to a detached [`ReadinessMonitor`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::single_flight::SingleFlight;
use crate::container::{
    ContainerConfig, ContainerRuntimeApi, ContainerState, ExecOutput, validate_container_name,
    validate_image_name,
};
use crate::error::{EngineError, EngineResult};
use crate::ports::{PortAllocator, PortPair};
use crate::proxy::{ProxySettings, generate_labels, validate_routing};
use crate::readiness::{
    MonitorRegistry, MonitorSession, ReadinessMonitor, ReadinessPolicy, ReadinessSettings,
};
use crate::resource::{
    RegisterResourceRequest, Resource, ResourceKind, ResourceRepository, ResourceStatus,
    StopPolicy, container_name_for, timestamp,
};

/// Label marking containers and volumes this engine owns.
pub const MANAGED_LABEL: &str = "dockyard.managed";
const RESOURCE_ID_LABEL: &str = "dockyard.resource_id";
const KIND_LABEL: &str = "dockyard.kind";

/// Lifecycle behaviour knobs (the `[lifecycle]` config section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Pull images that are not present locally instead of failing.
    pub pull_missing_images: bool,
    /// Grace period given to containers on stop/restart.
    pub stop_timeout_seconds: u32,
    /// Stop RUNNING resources idle for this long. 0 disables the reaper.
    pub idle_timeout_minutes: u64,
    /// How often the idle reaper runs.
    pub idle_check_interval_seconds: u64,
    /// Stop active resources when the server shuts down.
    pub stop_on_shutdown: bool,
    /// Environment injected into every container.
    pub global_env: BTreeMap<String, String>,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            pull_missing_images: true,
            stop_timeout_seconds: 10,
            idle_timeout_minutes: 0,
            idle_check_interval_seconds: 300,
            stop_on_shutdown: false,
            global_env: BTreeMap::new(),
        }
    }
}

/// Everything the controller needs besides its collaborators.
#[derive(Debug, Clone, Default)]
pub struct LifecycleConfig {
    pub lifecycle: LifecycleSettings,
    pub readiness: ReadinessSettings,
    pub proxy: ProxySettings,
}

/// Outcome of startup reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub ports_restored: usize,
    pub monitors_adopted: usize,
    pub marked_failed: usize,
    pub orphans_removed: usize,
}

/// How `bring_up` got the container running.
enum BringUp {
    /// Created, started or restarted by this operation.
    Started(String),
    /// Already running beforehand; its current run began at `started_at`.
    Reused {
        container_ref: String,
        started_at: Option<DateTime<Utc>>,
    },
}

/// Orchestrates create/start/stop/restart/destroy for resources.
pub struct LifecycleController {
    repo: ResourceRepository,
    runtime: Arc<dyn ContainerRuntimeApi>,
    ports: Arc<PortAllocator>,
    flights: SingleFlight,
    monitors: Arc<MonitorRegistry>,
    monitor: ReadinessMonitor,
    config: LifecycleConfig,
}

impl LifecycleController {
    pub fn new(
        repo: ResourceRepository,
        runtime: Arc<dyn ContainerRuntimeApi>,
        ports: PortAllocator,
        config: LifecycleConfig,
    ) -> Self {
        let ports = Arc::new(ports);
        let monitors = Arc::new(MonitorRegistry::new());
        let monitor = ReadinessMonitor::new(
            Arc::clone(&runtime),
            repo.clone(),
            Arc::clone(&ports),
            Arc::clone(&monitors),
            config.readiness.clone(),
        );

        Self {
            repo,
            runtime,
            ports,
            flights: SingleFlight::new(),
            monitors,
            monitor,
            config,
        }
    }

    pub fn repository(&self) -> &ResourceRepository {
        &self.repo
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntimeApi> {
        &self.runtime
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn monitors(&self) -> &MonitorRegistry {
        &self.monitors
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    fn policy_for(&self, kind: ResourceKind) -> ReadinessPolicy {
        ReadinessPolicy::new(kind.profile().readiness_markers(), &self.config.readiness)
    }

    async fn load(&self, id: &str) -> EngineResult<Resource> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| EngineError::ResourceNotFound(id.to_string()))
    }

    /// The guarded write lost; report what the record is now.
    async fn invalid_state(&self, id: &str, operation: &'static str) -> EngineError {
        match self.load(id).await {
            Ok(resource) => EngineError::InvalidState {
                id: id.to_string(),
                operation,
                status: resource.status,
            },
            Err(e) => e,
        }
    }

    /// ERROR write for a failure outside a monitor session, applied only
    /// while the record is still `from`.
    async fn record_failure(&self, id: &str, from: ResourceStatus, err: &EngineError) {
        match self
            .repo
            .mark_failed(id, &[from], &err.to_string(), false)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!("{} left {} before its failure could be recorded", id, from),
            Err(db_err) => error!("Failed to record failure for {}: {:#}", id, db_err),
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Persist a new STOPPED resource.
    pub async fn register(&self, request: RegisterResourceRequest) -> EngineResult<Resource> {
        let id = request.id.trim();
        if id.is_empty() {
            return Err(EngineError::InvalidRequest("resource id cannot be empty".to_string()));
        }
        validate_container_name(&container_name_for(id))
            .map_err(|e| EngineError::InvalidRequest(format!("resource id '{}': {}", id, e)))?;

        let profile = request.kind.profile();
        let image = request
            .image
            .clone()
            .unwrap_or_else(|| profile.default_image().to_string());
        validate_image_name(&image)?;

        let mut candidate = ContainerConfig::new(&image).envs(request.env.clone());
        if let Some(memory) = &request.memory_limit {
            candidate = candidate.memory_limit(memory);
        }
        candidate.validate()?;

        if let Some(routing) = &request.routing {
            validate_routing(routing, &self.config.proxy)?;
        }

        let _guard = self.flights.begin(id, "register")?;
        if self.repo.get(id).await?.is_some() {
            return Err(EngineError::AlreadyExists(id.to_string()));
        }

        let mut resource = Resource::new(
            id,
            request.kind,
            image,
            &request.env,
            request.routing.as_ref(),
        );
        resource.memory_limit = request
            .memory_limit
            .or_else(|| profile.default_memory().map(String::from));
        resource.cpu_shares = request
            .cpu_shares
            .or_else(|| profile.default_cpu_shares())
            .map(i64::from);

        self.repo.create(&resource).await?;
        info!("Registered {} {}", resource.kind, resource.id);

        Ok(resource)
    }

    /// Create and start the resource's container without changing its status.
    pub async fn create(&self, id: &str) -> EngineResult<String> {
        let _guard = self.flights.begin(id, "create")?;
        let resource = self.load(id).await?;

        if !matches!(resource.status, ResourceStatus::Stopped | ResourceStatus::Error) {
            return Err(EngineError::InvalidState {
                id: id.to_string(),
                operation: "create",
                status: resource.status,
            });
        }

        let (container_ref, _) = self.provision(&resource, resource.status, "create").await?;
        Ok(container_ref)
    }

    /// Move to STARTING, bring the container up and hand over to a monitor.
    pub async fn start(&self, id: &str) -> EngineResult<Resource> {
        let _guard = self.flights.begin(id, "start")?;
        if self.monitors.is_active(id) {
            return Err(EngineError::OperationInProgress {
                id: id.to_string(),
                operation: "start",
            });
        }

        let resource = self.load(id).await?;
        match resource.status {
            ResourceStatus::Running => return Err(EngineError::AlreadyRunning(id.to_string())),
            ResourceStatus::Stopping => {
                return Err(EngineError::InvalidState {
                    id: id.to_string(),
                    operation: "start",
                    status: resource.status,
                });
            }
            // STARTING without a live monitor was left behind by a crash.
            ResourceStatus::Stopped | ResourceStatus::Error | ResourceStatus::Starting => {}
        }

        let policy = self.policy_for(resource.kind);
        let mut session = MonitorSession::new(id, &policy);
        let from = [
            ResourceStatus::Stopped,
            ResourceStatus::Error,
            ResourceStatus::Starting,
        ];
        if !self.repo.begin_start(id, session.id(), &from).await? {
            return Err(self.invalid_state(id, "start").await);
        }
        info!("Starting {} {}", resource.kind, id);

        let container_ref = match self.bring_up(&resource).await {
            Ok(BringUp::Started(container_ref)) => container_ref,
            Ok(BringUp::Reused {
                container_ref,
                started_at,
            }) => {
                session.scan_logs_from(started_at);
                container_ref
            }
            Err(e) => {
                error!("Failed to start {}: {}", id, e);
                self.ports.release(id);
                match self
                    .repo
                    .finish_failed(id, session.id(), &e.to_string(), true)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => warn!("{} changed while starting; start failure not recorded", id),
                    Err(db_err) => {
                        error!("Failed to record start failure for {}: {:#}", id, db_err)
                    }
                }
                return Err(e);
            }
        };

        self.monitor.spawn(Arc::new(session), container_ref, policy);
        self.load(id).await
    }

    /// Stop the container and remove or keep it per the kind's policy.
    pub async fn stop(&self, id: &str) -> EngineResult<Resource> {
        let _guard = self.flights.begin(id, "stop")?;
        let resource = self.load(id).await?;

        if resource.status == ResourceStatus::Stopped {
            return Err(EngineError::AlreadyStopped(id.to_string()));
        }

        if self.monitors.cancel(id) {
            debug!("Cancelled readiness monitor for {}", id);
        }

        let from = [
            ResourceStatus::Starting,
            ResourceStatus::Running,
            ResourceStatus::Error,
            ResourceStatus::Stopping,
        ];
        if !self
            .repo
            .transition(id, &from, ResourceStatus::Stopping)
            .await?
        {
            return Err(self.invalid_state(id, "stop").await);
        }
        info!("Stopping {} {}", resource.kind, id);

        let mut keep = resource.kind.profile().stop_policy() == StopPolicy::Keep;
        if let Some(container_ref) = &resource.container_ref {
            match self
                .runtime
                .stop_container(container_ref, Some(self.config.lifecycle.stop_timeout_seconds))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    warn!("Container {} of {} was already gone", container_ref, id);
                    keep = false;
                }
                Err(e) => {
                    let err = EngineError::from(e);
                    self.record_failure(id, ResourceStatus::Stopping, &err).await;
                    return Err(err);
                }
            }

            if !keep {
                match self.runtime.remove_container(container_ref, true).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    // The next create clears it by name.
                    Err(e) => warn!("Failed to remove container {}: {}", container_ref, e),
                }
            }
        } else {
            keep = false;
        }

        self.ports.release(id);
        if !self.repo.mark_stopped(id, keep).await? {
            return Err(self.invalid_state(id, "stop").await);
        }
        info!(
            "{} stopped ({})",
            id,
            if keep { "container kept" } else { "container removed" }
        );

        self.load(id).await
    }

    /// Restart a RUNNING resource's container in place.
    pub async fn restart(&self, id: &str) -> EngineResult<Resource> {
        let _guard = self.flights.begin(id, "restart")?;
        if self.monitors.is_active(id) {
            return Err(EngineError::OperationInProgress {
                id: id.to_string(),
                operation: "restart",
            });
        }

        let resource = self.load(id).await?;
        if resource.status != ResourceStatus::Running {
            return Err(EngineError::InvalidState {
                id: id.to_string(),
                operation: "restart",
                status: resource.status,
            });
        }
        let Some(container_ref) = resource.container_ref.clone() else {
            return Err(EngineError::ContainerMissing(id.to_string()));
        };

        let policy = self.policy_for(resource.kind);
        let session = Arc::new(MonitorSession::new(id, &policy));
        if !self.repo.begin_restart(id, session.id()).await? {
            return Err(self.invalid_state(id, "restart").await);
        }
        info!("Restarting {} {}", resource.kind, id);

        if let Err(e) = self
            .runtime
            .restart_container(&container_ref, Some(self.config.lifecycle.stop_timeout_seconds))
            .await
        {
            let missing = e.is_not_found();
            let err = if missing {
                EngineError::ContainerMissing(id.to_string())
            } else {
                EngineError::from(e)
            };
            if missing {
                self.ports.release(id);
            }
            if let Err(db_err) = self
                .repo
                .finish_failed(id, session.id(), &err.to_string(), missing)
                .await
            {
                error!("Failed to record restart failure for {}: {:#}", id, db_err);
            }
            return Err(err);
        }

        self.monitor.spawn(session, container_ref, policy);
        self.load(id).await
    }

    /// Tear everything down regardless of state.
    pub async fn destroy(&self, id: &str, purge_volume: bool) -> EngineResult<Resource> {
        let _guard = self.flights.begin(id, "destroy")?;
        self.monitors.cancel(id);
        let resource = self.load(id).await?;

        let any = [
            ResourceStatus::Stopped,
            ResourceStatus::Starting,
            ResourceStatus::Running,
            ResourceStatus::Stopping,
            ResourceStatus::Error,
        ];
        if !self
            .repo
            .transition(id, &any, ResourceStatus::Stopping)
            .await?
        {
            return Err(self.invalid_state(id, "destroy").await);
        }
        info!(
            "Destroying {} {}{}",
            resource.kind,
            id,
            if purge_volume { " (purging volume)" } else { "" }
        );

        let target = resource
            .container_ref
            .as_deref()
            .unwrap_or(&resource.container_name);
        match self.runtime.remove_container(target, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                let err = EngineError::from(e);
                self.record_failure(id, ResourceStatus::Stopping, &err).await;
                return Err(err);
            }
        }

        if purge_volume {
            match self.runtime.remove_volume(&resource.volume_name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    let err = EngineError::from(e);
                    self.record_failure(id, ResourceStatus::Stopping, &err).await;
                    return Err(err);
                }
            }
        }

        self.ports.release(id);
        if !self.repo.mark_destroyed(id).await? {
            return Err(self.invalid_state(id, "destroy").await);
        }

        self.load(id).await
    }

    /// Record an access for the idle reaper.
    pub async fn touch(&self, id: &str) -> EngineResult<()> {
        if !self.repo.touch(id).await? {
            return Err(EngineError::ResourceNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Run a command inside a RUNNING resource's container.
    pub async fn exec(&self, id: &str, command: &[String]) -> EngineResult<ExecOutput> {
        if command.is_empty() {
            return Err(EngineError::InvalidRequest(
                "exec command cannot be empty".to_string(),
            ));
        }

        let resource = self.load(id).await?;
        if resource.status != ResourceStatus::Running {
            return Err(EngineError::InvalidState {
                id: id.to_string(),
                operation: "exec",
                status: resource.status,
            });
        }
        let Some(container_ref) = resource.container_ref else {
            return Err(EngineError::ContainerMissing(id.to_string()));
        };

        debug!("Executing {:?} in {}", command, id);
        match self.runtime.exec_output(&container_ref, command).await {
            Ok(output) => Ok(output),
            Err(e) if e.is_not_found() => Err(EngineError::ContainerMissing(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the persisted record.
    pub async fn get(&self, id: &str) -> EngineResult<Resource> {
        self.load(id).await
    }

    /// All persisted records.
    pub async fn list(&self) -> EngineResult<Vec<Resource>> {
        Ok(self.repo.list().await?)
    }

    // ========================================================================
    // Provisioning
    // ========================================================================

    /// Reuse a kept container when possible, otherwise create a fresh one.
    async fn bring_up(&self, resource: &Resource) -> EngineResult<BringUp> {
        if let (Some(container_ref), Some(ports)) = (&resource.container_ref, resource.ports()) {
            match self.runtime.container_state_status(container_ref).await? {
                Some(state) if self.ports.reserve(&resource.id, ports) => {
                    if state == ContainerState::Running {
                        info!(
                            "Reusing running container {} for {} on ports {}/{}",
                            container_ref, resource.id, ports.primary, ports.aux
                        );
                        return Ok(BringUp::Reused {
                            container_ref: container_ref.clone(),
                            started_at: self.run_started_at(container_ref).await,
                        });
                    }

                    self.runtime.start_container(container_ref).await?;
                    info!(
                        "Started kept container {} for {} on ports {}/{}",
                        container_ref, resource.id, ports.primary, ports.aux
                    );
                    return Ok(BringUp::Started(container_ref.clone()));
                }
                Some(_) => warn!(
                    "Ports {}/{} of {} are taken; recreating its container",
                    ports.primary, ports.aux, resource.id
                ),
                None => info!("Kept container of {} is gone; recreating", resource.id),
            }
        }

        let (container_ref, _) = self
            .provision(resource, ResourceStatus::Starting, "start")
            .await?;
        Ok(BringUp::Started(container_ref))
    }

    /// Start time of the container's current run. `None` when the runtime
    /// cannot say; the monitor then scans the whole log tail.
    async fn run_started_at(&self, container_ref: &str) -> Option<DateTime<Utc>> {
        match self.runtime.container_started_at(container_ref).await {
            Ok(started_at) => started_at,
            Err(e) => {
                warn!("Could not read start time of {}: {}", container_ref, e);
                None
            }
        }
    }

    /// Create and start a container for the resource and record it while
    /// the record is still `expected`.
    async fn provision(
        &self,
        resource: &Resource,
        expected: ResourceStatus,
        operation: &'static str,
    ) -> EngineResult<(String, PortPair)> {
        self.ensure_image(&resource.image).await?;
        self.ensure_network().await?;
        self.ensure_volume(resource).await?;
        self.remove_stale(&resource.container_name).await?;

        let ports = self.ports.allocate(&resource.id)?;
        let config = self.container_config(resource, ports);

        let container_ref = match self.runtime.create_container(&config).await {
            Ok(container_ref) => container_ref,
            Err(e) => {
                self.ports.release(&resource.id);
                return Err(e.into());
            }
        };
        info!(
            "Created container {} for {} on ports {}/{}",
            container_ref, resource.id, ports.primary, ports.aux
        );

        let recorded = self
            .repo
            .set_container(&resource.id, expected, Some(&container_ref), Some(ports))
            .await?;
        if !recorded {
            self.ports.release(&resource.id);
            if let Err(e) = self.runtime.remove_container(&container_ref, true).await {
                warn!("Failed to remove unrecorded container {}: {}", container_ref, e);
            }
            return Err(self.invalid_state(&resource.id, operation).await);
        }

        Ok((container_ref, ports))
    }

    async fn ensure_image(&self, image: &str) -> EngineResult<()> {
        if self.runtime.image_exists(image).await? {
            return Ok(());
        }
        if !self.config.lifecycle.pull_missing_images {
            return Err(EngineError::ImageNotFound(image.to_string()));
        }

        info!("Pulling image {}", image);
        self.runtime.pull_image(image).await?;
        Ok(())
    }

    async fn ensure_network(&self) -> EngineResult<()> {
        let network = &self.config.proxy.network;
        if self.runtime.network_exists(network).await? {
            return Ok(());
        }

        info!("Creating network {}", network);
        if let Err(e) = self.runtime.create_network(network).await {
            // Lost a race with a concurrent create.
            if !self.runtime.network_exists(network).await? {
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn ensure_volume(&self, resource: &Resource) -> EngineResult<()> {
        let name = &resource.volume_name;
        if self.runtime.volume_exists(name).await? {
            return Ok(());
        }

        if let Err(e) = self
            .runtime
            .create_volume(name, &self.ownership_labels(resource))
            .await
            && !self.runtime.volume_exists(name).await?
        {
            return Err(e.into());
        }
        Ok(())
    }

    /// Force-remove any container holding the deterministic name.
    async fn remove_stale(&self, container_name: &str) -> EngineResult<()> {
        if self
            .runtime
            .container_state_status(container_name)
            .await?
            .is_none()
        {
            return Ok(());
        }

        warn!("Removing stale container {}", container_name);
        match self.runtime.remove_container(container_name, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn ownership_labels(&self, resource: &Resource) -> BTreeMap<String, String> {
        BTreeMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (RESOURCE_ID_LABEL.to_string(), resource.id.clone()),
            (KIND_LABEL.to_string(), resource.kind.to_string()),
        ])
    }

    /// Environment for the container. Engine-owned identity and port
    /// variables override anything user supplied.
    fn container_env(&self, resource: &Resource, ports: PortPair) -> BTreeMap<String, String> {
        let profile = resource.kind.profile();
        let mut env: BTreeMap<String, String> = profile
            .default_env()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        env.extend(self.config.lifecycle.global_env.clone());
        env.extend(resource.env());

        let public_url = match resource.routing() {
            Some(routing) => routing.public_url(self.config.proxy.tls),
            None => format!("http://localhost:{}", ports.primary),
        };

        env.insert("DOCKYARD_RESOURCE_ID".to_string(), resource.id.clone());
        env.insert("DOCKYARD_RESOURCE_KIND".to_string(), resource.kind.to_string());
        env.insert("PORT".to_string(), profile.primary_port().to_string());
        env.insert("AUX_PORT".to_string(), profile.aux_port().to_string());
        env.insert("DOCKYARD_HOST_PORT".to_string(), ports.primary.to_string());
        env.insert("PUBLIC_URL".to_string(), public_url);
        env
    }

    fn container_config(&self, resource: &Resource, ports: PortPair) -> ContainerConfig {
        let profile = resource.kind.profile();
        let routing = resource.routing();
        let proxy_labels = generate_labels(
            &resource.id,
            routing.as_ref(),
            profile.primary_port(),
            profile.shares_backend(),
            &self.config.proxy,
        );

        let mut config = ContainerConfig::new(&resource.image)
            .name(&resource.container_name)
            .network(&self.config.proxy.network)
            .port(ports.primary, profile.primary_port())
            .port(ports.aux, profile.aux_port())
            .volume(&resource.volume_name, profile.mount_path())
            .envs(self.container_env(resource, ports))
            .labels(proxy_labels)
            .labels(self.ownership_labels(resource))
            .command(profile.command());

        if let Some(memory) = &resource.memory_limit {
            config = config.memory_limit(memory);
        }
        if let Some(shares) = resource.cpu_shares.and_then(|s| u32::try_from(s).ok()) {
            config = config.cpu_shares(shares);
        }

        config
    }

    // ========================================================================
    // Startup, idle reaping and shutdown
    // ========================================================================

    /// Bring in-memory state back in line with the store and the runtime.
    pub async fn reconcile(&self) -> EngineResult<ReconcileReport> {
        info!("Running startup reconciliation...");
        let mut report = ReconcileReport::default();

        let version = self.runtime.health_check().await?;
        debug!("Container runtime {} reachable: {}", self.runtime.runtime_type(), version.trim());

        let resources = self.repo.list().await?;

        for resource in &resources {
            let Some(ports) = resource.ports() else {
                continue;
            };
            if self.ports.reserve(&resource.id, ports) {
                report.ports_restored += 1;
            } else {
                warn!(
                    "Ports {}/{} of {} conflict with another resource",
                    ports.primary, ports.aux, resource.id
                );
                self.repo.clear_idle_ports(&resource.id).await?;
            }
        }

        for resource in &resources {
            let Ok(_guard) = self.flights.begin(&resource.id, "reconcile") else {
                debug!("{} is busy; skipping reconciliation", resource.id);
                continue;
            };

            match resource.status {
                ResourceStatus::Starting => {
                    if self.adopt_starting(resource).await? {
                        report.monitors_adopted += 1;
                    } else {
                        report.marked_failed += 1;
                    }
                }
                ResourceStatus::Running => {
                    if !self.running_container_exists(resource).await? {
                        let message = EngineError::ContainerMissing(resource.id.clone()).to_string();
                        let from = [ResourceStatus::Running];
                        if self
                            .repo
                            .mark_failed(&resource.id, &from, &message, true)
                            .await?
                        {
                            warn!("{}", message);
                            self.ports.release(&resource.id);
                            report.marked_failed += 1;
                        }
                    }
                }
                ResourceStatus::Stopping => {
                    warn!("{} was interrupted while stopping; stop it again to finish", resource.id);
                }
                ResourceStatus::Stopped | ResourceStatus::Error => {}
            }
        }

        report.orphans_removed = self.remove_orphans(&resources).await?;

        info!(
            "Reconciliation complete: {} port pair(s) restored, {} monitor(s) adopted, {} marked failed, {} orphan(s) removed",
            report.ports_restored,
            report.monitors_adopted,
            report.marked_failed,
            report.orphans_removed
        );
        Ok(report)
    }

    /// Give a STARTING record a fresh monitor session. Returns false when it
    /// had to be marked failed instead.
    async fn adopt_starting(&self, resource: &Resource) -> EngineResult<bool> {
        let container_ref = match &resource.container_ref {
            Some(container_ref) => container_ref.clone(),
            None => {
                let from = [ResourceStatus::Starting];
                let message = "interrupted before its container was created";
                if self
                    .repo
                    .mark_failed(&resource.id, &from, message, true)
                    .await?
                {
                    self.ports.release(&resource.id);
                }
                return Ok(false);
            }
        };

        let policy = self.policy_for(resource.kind);
        let mut session = MonitorSession::new(&resource.id, &policy);
        // The container was started by an earlier process.
        session.scan_logs_from(self.run_started_at(&container_ref).await);
        if !self.repo.adopt_monitor(&resource.id, session.id()).await? {
            return Ok(false);
        }

        info!("Adopting readiness monitoring of {}", resource.id);
        self.monitor.spawn(Arc::new(session), container_ref, policy);
        Ok(true)
    }

    async fn running_container_exists(&self, resource: &Resource) -> EngineResult<bool> {
        let Some(container_ref) = &resource.container_ref else {
            return Ok(false);
        };
        Ok(self
            .runtime
            .container_state_status(container_ref)
            .await?
            .is_some())
    }

    /// Remove managed containers that no record knows about.
    async fn remove_orphans(&self, resources: &[Resource]) -> EngineResult<usize> {
        let known: HashSet<&str> = resources.iter().map(|r| r.id.as_str()).collect();
        let containers = self
            .runtime
            .list_containers(Some(&format!("{}=true", MANAGED_LABEL)))
            .await?;

        let mut removed = 0;
        for container in containers {
            let owned = container
                .label(RESOURCE_ID_LABEL)
                .is_some_and(|id| known.contains(id));
            if owned {
                continue;
            }

            info!("Removing orphan container {} ({:?})", container.id, container.names);
            match self.runtime.remove_container(&container.id, true).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove orphan container {}: {}", container.id, e),
            }
        }

        Ok(removed)
    }

    /// Stop RUNNING resources idle longer than `idle_minutes`.
    pub async fn stop_idle(&self, idle_minutes: u64) -> EngineResult<usize> {
        // Capped at a century so the subtraction cannot overflow.
        let minutes = i64::try_from(idle_minutes.min(52_560_000)).unwrap_or(0);
        let cutoff = timestamp(chrono::Utc::now() - chrono::Duration::minutes(minutes));
        let idle = self.repo.list_idle(&cutoff).await?;
        let mut stopped = 0;

        for resource in idle {
            info!(
                "Stopping idle resource {} (last access: {:?}, idle > {} min)",
                resource.id, resource.last_access_at, idle_minutes
            );
            match self.stop(&resource.id).await {
                Ok(_) => stopped += 1,
                Err(e) => warn!("Failed to stop idle resource {}: {}", resource.id, e),
            }
        }

        if stopped > 0 {
            info!("Stopped {} idle resource(s)", stopped);
        }
        Ok(stopped)
    }

    /// Start the idle reaper. Returns `None` when idle stopping is disabled.
    pub fn spawn_idle_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let settings = &self.config.lifecycle;
        if settings.idle_timeout_minutes == 0 {
            return None;
        }

        let idle_minutes = settings.idle_timeout_minutes;
        let period = Duration::from_secs(settings.idle_check_interval_seconds.max(1));
        info!(
            "Starting idle reaper (check every {}s, timeout {}min)",
            period.as_secs(),
            idle_minutes
        );

        let controller = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                if let Err(e) = controller.stop_idle(idle_minutes).await {
                    warn!("Idle reaper run failed: {}", e);
                }
            }
        }))
    }

    /// Cancel monitors and, when configured, stop active resources.
    pub async fn shutdown(&self) {
        let cancelled = self.monitors.cancel_all();
        if cancelled > 0 {
            info!("Cancelled {} readiness monitor(s)", cancelled);
        }

        if !self.config.lifecycle.stop_on_shutdown {
            return;
        }

        let resources = match self.repo.list().await {
            Ok(resources) => resources,
            Err(e) => {
                error!("Failed to list resources on shutdown: {:#}", e);
                return;
            }
        };
        for resource in resources.iter().filter(|r| r.is_active()) {
            if let Err(e) = self.stop(&resource.id).await {
                warn!("Failed to stop {} on shutdown: {}", resource.id, e);
            }
        }
    }
}
