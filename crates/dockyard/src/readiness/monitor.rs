//! Detached readiness monitor.
//!
//! Two loops share one [`MonitorSession`]: the log scan loop sets phase flags
//! from the container's recent output, the status poll loop inspects the
//! container, counts checks and decides. The first verdict wins the session's
//! latch, stops both loops and writes the record once.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};

use super::MonitorRegistry;
use super::policy::{ReadinessPolicy, ReadinessSettings};
use super::session::{MonitorSession, SessionSnapshot};
use crate::container::{ContainerRuntimeApi, ContainerState};
use crate::error::EngineError;
use crate::ports::PortAllocator;
use crate::resource::ResourceRepository;

/// What one status poll saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Running,
    /// The container exists but is not running (created, exited, paused).
    NotRunning,
    /// The runtime reports no such container.
    Missing,
    /// Inspect failed; the runtime may be briefly unavailable.
    Unknown,
}

/// Outcome of one status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pending,
    Ready { degraded: bool },
    Missing,
    TimedOut,
}

/// Decide a status check. Pure so the ordering of the rules is testable.
pub fn evaluate(observation: Observation, snapshot: &SessionSnapshot, degraded_after: u32) -> Verdict {
    let flags = snapshot.flags;

    if observation == Observation::Missing {
        return Verdict::Missing;
    }

    if observation == Observation::Running && flags.primary_service_ready {
        if flags.control_channel_ready {
            return Verdict::Ready { degraded: false };
        }
        if snapshot.checks_performed > degraded_after {
            return Verdict::Ready { degraded: true };
        }
    }

    if snapshot.checks_performed >= snapshot.timeout_budget {
        return Verdict::TimedOut;
    }

    Verdict::Pending
}

/// Spawns and concludes monitor sessions.
#[derive(Clone)]
pub struct ReadinessMonitor {
    runtime: Arc<dyn ContainerRuntimeApi>,
    repo: ResourceRepository,
    ports: Arc<PortAllocator>,
    registry: Arc<MonitorRegistry>,
    settings: ReadinessSettings,
}

impl ReadinessMonitor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        repo: ResourceRepository,
        ports: Arc<PortAllocator>,
        registry: Arc<MonitorRegistry>,
        settings: ReadinessSettings,
    ) -> Self {
        Self {
            runtime,
            repo,
            ports,
            registry,
            settings,
        }
    }

    /// Register the session and start both loops. Returns immediately.
    pub fn spawn(&self, session: Arc<MonitorSession>, container_ref: String, policy: ReadinessPolicy) {
        self.registry.insert(Arc::clone(&session));
        info!(
            "Monitoring readiness of {} (session {}, budget {} checks)",
            session.resource_id(),
            session.id(),
            session.snapshot().timeout_budget
        );

        let monitor = self.clone();
        let log_session = Arc::clone(&session);
        let log_ref = container_ref.clone();
        let log_policy = policy.clone();
        tokio::spawn(async move {
            monitor.log_loop(log_session, log_ref, log_policy).await;
        });

        let monitor = self.clone();
        tokio::spawn(async move {
            monitor.status_loop(session, container_ref, policy).await;
        });
    }

    async fn log_loop(&self, session: Arc<MonitorSession>, container_ref: String, policy: ReadinessPolicy) {
        let mut ticker = interval(Duration::from_millis(self.settings.log_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = session.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let logs = self
                .runtime
                .get_logs(
                    &container_ref,
                    Some(self.settings.log_tail),
                    session.logs_since(),
                )
                .await;
            if session.is_terminal() {
                break;
            }

            match logs {
                Ok(logs) => {
                    if session.apply_signals(&policy.scan(&logs)) {
                        info!(
                            "Dependency installation detected for {}; readiness budget extended to {} checks",
                            session.resource_id(),
                            policy.extended_budget
                        );
                    }
                }
                Err(e) => debug!("Log scan for {} failed: {}", session.resource_id(), e),
            }
        }
    }

    async fn status_loop(&self, session: Arc<MonitorSession>, container_ref: String, policy: ReadinessPolicy) {
        let period = Duration::from_millis(self.settings.status_interval_ms.max(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = session.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let observation = match self.runtime.container_state_status(&container_ref).await {
                Ok(Some(ContainerState::Running)) => Observation::Running,
                Ok(Some(_)) => Observation::NotRunning,
                Ok(None) => Observation::Missing,
                Err(e) => {
                    warn!("Status check for {} failed: {}", session.resource_id(), e);
                    Observation::Unknown
                }
            };
            if session.is_terminal() {
                break;
            }

            let snapshot = session.record_check();
            let verdict = evaluate(observation, &snapshot, policy.degraded_after);
            if verdict != Verdict::Pending {
                self.conclude(&session, verdict, &snapshot).await;
                break;
            }
        }
    }

    /// Write the terminal state for a verdict, at most once per session.
    async fn conclude(&self, session: &MonitorSession, verdict: Verdict, snapshot: &SessionSnapshot) {
        if !session.try_finish() {
            return;
        }
        session.stop_loops();

        let id = session.resource_id();
        let result = match verdict {
            Verdict::Ready { degraded } => {
                let applied = self.repo.finish_ready(id, session.id(), degraded).await;
                if matches!(applied, Ok(true)) {
                    if degraded {
                        warn!(
                            "{} marked running after {} checks without its control channel",
                            id, snapshot.checks_performed
                        );
                    } else {
                        info!("{} is ready after {} checks", id, snapshot.checks_performed);
                    }
                }
                applied
            }
            Verdict::Missing => {
                let message = EngineError::ContainerMissing(id.to_string()).to_string();
                let applied = self.repo.finish_failed(id, session.id(), &message, true).await;
                if matches!(applied, Ok(true)) {
                    self.ports.release(id);
                    error!("{}", message);
                }
                applied
            }
            Verdict::TimedOut => {
                let message = EngineError::ReadinessTimeout {
                    id: id.to_string(),
                    checks: snapshot.checks_performed,
                }
                .to_string();
                let applied = self.repo.finish_failed(id, session.id(), &message, false).await;
                if matches!(applied, Ok(true)) {
                    error!("{}; container left running for diagnosis", message);
                }
                applied
            }
            Verdict::Pending => Ok(false),
        };

        match result {
            Ok(true) => {}
            Ok(false) => debug!("Session {} for {} was superseded", session.id(), id),
            Err(e) => error!("Failed to record readiness outcome for {}: {:#}", id, e),
        }

        self.registry.finish(id, session.id());
    }
}
