//! Monitor session state.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;

use super::policy::{LogSignals, ReadinessPolicy};

/// Boot phases observed so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseFlags {
    pub primary_service_ready: bool,
    pub control_channel_ready: bool,
    pub dependency_install_detected: bool,
}

/// Point-in-time view of a session, taken after a status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub flags: PhaseFlags,
    pub checks_performed: u32,
    pub timeout_budget: u32,
}

#[derive(Debug)]
struct SessionState {
    flags: PhaseFlags,
    checks_performed: u32,
    timeout_budget: u32,
}

/// One readiness wait for one Start or Restart.
///
/// The terminal latch is set exactly once, by whichever of "a verdict was
/// reached" and "the session was cancelled" happens first.
#[derive(Debug)]
pub struct MonitorSession {
    id: String,
    resource_id: String,
    /// Output before this instant belongs to an earlier run. `None` scans
    /// the whole tail.
    logs_since: Option<String>,
    extended_budget: u32,
    state: Mutex<SessionState>,
    terminal: AtomicBool,
    cancel: CancellationToken,
}

impl MonitorSession {
    pub fn new(resource_id: impl Into<String>, policy: &ReadinessPolicy) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            resource_id: resource_id.into(),
            logs_since: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            extended_budget: policy.extended_budget,
            state: Mutex::new(SessionState {
                flags: PhaseFlags {
                    control_channel_ready: !policy.has_control_channel(),
                    ..PhaseFlags::default()
                },
                checks_performed: 0,
                timeout_budget: policy.base_budget,
            }),
            terminal: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Lower bound for log scans, so a restarted container's old output is
    /// not mistaken for the new run's.
    ///
    /// Defaults to the session's creation, which precedes any container the
    /// operation itself creates, starts or restarts.
    pub fn logs_since(&self) -> Option<&str> {
        self.logs_since.as_deref()
    }

    /// Scan from the start of a run that began before this session: a
    /// container that was already running when it was reused or adopted.
    /// `None` (start time unknown) scans the whole tail.
    pub fn scan_logs_from(&mut self, started_at: Option<DateTime<Utc>>) {
        self.logs_since = started_at.map(|at| at.to_rfc3339_opts(SecondsFormat::Nanos, true));
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fold one log scan into the flags. Returns true when this scan
    /// escalated the budget.
    ///
    /// Flags only ever go from false to true; an install-finished marker does
    /// not shrink the budget back.
    pub fn apply_signals(&self, signals: &LogSignals) -> bool {
        let mut state = self.state();
        state.flags.primary_service_ready |= signals.primary_ready;
        state.flags.control_channel_ready |= signals.control_ready;

        if signals.install_started && !state.flags.dependency_install_detected {
            state.flags.dependency_install_detected = true;
            state.timeout_budget = state.timeout_budget.max(self.extended_budget);
            return true;
        }
        false
    }

    /// Count one status check.
    pub fn record_check(&self) -> SessionSnapshot {
        let mut state = self.state();
        state.checks_performed = state.checks_performed.saturating_add(1);
        SessionSnapshot {
            flags: state.flags,
            checks_performed: state.checks_performed,
            timeout_budget: state.timeout_budget,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state();
        SessionSnapshot {
            flags: state.flags,
            checks_performed: state.checks_performed,
            timeout_budget: state.timeout_budget,
        }
    }

    /// Claim the right to write the terminal state. Only the first caller
    /// wins; a cancelled session can no longer be claimed.
    pub fn try_finish(&self) -> bool {
        self.terminal
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Stop both loops without writing anything.
    pub fn cancel(&self) {
        self.terminal.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    /// Wake the loops after a verdict was claimed.
    pub(crate) fn stop_loops(&self) {
        self.cancel.cancel();
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    /// Resolves once the session is cancelled or concluded.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
