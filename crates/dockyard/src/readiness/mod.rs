//! Readiness monitoring.
//!
//! A resource is "running" once its logs show the service (and, for kinds
//! that have one, the control channel) is up, not merely once the container
//! process exists. Each Start or Restart gets a [`MonitorSession`] watched by
//! two detached loops; see [`ReadinessMonitor`].

mod monitor;
mod policy;
mod session;

pub use monitor::{Observation, ReadinessMonitor, Verdict, evaluate};
pub use policy::{LogSignals, ReadinessMarkers, ReadinessPolicy, ReadinessSettings};
pub use session::{MonitorSession, PhaseFlags, SessionSnapshot};

use std::sync::Arc;

use dashmap::DashMap;

/// Active monitor sessions, one per resource at most.
#[derive(Debug, Default)]
pub struct MonitorRegistry {
    sessions: DashMap<String, Arc<MonitorSession>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live session watches the resource.
    pub fn is_active(&self, resource_id: &str) -> bool {
        self.sessions
            .get(resource_id)
            .is_some_and(|s| !s.is_terminal())
    }

    /// Register a session, cancelling any session it replaces.
    pub fn insert(&self, session: Arc<MonitorSession>) {
        let previous = self
            .sessions
            .insert(session.resource_id().to_string(), session);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Cancel the resource's session, if any. Returns whether one was active.
    pub fn cancel(&self, resource_id: &str) -> bool {
        match self.sessions.remove(resource_id) {
            Some((_, session)) => {
                let was_active = !session.is_terminal();
                session.cancel();
                was_active
            }
            None => false,
        }
    }

    /// Drop a concluded session, unless it was already replaced.
    pub fn finish(&self, resource_id: &str, session_id: &str) {
        self.sessions
            .remove_if(resource_id, |_, s| s.id() == session_id);
    }

    /// Cancel every session (shutdown).
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
