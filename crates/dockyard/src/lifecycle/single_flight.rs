//! Per-resource single-flight guard.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::{EngineError, EngineResult};

/// At most one lifecycle operation per resource id at a time.
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    inflight: Arc<DashMap<String, &'static str>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for `operation`. Fails with the operation already running.
    pub fn begin(&self, id: &str, operation: &'static str) -> EngineResult<FlightGuard> {
        match self.inflight.entry(id.to_string()) {
            Entry::Occupied(entry) => Err(EngineError::OperationInProgress {
                id: id.to_string(),
                operation: *entry.get(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(operation);
                Ok(FlightGuard {
                    inflight: Arc::clone(&self.inflight),
                    id: id.to_string(),
                })
            }
        }
    }
}

/// Releases the claim when dropped.
#[derive(Debug)]
pub struct FlightGuard {
    inflight: Arc<DashMap<String, &'static str>>,
    id: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inflight.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_is_rejected_until_release() {
        let flights = SingleFlight::new();
        let guard = flights.begin("ws1", "start").unwrap();

        match flights.begin("ws1", "stop") {
            Err(EngineError::OperationInProgress { id, operation }) => {
                assert_eq!(id, "ws1");
                assert_eq!(operation, "start");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(flights.begin("ws2", "stop").is_ok());

        drop(guard);
        assert!(flights.begin("ws1", "stop").is_ok());
    }
}
