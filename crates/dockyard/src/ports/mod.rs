//! Host port allocation.
//!
//! Every resource holds a primary and an auxiliary host port from a managed
//! range. The table is in memory and re-seeded from the store at startup.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Host ports bound for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortPair {
    pub primary: u16,
    pub aux: u16,
}

impl PortPair {
    fn ports(&self) -> [u16; 2] {
        [self.primary, self.aux]
    }
}

/// Port allocator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortAllocatorConfig {
    /// First port of the managed range.
    pub range_start: u16,
    /// Last port of the managed range (inclusive).
    pub range_end: u16,
    /// Skip ports something else on the host is already bound to.
    pub probe_host: bool,
}

impl Default for PortAllocatorConfig {
    fn default() -> Self {
        Self {
            range_start: 20000,
            range_end: 29999,
            probe_host: true,
        }
    }
}

#[derive(Debug, Default)]
struct PortTable {
    by_resource: HashMap<String, PortPair>,
    in_use: HashSet<u16>,
}

/// Assigns unique host ports per resource.
#[derive(Debug)]
pub struct PortAllocator {
    config: PortAllocatorConfig,
    table: Mutex<PortTable>,
}

impl PortAllocator {
    pub fn new(config: PortAllocatorConfig) -> Self {
        Self {
            config,
            table: Mutex::new(PortTable::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PortTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate ports for a resource. Returns the existing pair if the
    /// resource already holds one.
    pub fn allocate(&self, resource_id: &str) -> EngineResult<PortPair> {
        let mut table = self.lock();

        if let Some(pair) = table.by_resource.get(resource_id) {
            return Ok(*pair);
        }

        let mut found = Vec::with_capacity(2);
        for port in self.config.range_start..=self.config.range_end {
            if table.in_use.contains(&port) {
                continue;
            }
            if self.config.probe_host && !is_port_available(port) {
                debug!("Port {} is not available (bind check failed)", port);
                continue;
            }
            found.push(port);
            if found.len() == 2 {
                break;
            }
        }

        let [primary, aux] = found[..] else {
            return Err(EngineError::PortExhausted {
                start: self.config.range_start,
                end: self.config.range_end,
            });
        };

        let pair = PortPair { primary, aux };
        table.in_use.extend(pair.ports());
        table.by_resource.insert(resource_id.to_string(), pair);
        debug!("Allocated ports {:?} for {}", pair, resource_id);

        Ok(pair)
    }

    /// Re-claim a known pair. Returns false if another resource holds either
    /// port (the caller must allocate fresh ones).
    pub fn reserve(&self, resource_id: &str, pair: PortPair) -> bool {
        let mut table = self.lock();

        if let Some(current) = table.by_resource.get(resource_id) {
            return *current == pair;
        }
        if pair.primary == pair.aux || pair.ports().iter().any(|p| table.in_use.contains(p)) {
            return false;
        }

        table.in_use.extend(pair.ports());
        table.by_resource.insert(resource_id.to_string(), pair);
        true
    }

    /// Free the ports held by a resource.
    pub fn release(&self, resource_id: &str) -> Option<PortPair> {
        let mut table = self.lock();
        let pair = table.by_resource.remove(resource_id)?;
        for port in pair.ports() {
            table.in_use.remove(&port);
        }
        debug!("Released ports {:?} for {}", pair, resource_id);
        Some(pair)
    }

    /// Ports currently held by a resource.
    pub fn held(&self, resource_id: &str) -> Option<PortPair> {
        self.lock().by_resource.get(resource_id).copied()
    }
}

/// Check if a port is available for binding.
pub fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn allocator(start: u16, end: u16) -> PortAllocator {
        PortAllocator::new(PortAllocatorConfig {
            range_start: start,
            range_end: end,
            probe_host: false,
        })
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let ports = allocator(21000, 21009);
        let first = ports.allocate("a").unwrap();
        assert_eq!(ports.allocate("a").unwrap(), first);
        assert_ne!(first.primary, first.aux);
    }

    #[test]
    fn test_never_double_assigns_and_reuses_after_release() {
        let ports = allocator(21000, 21003);
        let a = ports.allocate("a").unwrap();
        let b = ports.allocate("b").unwrap();

        let mut all: Vec<u16> = a.ports().into_iter().chain(b.ports()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4);

        assert!(matches!(
            ports.allocate("c"),
            Err(EngineError::PortExhausted { start: 21000, end: 21003 })
        ));

        assert_eq!(ports.release("a"), Some(a));
        let c = ports.allocate("c").unwrap();
        assert_eq!(c, a);
        assert!(ports.release("a").is_none());
    }

    #[test]
    fn test_reserve_rejects_ports_held_elsewhere() {
        let ports = allocator(21000, 21009);
        let a = ports.allocate("a").unwrap();

        assert!(!ports.reserve("b", a));
        assert!(ports.reserve("a", a));

        let free = PortPair { primary: 21008, aux: 21009 };
        assert!(ports.reserve("b", free));
        assert_eq!(ports.held("b"), Some(free));
        assert_ne!(ports.allocate("c").unwrap().primary, 21008);
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        let ports = Arc::new(allocator(22000, 22199));
        let handles: Vec<_> = (0..50)
            .map(|i| {
                let ports = Arc::clone(&ports);
                std::thread::spawn(move || ports.allocate(&format!("r{i}")).unwrap())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let pair = handle.join().unwrap();
            assert!(seen.insert(pair.primary));
            assert!(seen.insert(pair.aux));
        }
    }
}
