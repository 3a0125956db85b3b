//! Backend port allocation
//!
//! Ports are verified with a real bind, not just in-memory bookkeeping, so
//! allocation does not race with processes outside this system. A reserved
//! port is released only after the occupying process has confirmed exit.

use crate::config::Route;
use crate::error::Error;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::TcpListener;
use tracing::debug;

/// Hands out unique, bindable local ports to routes
pub struct PortAllocator {
    base_port: u16,
    probe_limit: u32,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(base_port: u16, probe_limit: u32) -> Self {
        Self {
            base_port,
            probe_limit,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate a port for a route.
    ///
    /// A route with a fixed port gets exactly that port or an error. Other
    /// routes scan upward from the base port, skipping reserved ports and
    /// probing real bindability, up to the probe limit.
    pub fn allocate(&self, route: &Route) -> Result<u16, Error> {
        if let Some(port) = route.port {
            let mut reserved = self.reserved.lock();
            if reserved.contains(&port) {
                return Err(Error::configuration(format!(
                    "fixed port {} for route {} is already reserved",
                    port, route.path
                )));
            }
            if !bindable(port) {
                return Err(Error::PortExhaustion {
                    route: route.path.clone(),
                    probes: 1,
                });
            }
            reserved.insert(port);
            debug!(route = %route.path, port, "Reserved fixed port");
            return Ok(port);
        }

        let mut reserved = self.reserved.lock();
        let mut probes = 0u32;
        let mut candidate = self.base_port;

        while probes < self.probe_limit {
            probes += 1;
            if !reserved.contains(&candidate) && bindable(candidate) {
                reserved.insert(candidate);
                debug!(route = %route.path, port = candidate, "Allocated port");
                return Ok(candidate);
            }
            candidate = candidate.checked_add(1).ok_or(Error::PortExhaustion {
                route: route.path.clone(),
                probes,
            })?;
        }

        Err(Error::PortExhaustion {
            route: route.path.clone(),
            probes,
        })
    }

    /// Return a port to the free set.
    ///
    /// Must only be called after the occupying process has confirmed exit,
    /// so a new process cannot race onto a not-yet-released socket.
    pub fn release(&self, port: u16) {
        if self.reserved.lock().remove(&port) {
            debug!(port, "Released port");
        }
    }

    /// Number of currently reserved ports
    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().len()
    }
}

/// Attempt and immediately release a real bind on 127.0.0.1
fn bindable(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_distinct_bindable_ports() {
        let allocator = PortAllocator::new(21700, 200);
        let routes: Vec<Route> = (0..5)
            .map(|i| Route::new(&format!("/r{}", i), "sleep", vec![]))
            .collect();

        let mut ports = HashSet::new();
        for route in &routes {
            let port = allocator.allocate(route).unwrap();
            assert!(ports.insert(port), "port {} allocated twice", port);
            // Still bindable by us: the allocator reserves, it does not hold
            assert!(bindable(port));
        }
        assert_eq!(allocator.reserved_count(), 5);
    }

    #[test]
    fn test_skips_port_held_by_another_process() {
        // Occupy a port outside the allocator's bookkeeping
        let holder = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let held = holder.local_addr().unwrap().port();

        let allocator = PortAllocator::new(held, 50);
        let port = allocator.allocate(&Route::new("/cli", "sleep", vec![])).unwrap();
        assert_ne!(port, held);
        assert!(port > held);
    }

    #[test]
    fn test_fixed_port_respected() {
        let mut route = Route::new("/cli", "sleep", vec![]);
        route.port = Some(21790);

        let allocator = PortAllocator::new(21800, 50);
        assert_eq!(allocator.allocate(&route).unwrap(), 21790);
    }

    #[test]
    fn test_fixed_port_in_use_fails() {
        let holder = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let held = holder.local_addr().unwrap().port();

        let mut route = Route::new("/cli", "sleep", vec![]);
        route.port = Some(held);

        let allocator = PortAllocator::new(21900, 50);
        let err = allocator.allocate(&route).unwrap_err();
        assert!(matches!(err, Error::PortExhaustion { .. }));
    }

    #[test]
    fn test_probe_limit_exhaustion() {
        let allocator = PortAllocator::new(21950, 3);
        for i in 0..3 {
            allocator
                .allocate(&Route::new(&format!("/r{}", i), "sleep", vec![]))
                .unwrap();
        }
        // Fourth allocation exceeds the probe budget: every candidate in
        // range is reserved, so no probe ever succeeds.
        let err = allocator
            .allocate(&Route::new("/r3", "sleep", vec![]))
            .unwrap_err();
        assert!(matches!(err, Error::PortExhaustion { .. }));
    }

    #[test]
    fn test_release_makes_port_reusable() {
        let allocator = PortAllocator::new(22000, 10);
        let route = Route::new("/cli", "sleep", vec![]);

        let port = allocator.allocate(&route).unwrap();
        allocator.release(port);
        assert_eq!(allocator.reserved_count(), 0);

        let again = allocator.allocate(&route).unwrap();
        assert_eq!(again, port);
    }
}
