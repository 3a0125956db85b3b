//! Per-route session tracking and concurrency caps
//!
//! Terminal backends typically serve one client at a time, so every route
//! carries a session limit (default 1). A session covers one HTTP request or
//! one WebSocket connection; the guard returned by `try_acquire` decrements
//! the counter on drop no matter how the session ends.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Tracks active proxy sessions per route and enforces concurrency caps
pub struct SessionMultiplexer {
    routes: DashMap<String, RouteSessions>,
}

struct RouteSessions {
    active: Arc<AtomicU32>,
    limit: u32,
}

impl SessionMultiplexer {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }

    /// Register a route with its concurrency limit. Called once per route at
    /// startup; the route set is fixed afterwards.
    pub fn register(&self, route: &str, limit: u32) {
        self.routes.insert(
            route.to_string(),
            RouteSessions {
                active: Arc::new(AtomicU32::new(0)),
                limit,
            },
        );
    }

    /// Try to open a session for a route.
    ///
    /// Returns None when the route is unknown or already at its limit; the
    /// caller rejects the request without contacting the backend.
    pub fn try_acquire(&self, route: &str) -> Option<SessionGuard> {
        let entry = self.routes.get(route)?;
        let active = Arc::clone(&entry.active);
        let limit = entry.limit;
        drop(entry);

        let mut current = active.load(Ordering::SeqCst);
        loop {
            if current >= limit {
                debug!(route, active = current, limit, "Session limit reached");
                return None;
            }
            match active.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(SessionGuard {
                        route: route.to_string(),
                        active,
                        started: Instant::now(),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Number of active sessions for a route
    pub fn active(&self, route: &str) -> u32 {
        self.routes
            .get(route)
            .map(|e| e.active.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Configured limit for a route
    pub fn limit(&self, route: &str) -> Option<u32> {
        self.routes.get(route).map(|e| e.limit)
    }
}

impl Default for SessionMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle for one proxy session; decrements the route counter on drop
pub struct SessionGuard {
    route: String,
    active: Arc<AtomicU32>,
    started: Instant,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        debug!(
            route = %self.route,
            duration_ms = self.started.elapsed().as_millis() as u64,
            "Session ended"
        );
    }
}
