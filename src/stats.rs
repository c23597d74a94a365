use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Statistics snapshot for a single service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Service id
    pub service: String,
    /// Total number of sessions
    pub total_sessions: u64,
    /// Currently active sessions
    pub active_sessions: u64,
    /// Total bytes relayed from clients to upstreams
    pub bytes_upstream: u64,
    /// Total bytes relayed from upstreams to clients
    pub bytes_downstream: u64,
    /// Requests or datagrams rejected with an error reply
    pub errors: u64,
    /// Timestamp when this service was registered (Unix timestamp)
    pub start_time: u64,
}

/// Statistics tracker for a single service
#[derive(Debug, Clone)]
pub struct ServiceStatsTracker {
    service: String,
    total_sessions: Arc<AtomicU64>,
    active_sessions: Arc<AtomicU64>,
    bytes_upstream: Arc<AtomicU64>,
    bytes_downstream: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    start_time: u64,
}

impl ServiceStatsTracker {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            total_sessions: Arc::new(AtomicU64::new(0)),
            active_sessions: Arc::new(AtomicU64::new(0)),
            bytes_upstream: Arc::new(AtomicU64::new(0)),
            bytes_downstream: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            start_time: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    /// Start a session; the returned guard ends it when dropped
    pub fn session(&self) -> SessionGuard {
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        SessionGuard {
            tracker: self.clone(),
        }
    }

    pub fn add_bytes_upstream(&self, bytes: u64) {
        self.bytes_upstream.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_downstream(&self, bytes: u64) {
        self.bytes_downstream.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of stats
    pub fn get_stats(&self) -> ServiceStats {
        ServiceStats {
            service: self.service.clone(),
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            bytes_upstream: self.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: self.bytes_downstream.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            start_time: self.start_time,
        }
    }
}

/// Active-session marker
#[derive(Debug)]
pub struct SessionGuard {
    tracker: ServiceStatsTracker,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.tracker.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Global statistics manager
#[derive(Debug, Clone, Default)]
pub struct StatsManager {
    services: Arc<Mutex<HashMap<String, ServiceStatsTracker>>>,
}

impl StatsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, returning the existing tracker if already present
    pub fn register_service(&self, service: &str) -> ServiceStatsTracker {
        self.services
            .lock()
            .entry(service.to_string())
            .or_insert_with(|| ServiceStatsTracker::new(service))
            .clone()
    }

    /// Get stats for all services, ordered by id
    pub fn get_all_stats(&self) -> Vec<ServiceStats> {
        let mut stats: Vec<ServiceStats> = self
            .services
            .lock()
            .values()
            .map(|tracker| tracker.get_stats())
            .collect();
        stats.sort_by(|a, b| a.service.cmp(&b.service));
        stats
    }

    /// Get stats for a specific service
    pub fn get_service_stats(&self, service: &str) -> Option<ServiceStats> {
        self.services
            .lock()
            .get(service)
            .map(|tracker| tracker.get_stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_guard_tracks_active() {
        let manager = StatsManager::new();
        let tracker = manager.register_service("web");

        let first = tracker.session();
        let second = tracker.session();
        assert_eq!(tracker.get_stats().active_sessions, 2);
        drop(first);
        drop(second);

        let stats = manager.get_service_stats("web").unwrap();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.active_sessions, 0);
    }

    #[test]
    fn test_register_is_shared() {
        let manager = StatsManager::new();
        manager.register_service("socks").add_bytes_upstream(10);
        manager.register_service("socks").add_bytes_downstream(5);
        manager.register_service("alpha");

        let all = manager.get_all_stats();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].service, "alpha");
        assert_eq!(all[1].bytes_upstream, 10);
        assert_eq!(all[1].bytes_downstream, 5);
    }
}
