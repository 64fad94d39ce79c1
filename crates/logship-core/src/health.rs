//! Health check system for monitoring component status.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Instant;

/// Health status of a component.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentStatus {
    /// Component is healthy
    Healthy,
    /// Component is degraded but operational
    Degraded(String),
    /// Component is unhealthy
    Unhealthy(String),
    /// Component status is unknown
    Unknown,
}

/// Overall system health status.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    /// All components healthy
    Healthy,
    /// Some components degraded
    Degraded,
    /// System is unhealthy
    Unhealthy,
}

/// Health check manager for tracking component health.
///
/// The supervisor registers "store", "broker" and "sources" and flips their
/// status as fatal signals and reconnects happen.
pub struct HealthCheck {
    components: RwLock<HashMap<String, ComponentStatus>>,
    started_at: Instant,
}

impl HealthCheck {
    /// Create a new health check manager.
    pub fn new() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            started_at: Instant::now(),
        }
    }

    /// Register a component to track.
    pub fn register_component(&self, name: &str) {
        let mut components = self.components.write();
        components.insert(name.to_string(), ComponentStatus::Unknown);
    }

    /// Mark a component as healthy.
    pub fn mark_healthy(&self, name: &str) {
        let mut components = self.components.write();
        components.insert(name.to_string(), ComponentStatus::Healthy);
    }

    /// Mark a component as degraded.
    pub fn mark_degraded(&self, name: &str, reason: &str) {
        let mut components = self.components.write();
        components.insert(
            name.to_string(),
            ComponentStatus::Degraded(reason.to_string()),
        );
    }

    /// Mark a component as unhealthy.
    pub fn mark_unhealthy(&self, name: &str, reason: &str) {
        let mut components = self.components.write();
        components.insert(
            name.to_string(),
            ComponentStatus::Unhealthy(reason.to_string()),
        );
    }

    /// Get the status of a specific component.
    pub fn get_component_status(&self, name: &str) -> Option<ComponentStatus> {
        let components = self.components.read();
        components.get(name).cloned()
    }

    /// Get all component statuses.
    pub fn get_all_statuses(&self) -> HashMap<String, ComponentStatus> {
        self.components.read().clone()
    }

    /// Get overall system health status.
    pub fn overall_status(&self) -> HealthStatus {
        let components = self.components.read();

        let mut has_degraded = false;
        for status in components.values() {
            match status {
                ComponentStatus::Unhealthy(_) => return HealthStatus::Unhealthy,
                ComponentStatus::Degraded(_) => has_degraded = true,
                _ => {}
            }
        }

        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Check if the system is operational (healthy or degraded).
    pub fn is_operational(&self) -> bool {
        matches!(
            self.overall_status(),
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    /// Seconds since this process started tracking health.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_status_transitions() {
        let health = HealthCheck::new();
        health.register_component("store");
        health.register_component("broker");
        assert_eq!(health.overall_status(), HealthStatus::Healthy);

        health.mark_healthy("store");
        health.mark_healthy("broker");
        assert_eq!(health.overall_status(), HealthStatus::Healthy);

        health.mark_degraded("broker", "reconnecting");
        assert_eq!(health.overall_status(), HealthStatus::Degraded);
        assert!(health.is_operational());

        health.mark_unhealthy("store", "disk failure");
        assert_eq!(health.overall_status(), HealthStatus::Unhealthy);
        assert!(!health.is_operational());
    }

    #[test]
    fn test_component_lookup() {
        let health = HealthCheck::new();
        health.register_component("sources");
        assert_eq!(
            health.get_component_status("sources"),
            Some(ComponentStatus::Unknown)
        );
        assert_eq!(health.get_component_status("nope"), None);

        health.mark_degraded("sources", "one listener down");
        match health.get_component_status("sources") {
            Some(ComponentStatus::Degraded(reason)) => {
                assert_eq!(reason, "one listener down")
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }
}
