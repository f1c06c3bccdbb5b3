//! # Worker Model
//!
//! A worker instance advertising one or more execution capabilities.
//! Ownership of this record belongs to the registry: it is created on
//! registration, refreshed by heartbeat, and removed on deregistration or
//! heartbeat expiry. The dispatcher only ever reads it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Live worker instance as tracked by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,
    /// Base URL the execution call is issued against.
    pub address: String,
    /// Task types this instance can execute.
    pub capabilities: Vec<String>,
    /// Concurrent tasks currently assigned by this core.
    pub load: u32,
    pub healthy: bool,
    pub last_heartbeat: DateTime<Utc>,
}

impl Worker {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Heartbeat freshness check against the registry's ttl.
    pub fn heartbeat_fresh(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.last_heartbeat <= ttl
    }
}

/// Registration payload received from a worker on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    /// Instance id; generated when absent.
    pub worker_id: Option<String>,
    pub address: String,
    pub capabilities: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn worker(last_heartbeat: DateTime<Utc>) -> Worker {
        Worker {
            worker_id: "forwarder-001".to_string(),
            address: "http://127.0.0.1:8001".to_string(),
            capabilities: vec!["text:generation".to_string()],
            load: 0,
            healthy: true,
            last_heartbeat,
        }
    }

    #[test]
    fn capability_match_is_exact() {
        let w = worker(Utc::now());
        assert!(w.supports("text:generation"));
        assert!(!w.supports("image:generation"));
        assert!(!w.supports("text"));
    }

    #[test]
    fn stale_heartbeat_detected() {
        let now = Utc::now();
        let fresh = worker(now - Duration::seconds(5));
        let stale = worker(now - Duration::seconds(120));
        assert!(fresh.heartbeat_fresh(now, Duration::seconds(30)));
        assert!(!stale.heartbeat_fresh(now, Duration::seconds(30)));
    }
}
