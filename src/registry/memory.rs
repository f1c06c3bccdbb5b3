//! In-process worker registry.
//!
//! Registry state is ephemeral by design (rebuilt from registrations and
//! heartbeats after a restart), so a concurrent map is the production
//! implementation rather than a test stand-in.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::models::{Worker, WorkerRegistration};
use crate::registry::WorkerRegistry;

pub struct InMemoryWorkerRegistry {
    workers: DashMap<String, Worker>,
    heartbeat_ttl: Duration,
}

impl InMemoryWorkerRegistry {
    pub fn new(heartbeat_ttl: Duration) -> Self {
        Self {
            workers: DashMap::new(),
            heartbeat_ttl,
        }
    }

    /// Drop workers whose heartbeat has lapsed. Lookup already filters
    /// stale entries; this reclaims the memory.
    pub fn evict_stale(&self) -> usize {
        let now = Utc::now();
        let before = self.workers.len();
        self.workers
            .retain(|_, worker| worker.heartbeat_fresh(now, self.heartbeat_ttl));
        before - self.workers.len()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryWorkerRegistry {
    async fn register(&self, registration: WorkerRegistration) -> Result<String> {
        if registration.address.is_empty() {
            return Err(DispatchError::validation(
                "worker address must not be empty",
            ));
        }
        if registration.capabilities.is_empty() {
            return Err(DispatchError::validation(
                "worker must advertise at least one capability",
            ));
        }

        let worker_id = registration
            .worker_id
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4().simple()));
        let worker = Worker {
            worker_id: worker_id.clone(),
            address: registration.address,
            capabilities: registration.capabilities,
            load: 0,
            healthy: true,
            last_heartbeat: Utc::now(),
        };
        info!(
            worker_id = %worker.worker_id,
            address = %worker.address,
            capabilities = ?worker.capabilities,
            "✅ worker registered"
        );
        self.workers.insert(worker_id.clone(), worker);
        Ok(worker_id)
    }

    async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        let mut entry = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| DispatchError::worker_not_found(worker_id))?;
        entry.last_heartbeat = Utc::now();
        entry.healthy = true;
        Ok(())
    }

    async fn deregister(&self, worker_id: &str) -> Result<()> {
        match self.workers.remove(worker_id) {
            Some(_) => {
                info!(worker_id, "worker deregistered");
                Ok(())
            }
            None => Err(DispatchError::worker_not_found(worker_id)),
        }
    }

    async fn lookup(&self, capability: &str) -> Result<Vec<Worker>> {
        let now = Utc::now();
        let mut candidates: Vec<Worker> = self
            .workers
            .iter()
            .filter(|entry| {
                entry.healthy
                    && entry.heartbeat_fresh(now, self.heartbeat_ttl)
                    && entry.supports(capability)
            })
            .map(|entry| entry.clone())
            .collect();
        candidates.sort_by(|a, b| {
            a.load
                .cmp(&b.load)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });
        debug!(
            capability,
            candidates = candidates.len(),
            "🔍 registry lookup"
        );
        Ok(candidates)
    }

    async fn note_dispatch(&self, worker_id: &str) -> Result<()> {
        let mut entry = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| DispatchError::worker_not_found(worker_id))?;
        entry.load += 1;
        Ok(())
    }

    async fn note_completion(&self, worker_id: &str) -> Result<()> {
        // The worker may already be gone (deregistered or expired); load
        // accounting for a vanished worker is a no-op, not an error.
        if let Some(mut entry) = self.workers.get_mut(worker_id) {
            entry.load = entry.load.saturating_sub(1);
        }
        Ok(())
    }
}
