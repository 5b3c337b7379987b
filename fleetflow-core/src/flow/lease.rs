//! Exclusive, expiring leases on flow ids.
//!
//! Leases are ordinary store records taken with versioned writes, so any
//! process sharing the store honours them. A crashed worker's lease becomes
//! stealable once `expires_at` passes.

use chrono::{DateTime, Utc};
use fleetflow_model::{FlowId, LeaseId};
use serde::{Deserialize, Serialize};

use crate::{
    clock::SharedClock,
    config::LeaseConfig,
    error::{OrchestratorError, Result},
    store::{JsonStore, keys},
};

const TARGET: &str = "fleetflow::lease";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub lease_id: LeaseId,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewals: u32,
    pub released: bool,
}

impl LeaseRecord {
    fn is_free_for(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.released || self.expires_at <= now || self.owner == owner
    }
}

/// Handle proving the holder won the lease.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowLease {
    pub flow_id: FlowId,
    pub lease_id: LeaseId,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl FlowLease {
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.expires_at - now
    }
}

#[derive(Clone, Debug)]
pub struct LeaseManager {
    store: JsonStore,
    clock: SharedClock,
    config: LeaseConfig,
}

impl LeaseManager {
    pub fn new(store: JsonStore, clock: SharedClock, config: LeaseConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> LeaseConfig {
        self.config
    }

    /// Single attempt. `None` means somebody else holds a live lease.
    pub async fn try_acquire(
        &self,
        flow_id: FlowId,
        owner: &str,
    ) -> Result<Option<FlowLease>> {
        let key = keys::flow_lease(flow_id);
        let now = self.clock.now();
        let current = self.store.load::<LeaseRecord>(&key).await?;

        if let Some(existing) = &current
            && !existing.value.is_free_for(owner, now)
        {
            return Ok(None);
        }

        let record = LeaseRecord {
            lease_id: LeaseId::new(),
            owner: owner.to_string(),
            acquired_at: now,
            expires_at: now + self.config.ttl(),
            renewals: 0,
            released: false,
        };
        if let Some(stale) = current.as_ref().map(|v| &v.value)
            && !stale.released
            && stale.owner != owner
        {
            tracing::warn!(
                target: TARGET,
                flow_id = %flow_id,
                previous_owner = %stale.owner,
                expired_at = %stale.expires_at,
                "stealing expired flow lease"
            );
        }

        match self
            .store
            .write(&key, &record, current.map(|v| v.version))
            .await
        {
            Ok(_) => Ok(Some(FlowLease {
                flow_id,
                lease_id: record.lease_id,
                owner: record.owner,
                expires_at: record.expires_at,
            })),
            Err(err) if err.is_version_conflict() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Retries a busy lease per [`LeaseConfig`] before giving up with
    /// [`OrchestratorError::LeaseUnavailable`].
    pub async fn acquire(&self, flow_id: FlowId, owner: &str) -> Result<FlowLease> {
        let attempts = self.config.acquire_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(lease) = self.try_acquire(flow_id, owner).await? {
                return Ok(lease);
            }
            if attempt < attempts {
                tokio::time::sleep(std::time::Duration::from_millis(
                    self.config.acquire_backoff_ms,
                ))
                .await;
            }
        }
        Err(OrchestratorError::LeaseUnavailable(format!(
            "flow {flow_id} is leased by another worker"
        )))
    }

    pub async fn renew(&self, lease: &FlowLease) -> Result<FlowLease> {
        let key = keys::flow_lease(lease.flow_id);
        let now = self.clock.now();
        let current = self.store.load::<LeaseRecord>(&key).await?;
        let Some(current) = current else {
            return Err(lost(lease));
        };
        let mut record = current.value;
        if record.lease_id != lease.lease_id
            || record.released
            || record.expires_at <= now
        {
            return Err(lost(lease));
        }
        record.expires_at = now + self.config.ttl();
        record.renewals += 1;
        match self.store.write(&key, &record, Some(current.version)).await {
            Ok(_) => Ok(FlowLease {
                expires_at: record.expires_at,
                ..lease.clone()
            }),
            Err(err) if err.is_version_conflict() => Err(lost(lease)),
            Err(err) => Err(err),
        }
    }

    /// Renews only once less than half the TTL is left.
    pub async fn keep_alive(&self, lease: FlowLease) -> Result<FlowLease> {
        let half = self.config.ttl() / 2;
        if lease.remaining(self.clock.now()) < half {
            self.renew(&lease).await
        } else {
            Ok(lease)
        }
    }

    pub async fn release(&self, lease: &FlowLease) -> Result<()> {
        let key = keys::flow_lease(lease.flow_id);
        let Some(current) = self.store.load::<LeaseRecord>(&key).await? else {
            return Ok(());
        };
        let mut record = current.value;
        if record.lease_id != lease.lease_id || record.released {
            tracing::debug!(
                target: TARGET,
                flow_id = %lease.flow_id,
                "lease already taken over; nothing to release"
            );
            return Ok(());
        }
        record.released = true;
        match self.store.write(&key, &record, Some(current.version)).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_version_conflict() => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn current(&self, flow_id: FlowId) -> Result<Option<LeaseRecord>> {
        Ok(self
            .store
            .load::<LeaseRecord>(&keys::flow_lease(flow_id))
            .await?
            .map(|v| v.value))
    }
}

fn lost(lease: &FlowLease) -> OrchestratorError {
    OrchestratorError::LeaseUnavailable(format!(
        "lease {} on flow {} is no longer held",
        lease.lease_id, lease.flow_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        config::RetryConfig,
        store::InMemoryObjectStore,
    };
    use std::sync::Arc;

    fn manager(clock: &ManualClock) -> LeaseManager {
        let store = JsonStore::new(
            Arc::new(InMemoryObjectStore::new()),
            RetryConfig::default(),
        );
        LeaseManager::new(
            store,
            Arc::new(clock.clone()),
            LeaseConfig {
                lease_ttl_secs: 10,
                acquire_attempts: 1,
                acquire_backoff_ms: 1,
                housekeeper_interval_ms: 1_000,
            },
        )
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() -> Result<()> {
        let clock = ManualClock::default();
        let leases = manager(&clock);
        let flow = FlowId::new();

        let held = leases.try_acquire(flow, "w0").await?.expect("free");
        assert!(leases.try_acquire(flow, "w1").await?.is_none());
        assert!(leases.acquire(flow, "w1").await.is_err());

        leases.release(&held).await?;
        assert!(leases.try_acquire(flow, "w1").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn expired_lease_can_be_stolen_and_old_holder_loses_it() -> Result<()> {
        let clock = ManualClock::default();
        let leases = manager(&clock);
        let flow = FlowId::new();

        let stale = leases.try_acquire(flow, "crashed").await?.expect("free");
        clock.advance(chrono::Duration::seconds(11));
        let fresh = leases.try_acquire(flow, "w1").await?.expect("expired");
        assert_ne!(fresh.lease_id, stale.lease_id);

        assert!(leases.renew(&stale).await.is_err());
        leases.release(&stale).await?;
        let record = leases.current(flow).await?.expect("record");
        assert!(!record.released);
        assert_eq!(record.owner, "w1");
        Ok(())
    }

    #[tokio::test]
    async fn renew_extends_expiry() -> Result<()> {
        let clock = ManualClock::default();
        let leases = manager(&clock);
        let flow = FlowId::new();

        let lease = leases.try_acquire(flow, "w0").await?.expect("free");
        clock.advance(chrono::Duration::seconds(6));
        let renewed = leases.keep_alive(lease.clone()).await?;
        assert!(renewed.expires_at > lease.expires_at);
        assert_eq!(leases.current(flow).await?.expect("record").renewals, 1);
        Ok(())
    }
}
