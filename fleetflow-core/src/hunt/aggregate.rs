//! Folds terminal flow transitions into hunt counters.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetflow_model::{
    ClientId, ClientSelectionRule, FlowId, FlowRecord, FlowStatus, HuntId,
    HuntRecord, HuntStatus, SpawnState,
};

use crate::{
    clock::SharedClock,
    config::HuntConfig,
    error::Result,
    events::{EventEnvelope, EventMeta, EventPublisher, OrchestratorEvent},
    flow::FlowObserver,
    store::{JsonStore, Update, keys},
};

pub(crate) const TARGET: &str = "fleetflow::hunt";

/// Status change decided while mutating a hunt record.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct StatusChange {
    pub status: HuntStatus,
    pub reason: Option<String>,
}

/// Moves drained hunts to COMPLETED: stopped hunts with nothing running, and
/// started hunts whose finite selection is fully handled.
pub(crate) fn settle(hunt: &mut HuntRecord, now: DateTime<Utc>) -> Option<StatusChange> {
    if hunt.counters.running > 0 {
        return None;
    }
    let reason = match (&hunt.status, &hunt.selection) {
        (HuntStatus::Stopped, _) => hunt.status_reason.clone(),
        (HuntStatus::Started, ClientSelectionRule::Explicit { clients })
            if clients.iter().all(|client| hunt.has_handled(client)) =>
        {
            Some("all clients processed".to_string())
        }
        _ => return None,
    };
    hunt.status = HuntStatus::Completed;
    hunt.status_reason = reason.clone();
    hunt.updated_at = now;
    Some(StatusChange {
        status: HuntStatus::Completed,
        reason,
    })
}

pub(crate) async fn publish_change(
    events: &Arc<dyn EventPublisher>,
    now: DateTime<Utc>,
    hunt_id: HuntId,
    change: StatusChange,
) {
    let envelope = EventEnvelope {
        meta: EventMeta::new(now),
        event: OrchestratorEvent::HuntStatusChanged {
            hunt_id,
            status: change.status,
            reason: change.reason,
        },
    };
    if let Err(err) = events.publish(envelope).await {
        tracing::warn!(target: TARGET, hunt_id = %hunt_id, error = %err, "event publish failed");
    }
}

/// Registered as a [`FlowObserver`] so every hunt-owned flow reports its
/// terminal status exactly once per client entry.
#[derive(Debug)]
pub struct HuntAggregator {
    store: JsonStore,
    events: Arc<dyn EventPublisher>,
    clock: SharedClock,
    config: HuntConfig,
}

impl HuntAggregator {
    pub fn new(
        store: JsonStore,
        events: Arc<dyn EventPublisher>,
        clock: SharedClock,
        config: HuntConfig,
    ) -> Self {
        Self {
            store,
            events,
            clock,
            config,
        }
    }

    /// Applies a terminal flow status to the hunt. Returns `false` when the
    /// entry was already settled or does not belong to `flow_id`.
    pub async fn record_outcome(
        &self,
        hunt_id: HuntId,
        client_id: &ClientId,
        flow_id: FlowId,
        status: FlowStatus,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Ok(false);
        }
        let now = self.clock.now();
        let min_finished = self.config.min_finished_for_error_rate;
        let (applied, change) = self
            .store
            .update(&keys::hunt(hunt_id), |current: Option<HuntRecord>| {
                let Some(mut hunt) = current else {
                    return Ok(Update::Skip((false, None)));
                };
                let Some(entry) = hunt.spawned.get_mut(client_id) else {
                    return Ok(Update::Skip((false, None)));
                };
                if entry.flow_id != flow_id || entry.state != SpawnState::Running {
                    return Ok(Update::Skip((false, None)));
                }

                entry.finished_at = Some(now);
                let counters = &mut hunt.counters;
                counters.running = counters.running.saturating_sub(1);
                if status == FlowStatus::Error {
                    entry.state = SpawnState::Errored;
                    counters.errored += 1;
                } else {
                    entry.state = SpawnState::Completed;
                    counters.completed += 1;
                }
                hunt.updated_at = now;

                let mut change = None;
                let fraction = hunt.counters.error_fraction();
                if hunt.status == HuntStatus::Started
                    && hunt.counters.finished() >= min_finished
                    && fraction > hunt.max_error_fraction
                {
                    let reason = format!(
                        "error rate {:.2} exceeded limit {:.2} after {} flows",
                        fraction,
                        hunt.max_error_fraction,
                        hunt.counters.finished()
                    );
                    hunt.status = HuntStatus::Paused;
                    hunt.status_reason = Some(reason.clone());
                    change = Some(StatusChange {
                        status: HuntStatus::Paused,
                        reason: Some(reason),
                    });
                }
                if let Some(settled) = settle(&mut hunt, now) {
                    change = Some(settled);
                }
                Ok(Update::Write(hunt, (true, change)))
            })
            .await?;

        if applied {
            tracing::debug!(
                target: TARGET,
                hunt_id = %hunt_id,
                client_id = %client_id,
                flow_id = %flow_id,
                status = %status,
                "hunt flow finished"
            );
        }
        if let Some(change) = change {
            if change.status == HuntStatus::Paused {
                tracing::warn!(
                    target: TARGET,
                    hunt_id = %hunt_id,
                    reason = change.reason.as_deref().unwrap_or_default(),
                    "hunt auto-paused"
                );
            } else {
                tracing::info!(
                    target: TARGET,
                    hunt_id = %hunt_id,
                    status = %change.status,
                    "hunt status changed"
                );
            }
            publish_change(&self.events, now, hunt_id, change).await;
        }
        Ok(applied)
    }
}

#[async_trait]
impl FlowObserver for HuntAggregator {
    async fn flow_finished(&self, record: &FlowRecord) -> Result<()> {
        if let Some(hunt_id) = record.hunt_id() {
            self.record_outcome(hunt_id, &record.client_id, record.id, record.status)
                .await?;
        }
        Ok(())
    }
}
