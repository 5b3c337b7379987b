//! Fleet-wide fan-out of one flow type over a client selection.
//!
//! A hunt never owns flow state. It owns a per-client slot table on its own
//! record; slots are reserved with a versioned write before the flow is
//! launched and released again if the launch is rejected, so the running
//! counter can only over-count transiently and never exceeds the cap.

pub mod aggregate;
pub mod selection;

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use fleetflow_model::{
    ClientId, ClientSelectionRule, FlowId, FlowPriority, FlowRunnerArgs,
    HuntCounters, HuntId, HuntRateLimit, HuntRecord, HuntSkip, HuntStatus,
    OutputPluginDescriptor, SpawnState, SpawnedFlow,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    clock::SharedClock,
    config::{HuntConfig, OrchestratorConfig},
    error::{OrchestratorError, Result},
    events::{EventEnvelope, EventMeta, EventPublisher, OrchestratorEvent},
    flow::FlowEngine,
    store::{JsonStore, Update, keys},
};

use aggregate::{HuntAggregator, StatusChange, TARGET, publish_change, settle};
use selection::ClientDirectory;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateHuntRequest {
    pub flow_name: String,
    #[serde(default)]
    pub args: Value,
    pub selection: ClientSelectionRule,
    /// Falls back to the configured default when absent.
    #[serde(default)]
    pub rate_limit: Option<HuntRateLimit>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(default)]
    pub output_plugins: Vec<OutputPluginDescriptor>,
    #[serde(default)]
    pub priority: FlowPriority,
    /// Stop spawning after this many clients.
    #[serde(default)]
    pub client_limit: Option<u64>,
    #[serde(default)]
    pub expires_in_secs: Option<i64>,
    #[serde(default)]
    pub max_error_fraction: Option<f64>,
}

impl CreateHuntRequest {
    pub fn new(flow_name: impl Into<String>, selection: ClientSelectionRule) -> Self {
        Self {
            flow_name: flow_name.into(),
            args: Value::Null,
            selection,
            rate_limit: None,
            description: String::new(),
            creator: None,
            output_plugins: Vec::new(),
            priority: FlowPriority::default(),
            client_limit: None,
            expires_in_secs: None,
            max_error_fraction: None,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: HuntRateLimit) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TickReport {
    pub hunt_id: HuntId,
    pub status: HuntStatus,
    pub reconciled: usize,
    pub spawned: usize,
    pub skipped: usize,
}

#[derive(Debug)]
enum Reservation {
    Reserved(FlowId),
    Handled,
    Full,
    Closed,
}

pub struct HuntEngine {
    store: JsonStore,
    flows: Arc<FlowEngine>,
    directory: Arc<dyn ClientDirectory>,
    aggregator: Arc<HuntAggregator>,
    events: Arc<dyn EventPublisher>,
    clock: SharedClock,
    config: HuntConfig,
    /// How long a reserved slot may point at a flow that does not exist yet.
    launch_grace: chrono::Duration,
}

impl fmt::Debug for HuntEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HuntEngine")
            .field("directory", &self.directory)
            .field("config", &self.config)
            .finish()
    }
}

impl HuntEngine {
    /// Builds the engine and registers its aggregator with `flows`.
    pub fn new(
        config: &OrchestratorConfig,
        flows: Arc<FlowEngine>,
        directory: Arc<dyn ClientDirectory>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        let store = flows.store().clone();
        let clock = Arc::clone(flows.clock());
        let aggregator = Arc::new(HuntAggregator::new(
            store.clone(),
            Arc::clone(&events),
            Arc::clone(&clock),
            config.hunts.clone(),
        ));
        flows.register_observer(aggregator.clone());
        Self {
            store,
            flows,
            directory,
            aggregator,
            events,
            clock,
            config: config.hunts.clone(),
            launch_grace: chrono::Duration::seconds(config.lease.lease_ttl_secs.max(1)),
        }
    }

    pub fn aggregator(&self) -> &Arc<HuntAggregator> {
        &self.aggregator
    }

    pub async fn create_hunt(&self, request: CreateHuntRequest) -> Result<HuntId> {
        let flow_type = self.flows.registry().resolve(&request.flow_name)?;
        let args = flow_type.schema().validate(&request.args).map_err(|reason| {
            OrchestratorError::InvalidArgument(format!(
                "{}: {reason}",
                request.flow_name
            ))
        })?;
        self.flows
            .outputs()
            .registry()
            .validate(&request.output_plugins)?;

        let rate_limit = request
            .rate_limit
            .unwrap_or_else(|| self.config.default_rate_limit.clone());
        validate_rate_limit(&rate_limit)?;
        let max_error_fraction = request
            .max_error_fraction
            .unwrap_or(self.config.default_max_error_fraction);
        if !(max_error_fraction > 0.0 && max_error_fraction <= 1.0) {
            return Err(OrchestratorError::InvalidArgument(format!(
                "max_error_fraction must be in (0, 1], got {max_error_fraction}"
            )));
        }
        if request.expires_in_secs.is_some_and(|secs| secs <= 0) {
            return Err(OrchestratorError::InvalidArgument(
                "expires_in_secs must be positive".into(),
            ));
        }
        if request.client_limit == Some(0) {
            return Err(OrchestratorError::InvalidArgument(
                "client_limit must be positive".into(),
            ));
        }

        let now = self.clock.now();
        let record = HuntRecord {
            id: HuntId::new(),
            flow_name: flow_type.name().to_string(),
            args,
            selection: request.selection,
            rate_limit,
            description: request.description,
            creator: request.creator,
            output_plugins: request.output_plugins,
            priority: request.priority,
            client_limit: request.client_limit,
            expires_at: request
                .expires_in_secs
                .map(|secs| now + chrono::Duration::seconds(secs)),
            max_error_fraction,
            status: HuntStatus::Started,
            status_reason: None,
            spawned: Default::default(),
            skipped: Default::default(),
            counters: HuntCounters::default(),
            window_started_at: now,
            launched_in_window: 0,
            created_at: now,
            updated_at: now,
        };
        if self.store.create(&keys::hunt(record.id), &record).await?.is_none() {
            return Err(OrchestratorError::Internal(format!(
                "hunt {} already exists",
                record.id
            )));
        }

        tracing::info!(
            target: TARGET,
            hunt_id = %record.id,
            flow = %record.flow_name,
            "hunt created"
        );
        self.emit(OrchestratorEvent::HuntCreated {
            hunt_id: record.id,
            flow_name: record.flow_name.clone(),
        })
        .await;
        Ok(record.id)
    }

    pub async fn get(&self, hunt_id: HuntId) -> Result<HuntRecord> {
        self.store
            .load::<HuntRecord>(&keys::hunt(hunt_id))
            .await?
            .map(|loaded| loaded.value)
            .ok_or_else(|| OrchestratorError::NotFound(format!("hunt {hunt_id}")))
    }

    pub async fn list(&self) -> Result<Vec<HuntRecord>> {
        let mut hunts = Vec::new();
        for child in self.store.list_children(keys::HUNTS).await? {
            let Ok(hunt_id) = child.parse::<HuntId>() else {
                continue;
            };
            if let Some(loaded) =
                self.store.load::<HuntRecord>(&keys::hunt(hunt_id)).await?
            {
                hunts.push(loaded.value);
            }
        }
        hunts.sort_by_key(|hunt| hunt.created_at);
        Ok(hunts)
    }

    /// Stops expansion; running flows continue and still count.
    pub async fn pause(&self, hunt_id: HuntId) -> Result<HuntRecord> {
        self.set_status(hunt_id, HuntStatus::Paused, None).await
    }

    pub async fn resume(&self, hunt_id: HuntId) -> Result<HuntRecord> {
        self.set_status(hunt_id, HuntStatus::Started, None).await
    }

    /// Stops expansion for good. The hunt completes once its running flows
    /// drain; in-flight flows are not cancelled.
    pub async fn stop(&self, hunt_id: HuntId) -> Result<HuntRecord> {
        self.set_status(hunt_id, HuntStatus::Stopped, Some("stopped by caller".into()))
            .await
    }

    async fn set_status(
        &self,
        hunt_id: HuntId,
        target: HuntStatus,
        reason: Option<String>,
    ) -> Result<HuntRecord> {
        let now = self.clock.now();
        let (record, change) = self
            .store
            .update(&keys::hunt(hunt_id), |current: Option<HuntRecord>| {
                let Some(mut hunt) = current else {
                    return Err(OrchestratorError::NotFound(format!("hunt {hunt_id}")));
                };
                let next = hunt.status.transition_to(target)?;
                if next == hunt.status {
                    return Ok(Update::Skip((hunt, None)));
                }
                hunt.status = next;
                hunt.status_reason = reason.clone();
                hunt.updated_at = now;
                if next == HuntStatus::Started {
                    hunt.window_started_at = now;
                    hunt.launched_in_window = 0;
                }
                let change = settle(&mut hunt, now).or(Some(StatusChange {
                    status: next,
                    reason: reason.clone(),
                }));
                Ok(Update::Write(hunt.clone(), (hunt, change)))
            })
            .await?;

        if let Some(change) = change {
            tracing::info!(
                target: TARGET,
                hunt_id = %hunt_id,
                status = %change.status,
                "hunt status changed"
            );
            publish_change(&self.events, now, hunt_id, change).await;
        }
        Ok(record)
    }

    /// Every hunt that can still make progress gets one tick. Failures are
    /// logged per hunt and do not stop the others.
    pub async fn tick_all(&self) -> Result<Vec<TickReport>> {
        let mut reports = Vec::new();
        for hunt in self.list().await? {
            if hunt.status == HuntStatus::Completed {
                continue;
            }
            match self.tick(hunt.id).await {
                Ok(report) => reports.push(report),
                Err(err) => tracing::warn!(
                    target: TARGET,
                    hunt_id = %hunt.id,
                    error = %err,
                    "hunt tick failed"
                ),
            }
        }
        Ok(reports)
    }

    /// One expansion pass: reconcile finished flows, apply expiry and the
    /// rate window, then launch flows for unhandled clients until a cap is
    /// hit or the selection runs dry.
    pub async fn tick(&self, hunt_id: HuntId) -> Result<TickReport> {
        let reconciled = self.reconcile(hunt_id).await?;
        let hunt = self.refresh(hunt_id).await?;
        let mut report = TickReport {
            hunt_id,
            status: hunt.status,
            reconciled,
            spawned: 0,
            skipped: 0,
        };
        if !hunt.status.is_expanding() {
            return Ok(report);
        }

        let mut known = hunt;
        let mut candidates = self.directory.enumerate(&known.selection);
        while let Some(candidate) = candidates.next().await {
            let client = candidate?;
            if known.has_handled(&client) {
                continue;
            }
            match self.reserve(hunt_id, &client).await? {
                Reservation::Reserved(flow_id) => {
                    if self.launch(&known, &client, flow_id).await? {
                        report.spawned += 1;
                    } else {
                        report.skipped += 1;
                    }
                }
                Reservation::Handled => continue,
                Reservation::Full | Reservation::Closed => break,
            }
            known = self.get(hunt_id).await?;
        }

        let hunt = self.finish_if_drained(hunt_id).await?;
        report.status = hunt.status;
        if report.spawned > 0 || report.skipped > 0 {
            tracing::debug!(
                target: TARGET,
                hunt_id = %hunt_id,
                spawned = report.spawned,
                skipped = report.skipped,
                running = hunt.counters.running,
                "hunt expanded"
            );
        }
        Ok(report)
    }

    /// Re-reads every flow the hunt still believes is running and applies
    /// terminal statuses the aggregator missed. A slot whose flow never
    /// appeared within the launch grace period is released as a skip.
    async fn reconcile(&self, hunt_id: HuntId) -> Result<usize> {
        let hunt = self.get(hunt_id).await?;
        let running: Vec<(ClientId, FlowId, DateTime<Utc>)> = hunt
            .running_flows()
            .map(|(client, spawned)| (client.clone(), spawned.flow_id, spawned.spawned_at))
            .collect();
        let now = self.clock.now();
        let mut applied = 0;
        for (client, flow_id, spawned_at) in running {
            let record = match self.flows.load(flow_id).await {
                Ok(record) => record,
                Err(OrchestratorError::NotFound(_)) => {
                    if now - spawned_at >= self.launch_grace {
                        self.abandon_launch(hunt_id, &client, flow_id).await?;
                        applied += 1;
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };
            if record.status.is_terminal()
                && self
                    .aggregator
                    .record_outcome(hunt_id, &client, flow_id, record.status)
                    .await?
            {
                applied += 1;
            }
        }
        if applied > 0 {
            tracing::info!(
                target: TARGET,
                hunt_id = %hunt_id,
                applied,
                "reconciled finished hunt flows"
            );
        }
        Ok(applied)
    }

    /// Applies expiry, settles drained hunts and rolls the rate window.
    async fn refresh(&self, hunt_id: HuntId) -> Result<HuntRecord> {
        let now = self.clock.now();
        let (record, change) = self
            .store
            .update(&keys::hunt(hunt_id), |current: Option<HuntRecord>| {
                let Some(mut hunt) = current else {
                    return Err(OrchestratorError::NotFound(format!("hunt {hunt_id}")));
                };
                let mut dirty = false;
                let mut change = None;

                let expired = hunt.expires_at.is_some_and(|at| at <= now);
                if expired
                    && matches!(hunt.status, HuntStatus::Started | HuntStatus::Paused)
                {
                    hunt.status = HuntStatus::Stopped;
                    hunt.status_reason = Some("expired".into());
                    hunt.updated_at = now;
                    change = Some(StatusChange {
                        status: HuntStatus::Stopped,
                        reason: hunt.status_reason.clone(),
                    });
                    dirty = true;
                }
                if let Some(settled) = settle(&mut hunt, now) {
                    change = Some(settled);
                    dirty = true;
                }
                if roll_window(&mut hunt, now) {
                    dirty = true;
                }

                if dirty {
                    Ok(Update::Write(hunt.clone(), (hunt, change)))
                } else {
                    Ok(Update::Skip((hunt, None)))
                }
            })
            .await?;
        if let Some(change) = change {
            tracing::info!(
                target: TARGET,
                hunt_id = %hunt_id,
                status = %change.status,
                reason = change.reason.as_deref().unwrap_or_default(),
                "hunt status changed"
            );
            publish_change(&self.events, now, hunt_id, change).await;
        }
        Ok(record)
    }

    async fn finish_if_drained(&self, hunt_id: HuntId) -> Result<HuntRecord> {
        let now = self.clock.now();
        let (record, change) = self
            .store
            .update(&keys::hunt(hunt_id), |current: Option<HuntRecord>| {
                let Some(mut hunt) = current else {
                    return Err(OrchestratorError::NotFound(format!("hunt {hunt_id}")));
                };
                match settle(&mut hunt, now) {
                    Some(change) => {
                        Ok(Update::Write(hunt.clone(), (hunt, Some(change))))
                    }
                    None => Ok(Update::Skip((hunt, None))),
                }
            })
            .await?;
        if let Some(change) = change {
            tracing::info!(
                target: TARGET,
                hunt_id = %hunt_id,
                status = %change.status,
                "hunt status changed"
            );
            publish_change(&self.events, now, hunt_id, change).await;
        }
        Ok(record)
    }

    async fn reserve(&self, hunt_id: HuntId, client: &ClientId) -> Result<Reservation> {
        let now = self.clock.now();
        self.store
            .update(&keys::hunt(hunt_id), |current: Option<HuntRecord>| {
                let Some(mut hunt) = current else {
                    return Err(OrchestratorError::NotFound(format!("hunt {hunt_id}")));
                };
                if !hunt.status.is_expanding() {
                    return Ok(Update::Skip(Reservation::Closed));
                }
                if hunt.has_handled(client) {
                    return Ok(Update::Skip(Reservation::Handled));
                }
                if hunt.client_limit_reached() || at_capacity(&hunt) {
                    return Ok(Update::Skip(Reservation::Full));
                }

                let flow_id = FlowId::new();
                hunt.spawned.insert(
                    client.clone(),
                    SpawnedFlow {
                        flow_id,
                        state: SpawnState::Running,
                        spawned_at: now,
                        finished_at: None,
                    },
                );
                hunt.counters.running += 1;
                hunt.launched_in_window += 1;
                hunt.updated_at = now;
                Ok(Update::Write(hunt, Reservation::Reserved(flow_id)))
            })
            .await
    }

    /// Returns `false` when the client was skipped instead.
    async fn launch(
        &self,
        hunt: &HuntRecord,
        client: &ClientId,
        flow_id: FlowId,
    ) -> Result<bool> {
        let runner_args = FlowRunnerArgs {
            priority: hunt.priority,
            output_plugins: hunt.output_plugins.clone(),
            hunt_id: Some(hunt.id),
            creator: hunt.creator.clone(),
            request_ttl_secs: None,
        };
        let launched = self
            .flows
            .start_with_id(
                flow_id,
                client.clone(),
                &hunt.flow_name,
                hunt.args.clone(),
                runner_args,
            )
            .await;

        match launched {
            Ok(_) => {
                tracing::debug!(
                    target: TARGET,
                    hunt_id = %hunt.id,
                    client_id = %client,
                    flow_id = %flow_id,
                    "hunt flow spawned"
                );
                self.emit(OrchestratorEvent::HuntFlowSpawned {
                    hunt_id: hunt.id,
                    client_id: client.clone(),
                    flow_id,
                })
                .await;
                Ok(true)
            }
            Err(err) => {
                // The record may exist if the failure came after creation;
                // reconciliation owns it from here.
                if self.flows.load(flow_id).await.is_ok() {
                    tracing::warn!(
                        target: TARGET,
                        hunt_id = %hunt.id,
                        flow_id = %flow_id,
                        error = %err,
                        "hunt flow launch reported an error after creation"
                    );
                    return Ok(true);
                }
                let reason = err.to_string();
                self.release_slot(hunt.id, client, flow_id, &reason).await?;
                tracing::info!(
                    target: TARGET,
                    hunt_id = %hunt.id,
                    client_id = %client,
                    reason = %reason,
                    "hunt client skipped"
                );
                self.emit(OrchestratorEvent::HuntClientSkipped {
                    hunt_id: hunt.id,
                    client_id: client.clone(),
                    reason,
                })
                .await;
                Ok(false)
            }
        }
    }

    async fn abandon_launch(
        &self,
        hunt_id: HuntId,
        client: &ClientId,
        flow_id: FlowId,
    ) -> Result<()> {
        let reason = "launch never completed";
        self.release_slot(hunt_id, client, flow_id, reason).await?;
        tracing::warn!(
            target: TARGET,
            hunt_id = %hunt_id,
            client_id = %client,
            flow_id = %flow_id,
            "released slot of a launch that never completed"
        );
        self.emit(OrchestratorEvent::HuntClientSkipped {
            hunt_id,
            client_id: client.clone(),
            reason: reason.to_string(),
        })
        .await;
        Ok(())
    }

    async fn release_slot(
        &self,
        hunt_id: HuntId,
        client: &ClientId,
        flow_id: FlowId,
        reason: &str,
    ) -> Result<()> {
        let now = self.clock.now();
        self.store
            .update(&keys::hunt(hunt_id), |current: Option<HuntRecord>| {
                let Some(mut hunt) = current else {
                    return Ok(Update::Skip(()));
                };
                let ours = hunt
                    .spawned
                    .get(client)
                    .is_some_and(|spawned| spawned.flow_id == flow_id);
                if !ours {
                    return Ok(Update::Skip(()));
                }
                if hunt
                    .spawned
                    .remove(client)
                    .is_some_and(|spawned| spawned.state == SpawnState::Running)
                {
                    hunt.counters.running = hunt.counters.running.saturating_sub(1);
                }
                hunt.launched_in_window = hunt.launched_in_window.saturating_sub(1);
                hunt.counters.skipped += 1;
                hunt.skipped.insert(
                    client.clone(),
                    HuntSkip {
                        reason: reason.to_string(),
                        at: now,
                    },
                );
                hunt.updated_at = now;
                Ok(Update::Write(hunt, ()))
            })
            .await
    }

    async fn emit(&self, event: OrchestratorEvent) {
        let envelope = EventEnvelope {
            meta: EventMeta::new(self.clock.now()),
            event,
        };
        if let Err(err) = self.events.publish(envelope).await {
            tracing::warn!(target: TARGET, error = %err, "event publish failed");
        }
    }
}

fn validate_rate_limit(limit: &HuntRateLimit) -> Result<()> {
    if limit.max_new_per_interval.is_some() && limit.interval_secs <= 0 {
        return Err(OrchestratorError::InvalidArgument(
            "rate limit interval must be positive".into(),
        ));
    }
    if limit.max_concurrent == Some(0) || limit.max_new_per_interval == Some(0) {
        return Err(OrchestratorError::InvalidArgument(
            "rate limits must be positive when set".into(),
        ));
    }
    Ok(())
}

fn at_capacity(hunt: &HuntRecord) -> bool {
    let limit = &hunt.rate_limit;
    limit
        .max_concurrent
        .is_some_and(|max| hunt.counters.running >= u64::from(max))
        || limit
            .max_new_per_interval
            .is_some_and(|max| hunt.launched_in_window >= u64::from(max))
}

/// Starts a new rate window once the current one has elapsed.
fn roll_window(hunt: &mut HuntRecord, now: DateTime<Utc>) -> bool {
    if hunt.rate_limit.max_new_per_interval.is_none() {
        return false;
    }
    let interval = chrono::Duration::seconds(hunt.rate_limit.interval_secs);
    if now - hunt.window_started_at < interval {
        return false;
    }
    hunt.window_started_at = now;
    hunt.launched_in_window = 0;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(rate_limit: HuntRateLimit) -> HuntRecord {
        let now = Utc::now();
        HuntRecord {
            id: HuntId::new(),
            flow_name: "Echo".into(),
            args: Value::Null,
            selection: ClientSelectionRule::All,
            rate_limit,
            description: String::new(),
            creator: None,
            output_plugins: Vec::new(),
            priority: FlowPriority::default(),
            client_limit: None,
            expires_at: None,
            max_error_fraction: 1.0,
            status: HuntStatus::Started,
            status_reason: None,
            spawned: Default::default(),
            skipped: Default::default(),
            counters: HuntCounters::default(),
            window_started_at: now,
            launched_in_window: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn capacity_honours_both_limits() {
        let mut hunt = record(HuntRateLimit {
            max_new_per_interval: Some(2),
            interval_secs: 60,
            max_concurrent: Some(5),
        });
        assert!(!at_capacity(&hunt));
        hunt.launched_in_window = 2;
        assert!(at_capacity(&hunt));
        hunt.launched_in_window = 0;
        hunt.counters.running = 5;
        assert!(at_capacity(&hunt));
    }

    #[test]
    fn window_rolls_after_interval() {
        let mut hunt = record(HuntRateLimit {
            max_new_per_interval: Some(1),
            interval_secs: 60,
            max_concurrent: None,
        });
        hunt.launched_in_window = 1;
        let start = hunt.window_started_at;
        assert!(!roll_window(&mut hunt, start + chrono::Duration::seconds(59)));
        assert!(roll_window(&mut hunt, start + chrono::Duration::seconds(60)));
        assert_eq!(hunt.launched_in_window, 0);
    }

    #[test]
    fn zero_limits_are_rejected() {
        assert!(validate_rate_limit(&HuntRateLimit::concurrent(0)).is_err());
        assert!(validate_rate_limit(&HuntRateLimit::concurrent(3)).is_ok());
    }
}
