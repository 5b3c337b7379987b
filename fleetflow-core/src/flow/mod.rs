//! Resumable per-client flows.
//!
//! A flow is a persisted record plus a table of named state handlers. Each
//! transition runs exactly one handler against an in-memory copy of the
//! record and commits the result with a single versioned write, so a failed
//! or conflicting write leaves the previous state untouched. Requests a
//! handler issues are keyed by id; whichever response arrives first resumes
//! its own handler, independent of issue order.

pub mod context;
pub mod lease;

use std::{
    collections::BTreeMap,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetflow_model::{
    AgentRequest, AgentResponse, ClientId, FlowError, FlowErrorCause, FlowId,
    FlowLogEntry, FlowRecord, FlowResult, FlowRunnerArgs, FlowStatus,
    InboxEntry, OutputPluginState, RequestId, RequestKind, RequestRecord,
    ResponseStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
    channel::MessageChannel,
    clock::SharedClock,
    config::{FlowConfig, OrchestratorConfig},
    error::{OrchestratorError, Result},
    events::{EventEnvelope, EventMeta, EventPublisher, OrchestratorEvent},
    output::{OutputPluginRegistry, OutputPluginRunner, push_bounded},
    registry::{FlowRegistry, FlowType},
    store::{JsonStore, ObjectStore, Version, keys},
    throttle::Throttle,
};

use context::{FlowContext, FlowLogicError, StateHandler};
use lease::{FlowLease, LeaseManager};

const TARGET: &str = "fleetflow::flow";

/// Told about every flow that reaches a terminal status.
#[async_trait]
pub trait FlowObserver: Send + Sync + fmt::Debug {
    async fn flow_finished(&self, record: &FlowRecord) -> Result<()>;
}

/// What happened to a response handed to [`FlowEngine::deliver`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Delivery {
    /// Persisted; the flow has work to do.
    Accepted,
    /// Same request id already in the inbox.
    Duplicate,
    /// Matches no outstanding request: already resolved or never issued.
    /// Discarded without touching the inbox.
    Stale,
    /// Persisted, but the flow is finished and will not run handlers.
    Inactive,
    UnknownFlow,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessOutcome {
    Idle,
    Advanced {
        handled: usize,
        status: FlowStatus,
        more_work: bool,
    },
    LeaseBusy,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub expired: Vec<FlowId>,
    pub finalized: Vec<FlowId>,
    /// Flows with matched responses waiting; the caller should queue them.
    pub ready: Vec<FlowId>,
}

/// Entry in the per-client flow index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientFlowEntry {
    pub flow_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StepEffects {
    sends: Vec<AgentRequest>,
    local: Vec<(RequestId, Value)>,
    results: Vec<FlowResult>,
}

pub struct FlowEngine {
    store: JsonStore,
    channel: Arc<dyn MessageChannel>,
    registry: Arc<FlowRegistry>,
    outputs: OutputPluginRunner,
    throttle: Throttle,
    leases: LeaseManager,
    events: Arc<dyn EventPublisher>,
    clock: SharedClock,
    config: FlowConfig,
    observers: RwLock<Vec<Arc<dyn FlowObserver>>>,
    arrivals: AtomicU64,
    instance: String,
}

impl fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let observers = self
            .observers
            .read()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("FlowEngine")
            .field("instance", &self.instance)
            .field("config", &self.config)
            .field("channel", &self.channel)
            .field("registry", &self.registry)
            .field("observers", &observers)
            .finish()
    }
}

impl FlowEngine {
    pub fn new(
        config: &OrchestratorConfig,
        store: Arc<dyn ObjectStore>,
        channel: Arc<dyn MessageChannel>,
        registry: Arc<FlowRegistry>,
        plugins: Arc<OutputPluginRegistry>,
        events: Arc<dyn EventPublisher>,
        clock: SharedClock,
    ) -> Self {
        let store = JsonStore::new(store, config.retry);
        let outputs = OutputPluginRunner::new(
            store.clone(),
            plugins,
            Arc::clone(&events),
            Arc::clone(&clock),
            config.flows.max_log_entries,
        );
        Self {
            throttle: Throttle::new(
                store.clone(),
                Arc::clone(&clock),
                config.throttle,
            ),
            leases: LeaseManager::new(
                store.clone(),
                Arc::clone(&clock),
                config.lease,
            ),
            store,
            channel,
            registry,
            outputs,
            events,
            clock,
            config: config.flows,
            observers: RwLock::new(Vec::new()),
            arrivals: AtomicU64::new(0),
            instance: format!("fleetflow-{}", std::process::id()),
        }
    }

    pub fn register_observer(&self, observer: Arc<dyn FlowObserver>) {
        let mut guard = self.observers.write().unwrap_or_else(|e| e.into_inner());
        guard.push(observer);
    }

    pub fn store(&self) -> &JsonStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    pub fn outputs(&self) -> &OutputPluginRunner {
        &self.outputs
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Validates, throttles and launches a new flow, running its start state
    /// before returning.
    pub async fn start(
        &self,
        client_id: ClientId,
        flow_name: &str,
        args: Value,
        runner_args: FlowRunnerArgs,
    ) -> Result<FlowId> {
        self.start_with_id(FlowId::new(), client_id, flow_name, args, runner_args)
            .await
    }

    /// Same as [`FlowEngine::start`] with a caller-chosen id.
    pub async fn start_with_id(
        &self,
        flow_id: FlowId,
        client_id: ClientId,
        flow_name: &str,
        args: Value,
        runner_args: FlowRunnerArgs,
    ) -> Result<FlowId> {
        let flow_type = self.registry.resolve(flow_name)?;
        let args = flow_type.schema().validate(&args).map_err(|reason| {
            OrchestratorError::InvalidArgument(format!("{flow_name}: {reason}"))
        })?;
        self.outputs
            .registry()
            .validate(&runner_args.output_plugins)?;
        if runner_args.request_ttl_secs.is_some_and(|ttl| ttl <= 0) {
            return Err(OrchestratorError::InvalidArgument(
                "request_ttl_secs must be positive".into(),
            ));
        }

        self.throttle
            .check(&client_id, flow_name, &args, flow_id)
            .await?;
        let launched = self
            .launch(flow_id, client_id.clone(), flow_type, args.clone(), runner_args)
            .await;
        if let Err(err) = launched {
            // Only a launch that left no record is undone.
            if matches!(
                self.store.load::<FlowRecord>(&keys::flow(flow_id)).await,
                Ok(None)
            ) && let Err(rollback) = self
                .throttle
                .rollback(&client_id, flow_name, &args, flow_id)
                .await
            {
                tracing::warn!(
                    target: TARGET,
                    flow_id = %flow_id,
                    error = %rollback,
                    "throttle rollback failed"
                );
            }
            return Err(err);
        }
        Ok(flow_id)
    }

    async fn launch(
        &self,
        flow_id: FlowId,
        client_id: ClientId,
        flow_type: Arc<FlowType>,
        args: Value,
        runner_args: FlowRunnerArgs,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut record = FlowRecord {
            id: flow_id,
            client_id,
            flow_name: flow_type.name().to_string(),
            args,
            runner_args,
            status: FlowStatus::Running,
            pending_status: None,
            current_state: flow_type.start_state().to_string(),
            outstanding: BTreeMap::new(),
            next_request_id: RequestId::FIRST,
            scratch: Map::new(),
            counters: BTreeMap::new(),
            result_count: 0,
            result_batches: BTreeMap::new(),
            error: None,
            logs: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let created = format!("created for {}", record.client_id);
        self.log(&mut record, now, None, created);

        let effects = self.run_handler(
            &flow_type,
            &mut record,
            flow_type.start_state(),
            None,
            now,
        );

        self.outputs
            .attach(record.id, &record.runner_args.output_plugins)
            .await?;
        match self.commit(&mut record, None, &effects.results).await {
            Ok(_) => {}
            Err(err) if err.is_version_conflict() => {
                return Err(OrchestratorError::Internal(format!(
                    "flow {flow_id} already exists"
                )));
            }
            Err(err) => return Err(err),
        }
        self.store
            .create(
                &keys::client_flow(&record.client_id, record.id),
                &ClientFlowEntry {
                    flow_name: record.flow_name.clone(),
                    created_at: now,
                },
            )
            .await?;

        tracing::info!(
            target: TARGET,
            flow_id = %record.id,
            client_id = %record.client_id,
            flow = %record.flow_name,
            "flow started"
        );
        self.emit(OrchestratorEvent::FlowStarted {
            flow_id: record.id,
            client_id: record.client_id.clone(),
            flow_name: record.flow_name.clone(),
            hunt_id: record.hunt_id(),
        })
        .await;

        let follow_up =
            !effects.local.is_empty() || record.pending_status.is_some();
        self.after_commit(&record, effects).await?;
        if follow_up {
            self.process(record.id).await?;
        }
        Ok(())
    }

    /// Persists a response into the flow's inbox. Never runs handlers.
    pub async fn deliver(&self, response: AgentResponse) -> Result<Delivery> {
        let flow_id = response.session_id;
        let Some(current) =
            self.store.load::<FlowRecord>(&keys::flow(flow_id)).await?
        else {
            tracing::debug!(
                target: TARGET,
                flow_id = %flow_id,
                request_id = %response.request_id,
                "discarding response for unknown flow"
            );
            return Ok(Delivery::UnknownFlow);
        };
        let record = current.value;
        let request_id = response.request_id;
        let issued = request_id < record.next_request_id;
        let pending = record.outstanding.contains_key(&request_id);
        if !issued || (record.is_active() && !pending) {
            tracing::debug!(
                target: TARGET,
                flow_id = %flow_id,
                request_id = %request_id,
                issued,
                "discarding response without an outstanding request"
            );
            return Ok(Delivery::Stale);
        }

        let entry = InboxEntry {
            response,
            received_at: self.clock.now(),
            arrival: self.arrivals.fetch_add(1, Ordering::Relaxed),
        };
        let key = keys::flow_inbox_entry(flow_id, request_id);
        match self.store.create(&key, &entry).await? {
            None => Ok(Delivery::Duplicate),
            Some(_) if record.is_active() => Ok(Delivery::Accepted),
            Some(_) => Ok(Delivery::Inactive),
        }
    }

    /// Delivers `response` and, when it is new, drives the flow.
    pub async fn advance(&self, response: AgentResponse) -> Result<ProcessOutcome> {
        let flow_id = response.session_id;
        match self.deliver(response).await? {
            Delivery::Accepted => self.process(flow_id).await,
            _ => Ok(ProcessOutcome::Idle),
        }
    }

    /// Drives the flow, waiting briefly for a busy lease.
    pub async fn process(&self, flow_id: FlowId) -> Result<ProcessOutcome> {
        let owner = self.ephemeral_owner();
        let mut lease = match self.leases.acquire(flow_id, &owner).await {
            Ok(lease) => lease,
            Err(OrchestratorError::LeaseUnavailable(_)) => {
                return Ok(ProcessOutcome::LeaseBusy);
            }
            Err(err) => return Err(err),
        };
        let outcome = self.drive(flow_id, &mut lease).await;
        self.release(&lease).await;
        outcome
    }

    /// Drives the flow as `owner` without waiting on a busy lease.
    pub async fn process_as(
        &self,
        flow_id: FlowId,
        owner: &str,
    ) -> Result<ProcessOutcome> {
        let Some(mut lease) = self.leases.try_acquire(flow_id, owner).await?
        else {
            return Ok(ProcessOutcome::LeaseBusy);
        };
        let outcome = self.drive(flow_id, &mut lease).await;
        self.release(&lease).await;
        outcome
    }

    async fn drive(
        &self,
        flow_id: FlowId,
        lease: &mut FlowLease,
    ) -> Result<ProcessOutcome> {
        let key = keys::flow(flow_id);
        let mut handled = 0usize;
        let mut last_status = None;
        let mut conflicts = 0u16;
        let mut rounds = 0usize;
        let max_rounds = self.config.max_transition_rounds.max(1);

        while rounds < max_rounds {
            *lease = self.leases.keep_alive(lease.clone()).await?;
            let current = self.load_versioned(flow_id).await?;
            let version = current.version;
            let mut record = current.value;
            if record.status.is_terminal() {
                break;
            }

            if record.pending_status.is_some() {
                match self.finalize(record, version).await {
                    Ok(finished) => {
                        last_status = Some(finished.status);
                        break;
                    }
                    Err(err) if err.is_version_conflict() => {
                        conflicts += 1;
                        self.store.backoff(&key, conflicts).await?;
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }

            let now = self.clock.now();
            let effects = match self.next_matched(&record).await? {
                Some(entry) => {
                    let request_id = entry.response.request_id;
                    let Some(request) = record.outstanding.remove(&request_id)
                    else {
                        break;
                    };
                    match self.registry.resolve(&record.flow_name) {
                        Ok(flow_type) => self.run_handler(
                            &flow_type,
                            &mut record,
                            &request.next_state,
                            Some(&entry.response),
                            now,
                        ),
                        Err(err) => {
                            self.fail(
                                &mut record,
                                FlowErrorCause::FlowLogic,
                                err.to_string(),
                                Some(request.next_state.clone()),
                                now,
                            );
                            StepEffects::default()
                        }
                    }
                }
                None if record.outstanding.is_empty() => {
                    self.log(
                        &mut record,
                        now,
                        None,
                        "no outstanding requests left".to_string(),
                    );
                    self.finish(&mut record, FlowStatus::Terminated);
                    StepEffects::default()
                }
                None => break,
            };

            match self.commit(&mut record, Some(version), &effects.results).await {
                Ok(_) => {
                    rounds += 1;
                    handled += 1;
                    conflicts = 0;
                    last_status = Some(record.status);
                    self.after_commit(&record, effects).await?;
                }
                Err(err) if err.is_version_conflict() => {
                    conflicts += 1;
                    self.store.backoff(&key, conflicts).await?;
                }
                Err(err) => return Err(err),
            }
        }

        Ok(match last_status {
            Some(status) => ProcessOutcome::Advanced {
                handled,
                status,
                more_work: rounds >= max_rounds,
            },
            None => ProcessOutcome::Idle,
        })
    }

    /// Earliest-received inbox entry that answers an outstanding request.
    async fn next_matched(&self, record: &FlowRecord) -> Result<Option<InboxEntry>> {
        let mut best: Option<InboxEntry> = None;
        for child in self
            .store
            .list_children(&keys::flow_inbox(record.id))
            .await?
        {
            let Some(request_id) = RequestId::from_key(&child) else {
                continue;
            };
            if !record.outstanding.contains_key(&request_id) {
                continue;
            }
            let Some(entry) = self
                .store
                .load::<InboxEntry>(&keys::flow_inbox_entry(record.id, request_id))
                .await?
            else {
                continue;
            };
            let entry = entry.value;
            let earlier = best.as_ref().is_none_or(|current| {
                (entry.received_at, entry.arrival)
                    < (current.received_at, current.arrival)
            });
            if earlier {
                best = Some(entry);
            }
        }
        Ok(best)
    }

    async fn has_matched(&self, record: &FlowRecord) -> Result<bool> {
        Ok(self
            .store
            .list_children(&keys::flow_inbox(record.id))
            .await?
            .iter()
            .filter_map(|child| RequestId::from_key(child))
            .any(|id| record.outstanding.contains_key(&id)))
    }

    fn run_handler(
        &self,
        flow_type: &FlowType,
        record: &mut FlowRecord,
        state: &str,
        response: Option<&AgentResponse>,
        now: DateTime<Utc>,
    ) -> StepEffects {
        let mut ctx = FlowContext::new(
            record.id,
            record.client_id.clone(),
            record.flow_name.clone(),
            state.to_string(),
            now,
            record.args.clone(),
            record.scratch.clone(),
            record.counters.clone(),
        );
        let outcome = match flow_type.handler(state) {
            Some(handler) => invoke(&**handler, &mut ctx, response),
            None => Err(FlowLogicError::new(format!(
                "flow {} has no state {state:?}",
                record.flow_name
            ))),
        }
        .and_then(|()| {
            match ctx
                .issued
                .iter()
                .find(|issued| !flow_type.has_state(&issued.next_state))
            {
                Some(bad) => Err(FlowLogicError::new(format!(
                    "request targets unknown state {:?}",
                    bad.next_state
                ))),
                None => Ok(()),
            }
        });

        record.current_state = state.to_string();
        record.updated_at = now;
        for line in std::mem::take(&mut ctx.logs) {
            self.log(record, now, Some(state), line);
        }

        let mut effects = StepEffects::default();
        if let Err(err) = outcome {
            tracing::warn!(
                target: TARGET,
                flow_id = %record.id,
                client_id = %record.client_id,
                state,
                error = %err,
                "state handler failed"
            );
            self.fail(
                record,
                FlowErrorCause::FlowLogic,
                err.message,
                Some(state.to_string()),
                now,
            );
            return effects;
        }

        record.scratch = std::mem::take(&mut ctx.scratch);
        record.counters = std::mem::take(&mut ctx.counters);

        for payload in std::mem::take(&mut ctx.results) {
            effects.results.push(FlowResult {
                flow_id: record.id,
                client_id: record.client_id.clone(),
                seq: record.result_count,
                source_state: state.to_string(),
                payload,
                emitted_at: now,
            });
            record.result_count += 1;
        }

        if ctx.terminate {
            record.outstanding.clear();
            self.finish(record, FlowStatus::Terminated);
            return effects;
        }

        let ttl = chrono::Duration::seconds(
            record
                .runner_args
                .request_ttl_secs
                .unwrap_or(self.config.request_ttl_secs),
        );
        for issued in std::mem::take(&mut ctx.issued) {
            let request_id = record.next_request_id;
            record.next_request_id = request_id.next();
            let deadline = (issued.kind == RequestKind::Client).then(|| now + ttl);
            match issued.kind {
                RequestKind::Client => effects.sends.push(AgentRequest {
                    client_id: record.client_id.clone(),
                    session_id: record.id,
                    request_id,
                    payload: issued.payload.clone(),
                }),
                RequestKind::Local => effects
                    .local
                    .push((request_id, issued.payload.args.clone())),
            }
            record.outstanding.insert(
                request_id,
                RequestRecord {
                    id: request_id,
                    next_state: issued.next_state,
                    kind: issued.kind,
                    payload: issued.payload,
                    issued_at: now,
                    deadline,
                },
            );
        }

        if record.outstanding.is_empty() {
            self.finish(record, FlowStatus::Terminated);
        }
        effects
    }

    fn fail(
        &self,
        record: &mut FlowRecord,
        cause: FlowErrorCause,
        message: String,
        state: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.log(record, now, state.as_deref(), format!("{cause:?}: {message}"));
        record.error = Some(FlowError {
            cause,
            message,
            state,
            backtrace: Some(render_trace(&record.logs)),
            occurred_at: now,
        });
        record.outstanding.clear();
        let status = match cause {
            FlowErrorCause::Cancelled => FlowStatus::Terminated,
            FlowErrorCause::FlowLogic | FlowErrorCause::ClientUnresponsive => {
                FlowStatus::Error
            }
        };
        self.finish(record, status);
    }

    /// With output plugins attached the terminal status is parked until the
    /// plugins have seen every result.
    fn finish(&self, record: &mut FlowRecord, status: FlowStatus) {
        if record.runner_args.output_plugins.is_empty() {
            record.status = status;
        } else {
            record.pending_status = Some(status);
        }
    }

    fn log(
        &self,
        record: &mut FlowRecord,
        at: DateTime<Utc>,
        state: Option<&str>,
        message: String,
    ) {
        push_bounded(
            &mut record.logs,
            FlowLogEntry {
                at,
                state: state.map(str::to_string),
                message,
            },
            self.config.max_log_entries.max(1),
        );
    }

    /// Results are written create-only under a fresh batch id, then the
    /// record naming that batch. A commit that loses the version race
    /// leaves its entries unreferenced.
    async fn commit(
        &self,
        record: &mut FlowRecord,
        version: Option<Version>,
        results: &[FlowResult],
    ) -> Result<Version> {
        if let Some(first) = results.first() {
            let batch = Uuid::now_v7();
            for result in results {
                let key = keys::flow_result(record.id, result.seq, batch);
                if self.store.create(&key, result).await?.is_none() {
                    return Err(OrchestratorError::Internal(format!(
                        "result {key} already written"
                    )));
                }
            }
            record.result_batches.insert(first.seq, batch);
        }
        self.store
            .write(&keys::flow(record.id), record, version)
            .await
    }

    async fn after_commit(
        &self,
        record: &FlowRecord,
        effects: StepEffects,
    ) -> Result<()> {
        for request in effects.sends {
            tracing::debug!(
                target: TARGET,
                flow_id = %record.id,
                client_id = %record.client_id,
                request_id = %request.request_id,
                action = %request.payload.action,
                "request issued"
            );
            let event = OrchestratorEvent::RequestIssued {
                flow_id: record.id,
                client_id: record.client_id.clone(),
                request_id: request.request_id,
                action: request.payload.action.clone(),
            };
            if let Err(err) = self.channel.send(request).await {
                tracing::warn!(
                    target: TARGET,
                    flow_id = %record.id,
                    error = %err,
                    "channel send failed; request stays outstanding"
                );
            }
            self.emit(event).await;
        }

        let now = self.clock.now();
        for (request_id, payload) in effects.local {
            let entry = InboxEntry {
                response: AgentResponse {
                    session_id: record.id,
                    request_id,
                    status: ResponseStatus::Ok,
                    payload: Some(payload),
                },
                received_at: now,
                arrival: self.arrivals.fetch_add(1, Ordering::Relaxed),
            };
            self.store
                .create(&keys::flow_inbox_entry(record.id, request_id), &entry)
                .await?;
        }

        if !effects.results.is_empty() {
            self.emit(OrchestratorEvent::ResultsEmitted {
                flow_id: record.id,
                count: effects.results.len() as u64,
                total: record.result_count,
            })
            .await;
        }
        if !record.runner_args.output_plugins.is_empty()
            && (!effects.results.is_empty() || record.pending_status.is_some())
        {
            self.outputs.flush(record).await?;
        }
        if record.status.is_terminal() {
            self.announce_finished(record).await;
        }
        Ok(())
    }

    /// Second half of a terminal commit: flush plugins, then flip status.
    async fn finalize(
        &self,
        mut record: FlowRecord,
        version: Version,
    ) -> Result<FlowRecord> {
        self.outputs.flush(&record).await?;
        let Some(status) = record.pending_status.take() else {
            return Ok(record);
        };
        record.status = record.status.transition_to(status)?;
        let now = self.clock.now();
        record.updated_at = now;
        self.store
            .write(&keys::flow(record.id), &record, Some(version))
            .await?;
        self.announce_finished(&record).await;
        Ok(record)
    }

    async fn announce_finished(&self, record: &FlowRecord) {
        tracing::info!(
            target: TARGET,
            flow_id = %record.id,
            client_id = %record.client_id,
            status = %record.status,
            results = record.result_count,
            "flow finished"
        );
        self.emit(OrchestratorEvent::FlowFinished {
            flow_id: record.id,
            client_id: record.client_id.clone(),
            status: record.status,
            hunt_id: record.hunt_id(),
        })
        .await;

        let observers = self
            .observers
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        for observer in observers {
            if let Err(err) = observer.flow_finished(record).await {
                tracing::warn!(
                    target: TARGET,
                    flow_id = %record.id,
                    error = %err,
                    "flow observer failed"
                );
            }
        }
    }

    /// Stops the flow: TERMINATED with a `Cancelled` cause. Requests already
    /// sent are left alone; their responses are stored but never handled.
    pub async fn cancel(&self, flow_id: FlowId, reason: &str) -> Result<FlowRecord> {
        self.load(flow_id).await?;
        let reason = reason.to_string();
        self.terminate_locked(flow_id, move |record, _now| {
            record.is_active().then(|| {
                (FlowErrorCause::Cancelled, format!("cancelled: {reason}"), None)
            })
        })
        .await
    }

    /// Fails the flow with `ClientUnresponsive` if `request_id` is still
    /// outstanding.
    pub async fn mark_timed_out(
        &self,
        flow_id: FlowId,
        request_id: RequestId,
    ) -> Result<FlowRecord> {
        self.terminate_locked(flow_id, move |record, _now| {
            record
                .outstanding
                .get(&request_id)
                .filter(|_| record.is_active())
                .map(|request| unresponsive(record, request))
        })
        .await
    }

    /// Fails the flow if any client request is past its deadline.
    pub async fn expire_overdue(&self, flow_id: FlowId) -> Result<FlowRecord> {
        self.terminate_locked(flow_id, |record, now| {
            if !record.is_active() {
                return None;
            }
            record
                .outstanding_client_requests()
                .find(|request| request.deadline.is_some_and(|d| d <= now))
                .map(|request| unresponsive(record, request))
        })
        .await
    }

    async fn terminate_locked<F>(&self, flow_id: FlowId, decide: F) -> Result<FlowRecord>
    where
        F: Fn(&FlowRecord, DateTime<Utc>) -> Option<(FlowErrorCause, String, Option<String>)>
            + Send
            + Sync,
    {
        let owner = self.ephemeral_owner();
        let mut lease = self.leases.acquire(flow_id, &owner).await?;
        let outcome = self.terminate_with_lease(flow_id, &mut lease, decide).await;
        self.release(&lease).await;
        outcome
    }

    async fn terminate_with_lease<F>(
        &self,
        flow_id: FlowId,
        lease: &mut FlowLease,
        decide: F,
    ) -> Result<FlowRecord>
    where
        F: Fn(&FlowRecord, DateTime<Utc>) -> Option<(FlowErrorCause, String, Option<String>)>
            + Send
            + Sync,
    {
        let key = keys::flow(flow_id);
        let mut conflicts = 0u16;
        loop {
            let current = self.load_versioned(flow_id).await?;
            let mut record = current.value;
            let now = self.clock.now();
            let Some((cause, message, state)) = decide(&record, now) else {
                return Ok(record);
            };
            self.fail(&mut record, cause, message, state, now);
            record.updated_at = now;
            match self.commit(&mut record, Some(current.version), &[]).await {
                Ok(_) => {
                    tracing::info!(
                        target: TARGET,
                        flow_id = %flow_id,
                        cause = ?cause,
                        "flow stopped"
                    );
                    self.after_commit(&record, StepEffects::default()).await?;
                    if record.pending_status.is_some() {
                        self.drive(flow_id, lease).await?;
                        return self.load(flow_id).await;
                    }
                    return Ok(record);
                }
                Err(err) if err.is_version_conflict() => {
                    conflicts += 1;
                    self.store.backoff(&key, conflicts).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Expires overdue requests, completes flows stuck between their two
    /// terminal commits, and reports flows with unprocessed responses.
    /// A failure on one flow is logged and the pass moves on.
    pub async fn housekeep(&self) -> Result<HousekeepingReport> {
        let mut report = HousekeepingReport::default();
        let now = self.clock.now();
        for flow_id in self.flow_ids().await? {
            if let Err(err) = self.housekeep_flow(flow_id, now, &mut report).await {
                tracing::warn!(
                    target: TARGET,
                    flow_id = %flow_id,
                    error = %err,
                    "housekeeping skipped flow"
                );
            }
        }
        Ok(report)
    }

    async fn housekeep_flow(
        &self,
        flow_id: FlowId,
        now: DateTime<Utc>,
        report: &mut HousekeepingReport,
    ) -> Result<()> {
        let Some(current) =
            self.store.load::<FlowRecord>(&keys::flow(flow_id)).await?
        else {
            return Ok(());
        };
        let record = current.value;
        if !record.is_running() {
            return Ok(());
        }

        let overdue = record
            .outstanding_client_requests()
            .any(|request| request.deadline.is_some_and(|d| d <= now));
        if record.is_active() && overdue {
            self.expire_overdue(flow_id).await?;
            report.expired.push(flow_id);
        } else if record.pending_status.is_some() || record.outstanding.is_empty() {
            if let ProcessOutcome::Advanced { .. } = self.process(flow_id).await? {
                report.finalized.push(flow_id);
            }
        } else if self.has_matched(&record).await? {
            report.ready.push(flow_id);
        }
        Ok(())
    }

    pub async fn load(&self, flow_id: FlowId) -> Result<FlowRecord> {
        Ok(self.load_versioned(flow_id).await?.value)
    }

    async fn load_versioned(
        &self,
        flow_id: FlowId,
    ) -> Result<crate::store::Versioned<FlowRecord>> {
        self.store
            .load::<FlowRecord>(&keys::flow(flow_id))
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("flow {flow_id}")))
    }

    pub async fn flow_ids(&self) -> Result<Vec<FlowId>> {
        Ok(self
            .store
            .list_children(keys::FLOWS)
            .await?
            .iter()
            .filter_map(|child| child.parse().ok())
            .collect())
    }

    /// Committed results only; anything past `result_count` is invisible.
    pub async fn results(
        &self,
        flow_id: FlowId,
        offset: u64,
        count: Option<u64>,
    ) -> Result<Vec<FlowResult>> {
        let record = self.load(flow_id).await?;
        let end = match count {
            Some(count) => offset.saturating_add(count).min(record.result_count),
            None => record.result_count,
        };
        if offset >= end {
            return Ok(Vec::new());
        }
        self.outputs.read_results(&record, offset, end).await
    }

    pub async fn output_plugins(
        &self,
        flow_id: FlowId,
    ) -> Result<Vec<OutputPluginState>> {
        self.load(flow_id).await?;
        self.outputs.states(flow_id).await
    }

    pub async fn client_flows(&self, client_id: &ClientId) -> Result<Vec<FlowRecord>> {
        let mut flows = Vec::new();
        for child in self
            .store
            .list_children(&keys::client_flows(client_id))
            .await?
        {
            let Ok(flow_id) = child.parse::<FlowId>() else {
                continue;
            };
            if let Some(record) =
                self.store.load::<FlowRecord>(&keys::flow(flow_id)).await?
            {
                flows.push(record.value);
            }
        }
        flows.sort_by_key(|record| record.created_at);
        Ok(flows)
    }

    async fn release(&self, lease: &FlowLease) {
        if let Err(err) = self.leases.release(lease).await {
            tracing::warn!(
                target: TARGET,
                flow_id = %lease.flow_id,
                error = %err,
                "lease release failed"
            );
        }
    }

    fn ephemeral_owner(&self) -> String {
        format!("{}-inline-{}", self.instance, Uuid::now_v7())
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

fn unresponsive(
    record: &FlowRecord,
    request: &RequestRecord,
) -> (FlowErrorCause, String, Option<String>) {
    (
        FlowErrorCause::ClientUnresponsive,
        format!(
            "client {} did not answer request {} ({}) in time",
            record.client_id, request.id, request.payload.action
        ),
        Some(request.next_state.clone()),
    )
}

fn invoke(
    handler: &dyn StateHandler,
    ctx: &mut FlowContext,
    response: Option<&AgentResponse>,
) -> std::result::Result<(), FlowLogicError> {
    match catch_unwind(AssertUnwindSafe(|| handler.handle(ctx, response))) {
        Ok(outcome) => outcome,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(FlowLogicError::new(format!("state handler panicked: {detail}")))
        }
    }
}

fn render_trace(logs: &[FlowLogEntry]) -> String {
    logs.iter()
        .map(|entry| {
            format!(
                "{} [{}] {}",
                entry.at.to_rfc3339(),
                entry.state.as_deref().unwrap_or("-"),
                entry.message
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
