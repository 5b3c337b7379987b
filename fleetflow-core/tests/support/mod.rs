#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};

use fleetflow_core::{
    ArgKind, ArgSchema, ArgSpec, FlowContext, FlowEngine, FlowLogicError,
    FlowObserver, FlowRegistry, FlowScheduler, FlowType, HuntEngine,
    InMemoryChannel, InMemoryClientDirectory, InMemoryObjectStore, ManualClock,
    ObjectStore, Orchestrator, OrchestratorConfig, OrchestratorError,
    OutputPluginRegistry, OutputSink, SinkContext, SinkError,
    store::Versioned,
};
use fleetflow_model::{AgentRequest, AgentResponse, FlowRecord, FlowResult};

pub const RECORDING_SINK: &str = "RecordingOutputPlugin";
pub const FAILING_SINK: &str = "FailingOutputPlugin";

/// Shared, ordered record of what sinks and observers saw.
#[derive(Debug, Default, Clone)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().expect("journal lock").push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().expect("journal lock").clone()
    }
}

#[derive(Debug)]
pub struct RecordingSink {
    journal: Journal,
}

#[async_trait]
impl OutputSink for RecordingSink {
    async fn process(
        &self,
        ctx: &SinkContext,
        batch: &[FlowResult],
    ) -> std::result::Result<(), SinkError> {
        for result in batch {
            self.journal.push(format!(
                "sink:{}:{}:{}",
                ctx.instance_id, result.seq, result.payload
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FailingSink;

#[async_trait]
impl OutputSink for FailingSink {
    async fn process(
        &self,
        _ctx: &SinkContext,
        _batch: &[FlowResult],
    ) -> std::result::Result<(), SinkError> {
        Err(SinkError::new("disk full"))
    }
}

#[derive(Debug)]
pub struct FinishObserver {
    journal: Journal,
}

#[async_trait]
impl FlowObserver for FinishObserver {
    async fn flow_finished(&self, record: &FlowRecord) -> fleetflow_core::Result<()> {
        self.journal
            .push(format!("finished:{}:{}", record.flow_name, record.status));
        Ok(())
    }
}

/// Wraps the in-memory store and fails writes to one chosen key.
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: InMemoryObjectStore,
    fail_key: Mutex<Option<String>>,
}

impl FailingStore {
    pub fn fail_writes_to(&self, key: Option<String>) {
        *self.fail_key.lock().expect("fail key lock") = key;
    }
}

#[async_trait]
impl ObjectStore for FailingStore {
    async fn open(&self, key: &str) -> fleetflow_core::Result<Option<Versioned<Vec<u8>>>> {
        self.inner.open(key).await
    }

    async fn write(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: Option<u64>,
    ) -> fleetflow_core::Result<u64> {
        let failing = self.fail_key.lock().expect("fail key lock").clone();
        if failing.as_deref() == Some(key) {
            return Err(OrchestratorError::Transient(format!("injected failure on {key}")));
        }
        self.inner.write(key, value, expected).await
    }

    async fn list_children(&self, prefix: &str) -> fleetflow_core::Result<Vec<String>> {
        self.inner.list_children(prefix).await
    }
}

fn emit_reply(ctx: &mut FlowContext, response: Option<&AgentResponse>) -> fleetflow_core::HandlerResult {
    let response = response.ok_or_else(|| FlowLogicError::new("missing response"))?;
    if !response.is_ok() {
        return Err(FlowLogicError::new("agent reported an error"));
    }
    let reply = response
        .payload
        .as_ref()
        .and_then(|payload| payload.get("reply"))
        .cloned()
        .unwrap_or(Value::Null);
    ctx.emit_result(reply)?;
    ctx.terminate();
    Ok(())
}

/// Flow types used across the integration suites.
pub fn registry() -> Result<FlowRegistry> {
    let echo = FlowType::builder("Echo")
        .category("diagnostics")
        .description("Sends ping and emits the agent's reply")
        .schema(ArgSchema::new().arg(
            ArgSpec::optional("message", ArgKind::String).with_default(json!("hi")),
        ))
        .state("Start", |ctx, _| {
            let message: String = ctx.arg("message")?;
            ctx.log(format!("pinging with {message}"));
            ctx.call_client("ping", json!({ "message": message }), "Reply");
            Ok(())
        })
        .state("Reply", emit_reply)
        .build()?;

    // Issues every hop up front and emits in index order once all replies
    // are in, so arrival order never shows in the output.
    let fan_out = FlowType::builder("FanOut")
        .category("diagnostics")
        .schema(ArgSchema::new().arg(
            ArgSpec::optional("hops", ArgKind::Integer).with_default(json!(3)),
        ))
        .state("Start", |ctx, _| {
            let hops: u64 = ctx.arg("hops")?;
            for index in 0..hops {
                ctx.call_client("collect", json!({ "index": index }), "Collect");
            }
            Ok(())
        })
        .state("Collect", |ctx, response| {
            let payload = response
                .and_then(|r| r.payload.clone())
                .ok_or_else(|| FlowLogicError::new("empty reply"))?;
            let index = payload
                .get("index")
                .and_then(Value::as_u64)
                .ok_or_else(|| FlowLogicError::new("reply without index"))?;
            ctx.set_scratch(format!("hop_{index}"), payload.get("value"))?;
            let answered = ctx.increment("answered", 1);
            let hops: u64 = ctx.arg("hops")?;
            if answered == hops {
                for index in 0..hops {
                    let value: Value = ctx
                        .scratch(&format!("hop_{index}"))
                        .unwrap_or(Value::Null);
                    ctx.emit_result(value)?;
                }
            }
            Ok(())
        })
        .build()?;

    let chain = FlowType::builder("Chain")
        .schema(ArgSchema::new().arg(
            ArgSpec::optional("hops", ArgKind::Integer).with_default(json!(2)),
        ))
        .state("Start", |ctx, _| {
            ctx.call_client("step", json!({ "n": 0 }), "Step");
            Ok(())
        })
        .state("Step", |ctx, _| {
            let n = ctx.counter("steps");
            ctx.emit_result(n)?;
            let next = ctx.increment("steps", 1);
            let hops: u64 = ctx.arg("hops")?;
            if next < hops {
                ctx.call_client("step", json!({ "n": next }), "Step");
            }
            Ok(())
        })
        .build()?;

    let local = FlowType::builder("LocalHops")
        .state("Start", |ctx, _| {
            ctx.call_state("Middle", json!({ "x": 1 }));
            Ok(())
        })
        .state("Middle", |ctx, response| {
            ctx.emit_result(response.and_then(|r| r.payload.clone()))?;
            ctx.call_state("End", json!({ "x": 2 }));
            Ok(())
        })
        .state("End", |ctx, response| {
            ctx.emit_result(response.and_then(|r| r.payload.clone()))?;
            Ok(())
        })
        .build()?;

    let failing = FlowType::builder("Failing")
        .state("Start", |ctx, _| {
            ctx.call_client("ping", json!({}), "Explode");
            Ok(())
        })
        .state("Explode", |ctx, _| {
            ctx.log("about to fail");
            Err(FlowLogicError::new("kaboom"))
        })
        .build()?;

    let panicking = FlowType::builder("Panicking")
        .state("Start", |_, _| -> fleetflow_core::HandlerResult {
            panic!("handler bug")
        })
        .build()?;

    let dangling = FlowType::builder("Dangling")
        .state("Start", |ctx, _| {
            ctx.call_client("ping", json!({}), "Nowhere");
            Ok(())
        })
        .build()?;

    let early = FlowType::builder("EmitThenWait")
        .state("Start", |ctx, _| {
            ctx.emit_result("early")?;
            ctx.call_client("ping", json!({}), "Finish");
            Ok(())
        })
        .state("Finish", |ctx, _| {
            ctx.emit_result("late")?;
            Ok(())
        })
        .build()?;

    Ok(FlowRegistry::builder()
        .register(echo)?
        .register(fan_out)?
        .register(chain)?
        .register(local)?
        .register(failing)?
        .register(panicking)?
        .register(dangling)?
        .register(early)?
        .build())
}

pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.lease.acquire_backoff_ms = 1;
    config.retry.backoff_base_ms = 1;
    config.retry.backoff_max_ms = 5;
    config.retry.max_attempts = 32;
    config.scheduler.poll_interval_ms = 5;
    config.scheduler.busy_backoff_ms = 1;
    config.hunts.tick_interval_ms = 10;
    config
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub flows: Arc<FlowEngine>,
    pub hunts: Arc<HuntEngine>,
    pub scheduler: Arc<FlowScheduler>,
    pub channel: InMemoryChannel,
    pub directory: InMemoryClientDirectory,
    pub clock: ManualClock,
    pub store: Arc<FailingStore>,
    pub journal: Journal,
}

impl Harness {
    pub fn new() -> Result<Self> {
        Self::with_config(test_config())
    }

    pub fn with_config(config: OrchestratorConfig) -> Result<Self> {
        let channel = InMemoryChannel::new();
        let directory = InMemoryClientDirectory::new();
        let clock = ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .context("fixed start time")?,
        );
        let store = Arc::new(FailingStore::default());
        let journal = Journal::default();

        let plugins = OutputPluginRegistry::builder()
            .register(
                RECORDING_SINK,
                Arc::new(RecordingSink {
                    journal: journal.clone(),
                }),
            )
            .register(FAILING_SINK, Arc::new(FailingSink))
            .build();

        let orchestrator = Orchestrator::builder(registry()?)
            .config(config)
            .output_plugins(plugins)
            .store(store.clone())
            .channel(Arc::new(channel.clone()))
            .directory(Arc::new(directory.clone()))
            .clock(Arc::new(clock.clone()))
            .build();
        let flows = orchestrator.flows();
        flows.register_observer(Arc::new(FinishObserver {
            journal: journal.clone(),
        }));

        Ok(Self {
            flows,
            hunts: orchestrator.hunts(),
            scheduler: orchestrator.scheduler(),
            orchestrator,
            channel,
            directory,
            clock,
            store,
            journal,
        })
    }

    /// Answers every request waiting in the channel with `reply(request)`.
    pub async fn answer_all<F>(&self, reply: F) -> usize
    where
        F: Fn(&AgentRequest) -> Value,
    {
        let requests = self.channel.take_all_requests().await;
        let count = requests.len();
        for request in &requests {
            self.channel
                .push_response(AgentResponse::ok(request, reply(request)))
                .await;
        }
        count
    }

    /// Polls the channel and drives flows until nothing is left to do.
    pub async fn settle(&self) -> Result<usize> {
        Ok(self.scheduler.run_until_idle().await?)
    }
}

pub fn pong(_: &AgentRequest) -> Value {
    json!({ "reply": "oh" })
}

/// Echoes the request's index back with a derived value.
pub fn collect_reply(request: &AgentRequest) -> Value {
    let index = request.payload.args["index"].as_u64().unwrap_or_default();
    json!({ "index": index, "value": format!("v{index}") })
}
