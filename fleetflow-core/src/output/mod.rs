//! Output plugins: independently cursored consumers of a flow's results.
//!
//! Each plugin instance attached to a flow keeps its own persisted cursor,
//! log and error list. A failing instance only records an error on its own
//! state; it never changes the flow's status or holds back other instances.

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use fleetflow_model::{
    ClientId, FlowId, FlowRecord, FlowResult, HuntId, OutputPluginDescriptor,
    OutputPluginState, PluginLogEntry,
};
use serde_json::Value;
use thiserror::Error;

use crate::{
    clock::SharedClock,
    error::{OrchestratorError, Result},
    events::{EventEnvelope, EventMeta, EventPublisher, OrchestratorEvent},
    store::{JsonStore, keys},
};

const TARGET: &str = "fleetflow::output";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SinkError {
    pub message: String,
}

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Everything a sink knows about the batch it is handed.
#[derive(Clone, Debug)]
pub struct SinkContext {
    pub flow_id: FlowId,
    pub client_id: ClientId,
    pub flow_name: String,
    pub hunt_id: Option<HuntId>,
    pub instance_id: String,
    pub args: Value,
}

#[async_trait]
pub trait OutputSink: Send + Sync + fmt::Debug {
    /// Consumes one batch. Results may be seen again after a crash, so
    /// implementations must tolerate redelivery.
    async fn process(
        &self,
        ctx: &SinkContext,
        batch: &[FlowResult],
    ) -> std::result::Result<(), SinkError>;
}

#[derive(Debug, Default)]
pub struct OutputPluginRegistry {
    sinks: BTreeMap<String, Arc<dyn OutputSink>>,
}

impl OutputPluginRegistry {
    pub fn builder() -> OutputPluginRegistryBuilder {
        OutputPluginRegistryBuilder::default()
    }

    pub fn get(&self, plugin_name: &str) -> Option<Arc<dyn OutputSink>> {
        self.sinks.get(plugin_name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sinks.keys().map(String::as_str)
    }

    pub fn validate(&self, descriptors: &[OutputPluginDescriptor]) -> Result<()> {
        match descriptors
            .iter()
            .find(|d| !self.sinks.contains_key(&d.plugin_name))
        {
            Some(missing) => Err(OrchestratorError::InvalidArgument(format!(
                "unknown output plugin {:?}",
                missing.plugin_name
            ))),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct OutputPluginRegistryBuilder {
    sinks: BTreeMap<String, Arc<dyn OutputSink>>,
}

impl OutputPluginRegistryBuilder {
    pub fn register(
        mut self,
        plugin_name: impl Into<String>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        self.sinks.insert(plugin_name.into(), sink);
        self
    }

    pub fn build(self) -> OutputPluginRegistry {
        OutputPluginRegistry { sinks: self.sinks }
    }
}

/// Drives registered sinks over a flow's committed results.
#[derive(Clone)]
pub struct OutputPluginRunner {
    store: JsonStore,
    registry: Arc<OutputPluginRegistry>,
    events: Arc<dyn EventPublisher>,
    clock: SharedClock,
    max_entries: usize,
}

impl fmt::Debug for OutputPluginRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputPluginRunner")
            .field("registry", &self.registry)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

impl OutputPluginRunner {
    pub fn new(
        store: JsonStore,
        registry: Arc<OutputPluginRegistry>,
        events: Arc<dyn EventPublisher>,
        clock: SharedClock,
        max_entries: usize,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            clock,
            max_entries: max_entries.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<OutputPluginRegistry> {
        &self.registry
    }

    /// Creates fresh state for every instance attached to the flow. Existing
    /// state is left untouched.
    pub async fn attach(
        &self,
        flow_id: FlowId,
        descriptors: &[OutputPluginDescriptor],
    ) -> Result<()> {
        for (index, descriptor) in descriptors.iter().enumerate() {
            let instance_id = descriptor.instance_id(index);
            let state =
                OutputPluginState::new(instance_id.clone(), descriptor.clone());
            self.store
                .create(&keys::flow_output_plugin(flow_id, &instance_id), &state)
                .await?;
        }
        Ok(())
    }

    /// Hands every instance the results between its cursor and the flow's
    /// committed `result_count`. Sink failures are recorded, not returned.
    pub async fn flush(&self, record: &FlowRecord) -> Result<()> {
        for (index, descriptor) in
            record.runner_args.output_plugins.iter().enumerate()
        {
            let instance_id = descriptor.instance_id(index);
            self.flush_instance(record, descriptor, &instance_id).await?;
        }
        Ok(())
    }

    async fn flush_instance(
        &self,
        record: &FlowRecord,
        descriptor: &OutputPluginDescriptor,
        instance_id: &str,
    ) -> Result<()> {
        let key = keys::flow_output_plugin(record.id, instance_id);
        let mut state = match self.store.load::<OutputPluginState>(&key).await? {
            Some(existing) => existing.value,
            None => OutputPluginState::new(
                instance_id.to_string(),
                descriptor.clone(),
            ),
        };
        if state.cursor >= record.result_count {
            return Ok(());
        }

        let batch = self
            .read_results(record, state.cursor, record.result_count)
            .await?;
        let now = self.clock.now();
        let outcome = match self.registry.get(&descriptor.plugin_name) {
            Some(sink) => {
                let ctx = SinkContext {
                    flow_id: record.id,
                    client_id: record.client_id.clone(),
                    flow_name: record.flow_name.clone(),
                    hunt_id: record.hunt_id(),
                    instance_id: instance_id.to_string(),
                    args: descriptor.args.clone(),
                };
                sink.process(&ctx, &batch).await
            }
            None => Err(SinkError::new(format!(
                "output plugin {:?} is not registered",
                descriptor.plugin_name
            ))),
        };

        match outcome {
            Ok(()) => {
                state.cursor = record.result_count;
                push_bounded(
                    &mut state.logs,
                    PluginLogEntry {
                        at: now,
                        flow_id: record.id,
                        message: format!("Processed {} results", batch.len()),
                    },
                    self.max_entries,
                );
            }
            Err(err) => {
                tracing::warn!(
                    target: TARGET,
                    flow_id = %record.id,
                    instance = instance_id,
                    error = %err,
                    "output plugin failed"
                );
                push_bounded(
                    &mut state.errors,
                    PluginLogEntry {
                        at: now,
                        flow_id: record.id,
                        message: err.message.clone(),
                    },
                    self.max_entries,
                );
                let envelope = EventEnvelope {
                    meta: EventMeta::new(now),
                    event: OrchestratorEvent::SinkFailed {
                        flow_id: record.id,
                        instance_id: instance_id.to_string(),
                        message: err.message,
                    },
                };
                if let Err(err) = self.events.publish(envelope).await {
                    tracing::warn!(target: TARGET, error = %err, "event publish failed");
                }
            }
        }
        self.store.put(&key, &state).await?;
        Ok(())
    }

    /// Committed results `from..to`, resolved through the record's batches.
    pub(crate) async fn read_results(
        &self,
        record: &FlowRecord,
        from: u64,
        to: u64,
    ) -> Result<Vec<FlowResult>> {
        let mut results = Vec::with_capacity(to.saturating_sub(from) as usize);
        for seq in from..to {
            let batch = record.result_batch(seq).ok_or_else(|| {
                OrchestratorError::Internal(format!(
                    "flow {} has no committed result {seq}",
                    record.id
                ))
            })?;
            let key = keys::flow_result(record.id, seq, batch);
            let result = self.store.load::<FlowResult>(&key).await?.ok_or_else(
                || OrchestratorError::Internal(format!("missing result {key}")),
            )?;
            results.push(result.value);
        }
        Ok(results)
    }

    pub async fn states(&self, flow_id: FlowId) -> Result<Vec<OutputPluginState>> {
        let mut states = Vec::new();
        for instance in self
            .store
            .list_children(&keys::flow_output_plugins(flow_id))
            .await?
        {
            if let Some(state) = self
                .store
                .load::<OutputPluginState>(&keys::flow_output_plugin(
                    flow_id, &instance,
                ))
                .await?
            {
                states.push(state.value);
            }
        }
        Ok(states)
    }

    pub async fn state(
        &self,
        flow_id: FlowId,
        instance_id: &str,
    ) -> Result<OutputPluginState> {
        self.store
            .load::<OutputPluginState>(&keys::flow_output_plugin(
                flow_id,
                instance_id,
            ))
            .await?
            .map(|v| v.value)
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!(
                    "output plugin {instance_id} on flow {flow_id}"
                ))
            })
    }
}

pub(crate) fn push_bounded<T>(entries: &mut Vec<T>, entry: T, max: usize) {
    entries.push(entry);
    if entries.len() > max {
        let overflow = entries.len() - max;
        entries.drain(..overflow);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_bounded_keeps_newest() {
        let mut entries = vec![1, 2, 3];
        push_bounded(&mut entries, 4, 3);
        assert_eq!(entries, vec![2, 3, 4]);
    }

    #[test]
    fn registry_rejects_unknown_plugins() {
        let registry = OutputPluginRegistry::default();
        let err = registry
            .validate(&[OutputPluginDescriptor::new("EmailOutputPlugin")])
            .expect_err("unknown plugin");
        assert!(matches!(err, OrchestratorError::InvalidArgument(_)));
        assert!(registry.validate(&[]).is_ok());
    }
}
