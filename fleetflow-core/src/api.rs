//! Caller-facing facade.
//!
//! Every method takes ids as strings (as an HTTP layer would receive them),
//! validates them before touching the store, and returns persisted state.
//! Transitions are only ever triggered here, never performed inline beyond
//! the start state of a new flow.

use std::{fmt, sync::Arc};

use fleetflow_model::{
    AgentResponse, ClientId, FlowId, FlowRecord, FlowResult, FlowRunnerArgs,
    HuntId, HuntRecord, OutputPluginState, PluginLogEntry,
};
use serde_json::Value;

use crate::{
    channel::{InMemoryChannel, MessageChannel},
    clock::{SharedClock, SystemClock},
    config::OrchestratorConfig,
    error::{OrchestratorError, Result},
    events::InProcEventBus,
    flow::{Delivery, FlowEngine},
    hunt::{
        CreateHuntRequest, HuntEngine,
        selection::{ClientDirectory, InMemoryClientDirectory},
    },
    output::OutputPluginRegistry,
    registry::{FlowDescriptor, FlowRegistry},
    runtime::OrchestratorRuntime,
    scheduler::FlowScheduler,
    store::{InMemoryObjectStore, ObjectStore},
};

pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    registry: FlowRegistry,
    plugins: OutputPluginRegistry,
    store: Option<Arc<dyn ObjectStore>>,
    channel: Option<Arc<dyn MessageChannel>>,
    directory: Option<Arc<dyn ClientDirectory>>,
    clock: Option<SharedClock>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("store", &self.store)
            .field("channel", &self.channel)
            .finish()
    }
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn output_plugins(mut self, plugins: OutputPluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn channel(mut self, channel: Arc<dyn MessageChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn ClientDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Missing collaborators default to the in-memory implementations and
    /// the system clock.
    pub fn build(self) -> Orchestrator {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryObjectStore::new()));
        let channel = self
            .channel
            .unwrap_or_else(|| Arc::new(InMemoryChannel::new()));
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(InMemoryClientDirectory::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = Arc::new(InProcEventBus::new(self.config.events.channel_capacity));

        let flows = Arc::new(FlowEngine::new(
            &self.config,
            store,
            Arc::clone(&channel),
            Arc::new(self.registry),
            Arc::new(self.plugins),
            events.clone(),
            clock,
        ));
        let hunts = Arc::new(HuntEngine::new(
            &self.config,
            Arc::clone(&flows),
            directory,
            events.clone(),
        ));
        let scheduler = Arc::new(FlowScheduler::new(
            Arc::clone(&flows),
            channel,
            self.config.scheduler,
        ));

        Orchestrator {
            config: self.config,
            flows,
            hunts,
            scheduler,
            events,
        }
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    flows: Arc<FlowEngine>,
    hunts: Arc<HuntEngine>,
    scheduler: Arc<FlowScheduler>,
    events: Arc<InProcEventBus>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("flows", &self.flows)
            .field("hunts", &self.hunts)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl Orchestrator {
    pub fn builder(registry: FlowRegistry) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config: OrchestratorConfig::default(),
            registry,
            plugins: OutputPluginRegistry::builder().build(),
            store: None,
            channel: None,
            directory: None,
            clock: None,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn flows(&self) -> Arc<FlowEngine> {
        Arc::clone(&self.flows)
    }

    pub fn hunts(&self) -> Arc<HuntEngine> {
        Arc::clone(&self.hunts)
    }

    pub fn scheduler(&self) -> Arc<FlowScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn events(&self) -> Arc<InProcEventBus> {
        Arc::clone(&self.events)
    }

    /// Background tasks for this orchestrator; call `start` on the result.
    pub fn runtime(&self) -> OrchestratorRuntime {
        OrchestratorRuntime::new(
            self.config.clone(),
            Arc::clone(&self.flows),
            Arc::clone(&self.hunts),
            Arc::clone(&self.scheduler),
            self.events.clone(),
        )
    }

    pub async fn start_flow(
        &self,
        client_id: &str,
        flow_name: &str,
        args: Value,
        runner_args: FlowRunnerArgs,
    ) -> Result<FlowId> {
        let client_id = parse_client(client_id)?;
        self.flows.start(client_id, flow_name, args, runner_args).await
    }

    pub async fn get_flow_status(&self, flow_id: &str) -> Result<FlowRecord> {
        self.flows.load(parse_flow(flow_id)?).await
    }

    pub async fn list_flow_results(
        &self,
        flow_id: &str,
        offset: u64,
        count: Option<u64>,
    ) -> Result<Vec<FlowResult>> {
        self.flows.results(parse_flow(flow_id)?, offset, count).await
    }

    pub async fn cancel_flow(&self, flow_id: &str, reason: &str) -> Result<FlowRecord> {
        self.flows.cancel(parse_flow(flow_id)?, reason).await
    }

    pub async fn list_output_plugins(
        &self,
        flow_id: &str,
    ) -> Result<Vec<OutputPluginState>> {
        self.flows.output_plugins(parse_flow(flow_id)?).await
    }

    pub async fn list_output_plugin_logs(
        &self,
        flow_id: &str,
        instance_id: &str,
    ) -> Result<Vec<PluginLogEntry>> {
        let state = self.plugin_state(flow_id, instance_id).await?;
        Ok(state.logs)
    }

    pub async fn list_output_plugin_errors(
        &self,
        flow_id: &str,
        instance_id: &str,
    ) -> Result<Vec<PluginLogEntry>> {
        let state = self.plugin_state(flow_id, instance_id).await?;
        Ok(state.errors)
    }

    async fn plugin_state(
        &self,
        flow_id: &str,
        instance_id: &str,
    ) -> Result<OutputPluginState> {
        let flow_id = parse_flow(flow_id)?;
        self.flows.load(flow_id).await?;
        self.flows.outputs().state(flow_id, instance_id).await
    }

    pub async fn list_client_flows(&self, client_id: &str) -> Result<Vec<FlowRecord>> {
        self.flows.client_flows(&parse_client(client_id)?).await
    }

    pub fn list_flow_descriptors(&self, category: Option<&str>) -> Vec<FlowDescriptor> {
        self.flows.registry().descriptors(category)
    }

    /// Hands an agent response straight to the engine, bypassing the channel
    /// poller. The flow is queued for the workers when it has work.
    pub async fn submit_response(&self, response: AgentResponse) -> Result<Delivery> {
        let flow_id = response.session_id;
        let delivery = self.flows.deliver(response).await?;
        if delivery == Delivery::Accepted {
            self.scheduler.enqueue(flow_id).await;
        }
        Ok(delivery)
    }

    pub async fn create_hunt(&self, request: CreateHuntRequest) -> Result<HuntId> {
        if let fleetflow_model::ClientSelectionRule::Explicit { clients } = &request.selection
            && clients.is_empty()
        {
            return Err(OrchestratorError::InvalidArgument(
                "explicit selection needs at least one client".into(),
            ));
        }
        self.hunts.create_hunt(request).await
    }

    pub async fn pause_hunt(&self, hunt_id: &str) -> Result<HuntRecord> {
        self.hunts.pause(parse_hunt(hunt_id)?).await
    }

    pub async fn resume_hunt(&self, hunt_id: &str) -> Result<HuntRecord> {
        self.hunts.resume(parse_hunt(hunt_id)?).await
    }

    pub async fn stop_hunt(&self, hunt_id: &str) -> Result<HuntRecord> {
        self.hunts.stop(parse_hunt(hunt_id)?).await
    }

    pub async fn get_hunt_status(&self, hunt_id: &str) -> Result<HuntRecord> {
        self.hunts.get(parse_hunt(hunt_id)?).await
    }

    pub async fn list_hunts(&self) -> Result<Vec<HuntRecord>> {
        self.hunts.list().await
    }
}

fn parse_flow(value: &str) -> Result<FlowId> {
    Ok(value.parse::<FlowId>()?)
}

fn parse_hunt(value: &str) -> Result<HuntId> {
    Ok(value.parse::<HuntId>()?)
}

fn parse_client(value: &str) -> Result<ClientId> {
    Ok(ClientId::parse(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_ids_are_invalid_arguments() {
        assert!(matches!(
            parse_flow("X:<script>"),
            Err(OrchestratorError::InvalidArgument(_))
        ));
        assert!(matches!(
            parse_client("C.123"),
            Err(OrchestratorError::InvalidArgument(_))
        ));
        assert!(parse_hunt(&HuntId::new().to_string()).is_ok());
    }
}
