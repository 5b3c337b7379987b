//! Orchestrator notifications and the in-process bus that fans them out.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetflow_model::{ClientId, FlowId, FlowStatus, HuntId, HuntStatus, RequestId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub event_id: Uuid,
    pub emitted_at: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(emitted_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            emitted_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    FlowStarted {
        flow_id: FlowId,
        client_id: ClientId,
        flow_name: String,
        hunt_id: Option<HuntId>,
    },
    RequestIssued {
        flow_id: FlowId,
        client_id: ClientId,
        request_id: RequestId,
        action: String,
    },
    ResultsEmitted {
        flow_id: FlowId,
        count: u64,
        total: u64,
    },
    FlowFinished {
        flow_id: FlowId,
        client_id: ClientId,
        status: FlowStatus,
        hunt_id: Option<HuntId>,
    },
    SinkFailed {
        flow_id: FlowId,
        instance_id: String,
        message: String,
    },
    HuntCreated {
        hunt_id: HuntId,
        flow_name: String,
    },
    HuntFlowSpawned {
        hunt_id: HuntId,
        client_id: ClientId,
        flow_id: FlowId,
    },
    HuntClientSkipped {
        hunt_id: HuntId,
        client_id: ClientId,
        reason: String,
    },
    HuntStatusChanged {
        hunt_id: HuntId,
        status: HuntStatus,
        reason: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub meta: EventMeta,
    pub event: OrchestratorEvent,
}

#[async_trait]
pub trait EventPublisher: Send + Sync + fmt::Debug {
    async fn publish(&self, envelope: EventEnvelope) -> Result<()>;
}

/// Lightweight in-process event bus. Publishing never blocks and never fails
/// because nobody is listening.
pub struct InProcEventBus {
    sender: broadcast::Sender<EventEnvelope>,
    capacity: usize,
}

impl fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher for InProcEventBus {
    async fn publish(&self, envelope: EventEnvelope) -> Result<()> {
        let _ = self.sender.send(envelope);
        Ok(())
    }
}

/// Lets runtimes subscribe without naming the concrete bus type.
pub trait EventStream {
    fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope>;
}

impl EventStream for InProcEventBus {
    fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.subscribe()
    }
}
