use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
    error::ModelError,
    ids::{ClientId, FlowId, HuntId, RequestId},
    output::OutputPluginDescriptor,
};

/// Lifecycle of a flow. `Running` is the only non-terminal status.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Running,
    Error,
    Terminated,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FlowStatus::Running)
    }

    /// Status only ever moves out of `Running`, never back into it.
    pub fn transition_to(self, next: FlowStatus) -> Result<FlowStatus, ModelError> {
        match (self, next) {
            (FlowStatus::Running, _) => Ok(next),
            (from, to) if from == to => Ok(to),
            (from, to) => Err(ModelError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowStatus::Running => write!(f, "RUNNING"),
            FlowStatus::Error => write!(f, "ERROR"),
            FlowStatus::Terminated => write!(f, "TERMINATED"),
        }
    }
}

#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowPriority {
    LowPriority,
    #[default]
    MediumPriority,
    HighPriority,
}

/// Caller-supplied knobs that shape how a flow runs, independent of the flow
/// type's own arguments.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowRunnerArgs {
    pub priority: FlowPriority,
    pub output_plugins: Vec<OutputPluginDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hunt_id: Option<HuntId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    /// Overrides the engine-wide request TTL for this flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_ttl_secs: Option<i64>,
}

/// What a request asks the agent (or the engine itself) to do.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub action: String,
    #[serde(default)]
    pub args: Value,
}

impl RequestPayload {
    pub fn new(action: impl Into<String>, args: Value) -> Self {
        Self {
            action: action.into(),
            args,
        }
    }
}

/// Remote requests travel over the message channel; local ones are answered
/// by the engine on the next transition round.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Client,
    Local,
}

/// An outstanding request and the state that resumes when it is answered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: RequestId,
    pub next_state: String,
    pub kind: RequestKind,
    pub payload: RequestPayload,
    pub issued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

/// Message handed to the transport for delivery to an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub client_id: ClientId,
    pub session_id: FlowId,
    pub request_id: RequestId,
    pub payload: RequestPayload,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Ok,
    Error { message: String },
}

/// Agent reply correlated to exactly one request by `(session_id, request_id)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub session_id: FlowId,
    pub request_id: RequestId,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl AgentResponse {
    pub fn ok(request: &AgentRequest, payload: Value) -> Self {
        Self {
            session_id: request.session_id,
            request_id: request.request_id,
            status: ResponseStatus::Ok,
            payload: Some(payload),
        }
    }

    pub fn error(request: &AgentRequest, message: impl Into<String>) -> Self {
        Self {
            session_id: request.session_id,
            request_id: request.request_id,
            status: ResponseStatus::Error {
                message: message.into(),
            },
            payload: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, ResponseStatus::Ok)
    }
}

/// A response parked in a flow's inbox until a worker picks it up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboxEntry {
    pub response: AgentResponse,
    pub received_at: DateTime<Utc>,
    pub arrival: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowErrorCause {
    FlowLogic,
    ClientUnresponsive,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowError {
    pub cause: FlowErrorCause,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowLogEntry {
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub message: String,
}

/// Persisted state of one flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub id: FlowId,
    pub client_id: ClientId,
    pub flow_name: String,
    pub args: Value,
    pub runner_args: FlowRunnerArgs,
    pub status: FlowStatus,
    /// Terminal status already decided but held back until output plugins
    /// have seen every result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_status: Option<FlowStatus>,
    /// Last state handler that ran.
    pub current_state: String,
    pub outstanding: BTreeMap<RequestId, RequestRecord>,
    pub next_request_id: RequestId,
    #[serde(default)]
    pub scratch: Map<String, Value>,
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
    /// Number of committed entries in the result stream.
    pub result_count: u64,
    /// Batch id of each committed result write, keyed by its first sequence
    /// number. Entries written under any other batch id are unreachable.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub result_batches: BTreeMap<u64, Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FlowError>,
    #[serde(default)]
    pub logs: Vec<FlowLogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowRecord {
    pub fn hunt_id(&self) -> Option<HuntId> {
        self.runner_args.hunt_id
    }

    pub fn is_running(&self) -> bool {
        self.status == FlowStatus::Running
    }

    /// Running and still able to take new transitions.
    pub fn is_active(&self) -> bool {
        self.is_running() && self.pending_status.is_none()
    }

    /// Batch that holds committed result `seq`.
    pub fn result_batch(&self, seq: u64) -> Option<Uuid> {
        if seq >= self.result_count {
            return None;
        }
        self.result_batches
            .range(..=seq)
            .next_back()
            .map(|(_, batch)| *batch)
    }

    pub fn outstanding_client_requests(
        &self,
    ) -> impl Iterator<Item = &RequestRecord> {
        self.outstanding
            .values()
            .filter(|request| request.kind == RequestKind::Client)
    }
}

/// One entry in a flow's output stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowResult {
    pub flow_id: FlowId,
    pub client_id: ClientId,
    pub seq: u64,
    pub source_state: String,
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_never_moves_backward() {
        assert_eq!(
            FlowStatus::Running.transition_to(FlowStatus::Error),
            Ok(FlowStatus::Error)
        );
        assert!(FlowStatus::Terminated
            .transition_to(FlowStatus::Running)
            .is_err());
        assert!(FlowStatus::Error
            .transition_to(FlowStatus::Terminated)
            .is_err());
        assert_eq!(
            FlowStatus::Error.transition_to(FlowStatus::Error),
            Ok(FlowStatus::Error)
        );
    }

    #[test]
    fn response_status_uses_tagged_encoding() {
        let encoded = serde_json::to_value(ResponseStatus::Error {
            message: "boom".into(),
        })
        .expect("encode");
        assert_eq!(
            encoded,
            serde_json::json!({"status": "ERROR", "message": "boom"})
        );
    }

    #[test]
    fn result_batch_covers_committed_range() {
        let now = Utc::now();
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        let record = FlowRecord {
            id: FlowId::new(),
            client_id: ClientId::from_index(1),
            flow_name: "Echo".into(),
            args: Value::Null,
            runner_args: FlowRunnerArgs::default(),
            status: FlowStatus::Running,
            pending_status: None,
            current_state: "Start".into(),
            outstanding: BTreeMap::new(),
            next_request_id: RequestId::FIRST,
            scratch: Map::new(),
            counters: BTreeMap::new(),
            result_count: 4,
            result_batches: BTreeMap::from([(0, first), (3, second)]),
            error: None,
            logs: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        assert_eq!(record.result_batch(0), Some(first));
        assert_eq!(record.result_batch(2), Some(first));
        assert_eq!(record.result_batch(3), Some(second));
        assert_eq!(record.result_batch(4), None);
    }
}
