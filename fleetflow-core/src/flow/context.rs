//! What a state handler sees and can do during one transition.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use fleetflow_model::{AgentResponse, ClientId, FlowId, RequestKind, RequestPayload};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use thiserror::Error;

/// Handler-raised failure. Scoped to the flow that raised it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct FlowLogicError {
    pub message: String,
}

impl FlowLogicError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for FlowLogicError {
    fn from(err: serde_json::Error) -> Self {
        FlowLogicError::new(format!("serialization: {err}"))
    }
}

pub type HandlerResult = std::result::Result<(), FlowLogicError>;

/// A named state of a flow type.
///
/// `response` is `None` only for the start state.
pub trait StateHandler: Send + Sync {
    fn handle(
        &self,
        ctx: &mut FlowContext,
        response: Option<&AgentResponse>,
    ) -> HandlerResult;
}

impl<F> StateHandler for F
where
    F: Fn(&mut FlowContext, Option<&AgentResponse>) -> HandlerResult
        + Send
        + Sync,
{
    fn handle(
        &self,
        ctx: &mut FlowContext,
        response: Option<&AgentResponse>,
    ) -> HandlerResult {
        self(ctx, response)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct IssuedRequest {
    pub next_state: String,
    pub kind: RequestKind,
    pub payload: RequestPayload,
}

/// Working copy of a flow's mutable state. Nothing a handler does here is
/// visible until the engine commits the transition.
#[derive(Clone)]
pub struct FlowContext {
    flow_id: FlowId,
    client_id: ClientId,
    flow_name: String,
    state: String,
    now: DateTime<Utc>,
    args: Value,
    pub(crate) scratch: Map<String, Value>,
    pub(crate) counters: BTreeMap<String, u64>,
    pub(crate) issued: Vec<IssuedRequest>,
    pub(crate) results: Vec<Value>,
    pub(crate) logs: Vec<String>,
    pub(crate) terminate: bool,
}

impl fmt::Debug for FlowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowContext")
            .field("flow_id", &self.flow_id)
            .field("client_id", &self.client_id)
            .field("flow_name", &self.flow_name)
            .field("state", &self.state)
            .field("issued", &self.issued.len())
            .field("results", &self.results.len())
            .field("terminate", &self.terminate)
            .finish()
    }
}

impl FlowContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        flow_id: FlowId,
        client_id: ClientId,
        flow_name: String,
        state: String,
        now: DateTime<Utc>,
        args: Value,
        scratch: Map<String, Value>,
        counters: BTreeMap<String, u64>,
    ) -> Self {
        Self {
            flow_id,
            client_id,
            flow_name,
            state,
            now,
            args,
            scratch,
            counters,
            issued: Vec::new(),
            results: Vec::new(),
            logs: Vec::new(),
            terminate: false,
        }
    }

    pub fn flow_id(&self) -> FlowId {
        self.flow_id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    /// Name of the state currently running.
    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Validated arguments with schema defaults filled in.
    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn arg<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<T, FlowLogicError> {
        let raw = self.args.get(name).cloned().unwrap_or(Value::Null);
        serde_json::from_value(raw).map_err(|err| {
            FlowLogicError::new(format!("argument {name}: {err}"))
        })
    }

    pub fn args_as<T: DeserializeOwned>(&self) -> Result<T, FlowLogicError> {
        Ok(serde_json::from_value(self.args.clone())?)
    }

    /// Sends `action` to the flow's agent; `next_state` runs on the reply.
    pub fn call_client(
        &mut self,
        action: impl Into<String>,
        args: Value,
        next_state: impl Into<String>,
    ) {
        self.issued.push(IssuedRequest {
            next_state: next_state.into(),
            kind: RequestKind::Client,
            payload: RequestPayload::new(action, args),
        });
    }

    /// Schedules `next_state` locally. It receives an OK response carrying
    /// `payload`.
    pub fn call_state(&mut self, next_state: impl Into<String>, payload: Value) {
        let next_state = next_state.into();
        self.issued.push(IssuedRequest {
            payload: RequestPayload::new(next_state.clone(), payload),
            next_state,
            kind: RequestKind::Local,
        });
    }

    pub fn emit_result(&mut self, value: impl Serialize) -> HandlerResult {
        self.results.push(serde_json::to_value(value)?);
        Ok(())
    }

    pub fn terminate(&mut self) {
        self.terminate = true;
    }

    pub fn log(&mut self, message: impl Into<String>) {
        self.logs.push(message.into());
    }

    pub fn scratch<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.scratch
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn set_scratch(
        &mut self,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> HandlerResult {
        self.scratch.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn increment(&mut self, counter: &str, by: u64) -> u64 {
        let slot = self.counters.entry(counter.to_string()).or_default();
        *slot += by;
        *slot
    }

    pub fn counter(&self, counter: &str) -> u64 {
        self.counters.get(counter).copied().unwrap_or_default()
    }

    pub fn emitted(&self) -> usize {
        self.results.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> FlowContext {
        FlowContext::new(
            FlowId::new(),
            ClientId::from_index(1),
            "Echo".into(),
            "Start".into(),
            Utc::now(),
            json!({"count": 3}),
            Map::new(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn call_state_targets_local_request() {
        let mut ctx = context();
        ctx.call_state("SendSomething", json!("oh"));
        ctx.call_client("ping", json!({}), "Pong");
        assert_eq!(ctx.issued[0].kind, RequestKind::Local);
        assert_eq!(ctx.issued[0].next_state, "SendSomething");
        assert_eq!(ctx.issued[1].kind, RequestKind::Client);
        assert_eq!(ctx.issued[1].payload.action, "ping");
    }

    #[test]
    fn typed_access_to_args_scratch_and_counters() {
        let mut ctx = context();
        assert_eq!(ctx.arg::<u32>("count").expect("count"), 3);
        assert!(ctx.arg::<u32>("missing").is_err());
        ctx.set_scratch("seen", vec!["a"]).expect("scratch");
        assert_eq!(ctx.scratch::<Vec<String>>("seen"), Some(vec!["a".into()]));
        assert_eq!(ctx.increment("files", 2), 2);
        assert_eq!(ctx.increment("files", 1), 3);
        assert_eq!(ctx.counter("files"), 3);
    }
}
