//! Core data model definitions shared across fleetflow crates.
//!
//! Everything in here is plain serde data: the persisted shape of flows,
//! hunts, agent messages and output-plugin state. Behaviour lives in
//! `fleetflow-core`.
#![allow(missing_docs)]

pub mod error;
pub mod flow;
pub mod hunt;
pub mod ids;
pub mod output;

pub use error::{ModelError, Result as ModelResult};
pub use flow::{
    AgentRequest, AgentResponse, FlowError, FlowErrorCause, FlowLogEntry,
    FlowPriority, FlowRecord, FlowResult, FlowRunnerArgs, FlowStatus,
    InboxEntry, RequestKind, RequestPayload, RequestRecord, ResponseStatus,
};
pub use hunt::{
    ClientSelectionRule, HuntCounters, HuntRateLimit, HuntRecord, HuntSkip,
    HuntStatus, SpawnState, SpawnedFlow,
};
pub use ids::{ClientId, FlowId, HuntId, LeaseId, RequestId};
pub use output::{OutputPluginDescriptor, OutputPluginState, PluginLogEntry};
