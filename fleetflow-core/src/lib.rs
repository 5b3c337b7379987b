//! Workflow orchestration for a fleet of remote agents.
//!
//! A [`flow::FlowEngine`] runs resumable per-client state machines whose
//! progress lives entirely in an [`store::ObjectStore`]. A
//! [`hunt::HuntEngine`] fans one flow type out over many clients under rate
//! limits, and the [`throttle::Throttle`] suppresses duplicate launches.
//! [`api::Orchestrator`] wires the pieces together for callers.
#![allow(missing_docs)]

pub mod api;
pub mod channel;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod flow;
pub mod hashing;
pub mod hunt;
pub mod output;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod throttle;

pub use api::{Orchestrator, OrchestratorBuilder};
pub use channel::{InMemoryChannel, MessageChannel};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use events::{EventEnvelope, EventPublisher, InProcEventBus, OrchestratorEvent};
pub use flow::{
    Delivery, FlowEngine, FlowObserver, ProcessOutcome,
    context::{FlowContext, FlowLogicError, HandlerResult, StateHandler},
};
pub use hunt::{
    CreateHuntRequest, HuntEngine, TickReport,
    selection::{ClientDirectory, InMemoryClientDirectory},
};
pub use output::{
    OutputPluginRegistry, OutputSink, SinkContext, SinkError,
};
pub use registry::{
    ArgKind, ArgSchema, ArgSpec, FlowDescriptor, FlowRegistry, FlowType,
};
pub use runtime::OrchestratorRuntime;
pub use scheduler::FlowScheduler;
pub use store::{InMemoryObjectStore, JsonStore, ObjectStore};
