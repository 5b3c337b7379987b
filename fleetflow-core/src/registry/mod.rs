//! Flow types and the process-wide registry that resolves them by name.
//!
//! A flow type is plain data: an argument schema plus a table of named state
//! handlers. The registry is built once at startup and is read-only after
//! that.

pub mod schema;

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use fleetflow_model::AgentResponse;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::flow::context::{FlowContext, HandlerResult, StateHandler};

pub use schema::{ArgKind, ArgSchema, ArgSpec};

pub const DEFAULT_START_STATE: &str = "Start";

pub struct FlowType {
    name: String,
    category: String,
    description: String,
    schema: ArgSchema,
    start_state: String,
    states: HashMap<String, Arc<dyn StateHandler>>,
}

impl fmt::Debug for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut states: Vec<&String> = self.states.keys().collect();
        states.sort();
        f.debug_struct("FlowType")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("start_state", &self.start_state)
            .field("states", &states)
            .finish()
    }
}

impl FlowType {
    pub fn builder(name: impl Into<String>) -> FlowTypeBuilder {
        FlowTypeBuilder {
            name: name.into(),
            category: String::new(),
            description: String::new(),
            schema: ArgSchema::default(),
            start_state: DEFAULT_START_STATE.to_string(),
            states: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn schema(&self) -> &ArgSchema {
        &self.schema
    }

    pub fn start_state(&self) -> &str {
        &self.start_state
    }

    pub fn handler(&self, state: &str) -> Option<&Arc<dyn StateHandler>> {
        self.states.get(state)
    }

    pub fn has_state(&self, state: &str) -> bool {
        self.states.contains_key(state)
    }

    pub fn descriptor(&self) -> FlowDescriptor {
        FlowDescriptor {
            name: self.name.clone(),
            category: self.category.clone(),
            description: self.description.clone(),
            args: self.schema.specs().to_vec(),
        }
    }
}

pub struct FlowTypeBuilder {
    name: String,
    category: String,
    description: String,
    schema: ArgSchema,
    start_state: String,
    states: HashMap<String, Arc<dyn StateHandler>>,
}

impl fmt::Debug for FlowTypeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowTypeBuilder")
            .field("name", &self.name)
            .field("states", &self.states.len())
            .finish()
    }
}

impl FlowTypeBuilder {
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn schema(mut self, schema: ArgSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn start_state(mut self, state: impl Into<String>) -> Self {
        self.start_state = state.into();
        self
    }

    /// Registers a closure handler. The bound is spelled out here so closure
    /// parameter lifetimes are inferred as higher-ranked.
    pub fn state<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut FlowContext, Option<&AgentResponse>) -> HandlerResult
            + Send
            + Sync
            + 'static,
    {
        self.handler(name, handler)
    }

    pub fn handler(
        mut self,
        name: impl Into<String>,
        handler: impl StateHandler + 'static,
    ) -> Self {
        self.states.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<FlowType> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "flow type name must not be empty".into(),
            ));
        }
        if !self.states.contains_key(&self.start_state) {
            return Err(OrchestratorError::InvalidArgument(format!(
                "flow type {} has no start state {:?}",
                self.name, self.start_state
            )));
        }
        Ok(FlowType {
            name: self.name,
            category: self.category,
            description: self.description,
            schema: self.schema,
            start_state: self.start_state,
            states: self.states,
        })
    }
}

/// Caller-facing summary of a registered flow type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowDescriptor {
    pub name: String,
    pub category: String,
    pub description: String,
    pub args: Vec<ArgSpec>,
}

#[derive(Debug, Default)]
pub struct FlowRegistry {
    types: BTreeMap<String, Arc<FlowType>>,
}

impl FlowRegistry {
    pub fn builder() -> FlowRegistryBuilder {
        FlowRegistryBuilder::default()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<FlowType>> {
        self.types.get(name).cloned().ok_or_else(|| {
            OrchestratorError::InvalidArgument(format!(
                "unknown flow type {name:?}"
            ))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Descriptors sorted by name, optionally narrowed to one category.
    pub fn descriptors(&self, category: Option<&str>) -> Vec<FlowDescriptor> {
        self.types
            .values()
            .filter(|ty| category.is_none_or(|c| ty.category() == c))
            .map(|ty| ty.descriptor())
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct FlowRegistryBuilder {
    types: BTreeMap<String, Arc<FlowType>>,
}

impl FlowRegistryBuilder {
    pub fn register(mut self, flow_type: FlowType) -> Result<Self> {
        let name = flow_type.name().to_string();
        if self.types.contains_key(&name) {
            return Err(OrchestratorError::InvalidArgument(format!(
                "flow type {name:?} registered twice"
            )));
        }
        self.types.insert(name, Arc::new(flow_type));
        Ok(self)
    }

    pub fn build(self) -> FlowRegistry {
        FlowRegistry { types: self.types }
    }
}
