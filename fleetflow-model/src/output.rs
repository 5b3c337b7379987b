use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::FlowId;

/// Requests that results of a flow be delivered to a registered plugin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputPluginDescriptor {
    pub plugin_name: String,
    #[serde(default)]
    pub args: Value,
}

impl OutputPluginDescriptor {
    pub fn new(plugin_name: impl Into<String>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            args: Value::Null,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// Instances are named after the plugin and their position on the flow,
    /// e.g. `EmailOutputPlugin_0`.
    pub fn instance_id(&self, index: usize) -> String {
        format!("{}_{}", self.plugin_name, index)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginLogEntry {
    pub at: DateTime<Utc>,
    pub flow_id: FlowId,
    pub message: String,
}

/// Persisted progress of one plugin instance attached to a flow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputPluginState {
    pub instance_id: String,
    pub descriptor: OutputPluginDescriptor,
    /// Sequence number of the next result this instance has not yet seen.
    pub cursor: u64,
    #[serde(default)]
    pub logs: Vec<PluginLogEntry>,
    #[serde(default)]
    pub errors: Vec<PluginLogEntry>,
}

impl OutputPluginState {
    pub fn new(instance_id: String, descriptor: OutputPluginDescriptor) -> Self {
        Self {
            instance_id,
            descriptor,
            cursor: 0,
            logs: Vec::new(),
            errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_ids_follow_plugin_position() {
        let descriptor = OutputPluginDescriptor::new("EmailOutputPlugin");
        assert_eq!(descriptor.instance_id(0), "EmailOutputPlugin_0");
        assert_eq!(descriptor.instance_id(2), "EmailOutputPlugin_2");
    }
}
