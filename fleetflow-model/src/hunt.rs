use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::ModelError,
    flow::FlowPriority,
    ids::{ClientId, FlowId, HuntId},
    output::OutputPluginDescriptor,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HuntStatus {
    Started,
    Paused,
    Stopped,
    Completed,
}

impl HuntStatus {
    pub fn is_expanding(&self) -> bool {
        matches!(self, HuntStatus::Started)
    }

    pub fn transition_to(self, next: HuntStatus) -> Result<HuntStatus, ModelError> {
        use HuntStatus::*;
        let allowed = match (self, next) {
            (from, to) if from == to => true,
            (Started, Paused | Stopped | Completed) => true,
            (Paused, Started | Stopped | Completed) => true,
            (Stopped, Completed) => true,
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(ModelError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for HuntStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HuntStatus::Started => "STARTED",
            HuntStatus::Paused => "PAUSED",
            HuntStatus::Stopped => "STOPPED",
            HuntStatus::Completed => "COMPLETED",
        };
        f.write_str(label)
    }
}

/// Which clients a hunt targets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientSelectionRule {
    /// Fixed list, enumerated in the given order.
    Explicit { clients: Vec<ClientId> },
    /// Every client carrying all of the labels. Grows as clients join.
    Labels { all_of: Vec<String> },
    All,
}

impl ClientSelectionRule {
    pub fn is_finite(&self) -> bool {
        matches!(self, ClientSelectionRule::Explicit { .. })
    }
}

/// Per-hunt launch limits. `None` leaves that dimension unbounded.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HuntRateLimit {
    pub max_new_per_interval: Option<u32>,
    pub interval_secs: i64,
    pub max_concurrent: Option<u32>,
}

impl HuntRateLimit {
    pub fn concurrent(max_concurrent: u32) -> Self {
        Self {
            max_concurrent: Some(max_concurrent),
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpawnState {
    Running,
    Completed,
    Errored,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpawnedFlow {
    pub flow_id: FlowId,
    pub state: SpawnState,
    pub spawned_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HuntSkip {
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HuntCounters {
    pub running: u64,
    pub completed: u64,
    pub errored: u64,
    pub skipped: u64,
}

impl HuntCounters {
    pub fn finished(&self) -> u64 {
        self.completed + self.errored
    }

    pub fn error_fraction(&self) -> f64 {
        match self.finished() {
            0 => 0.0,
            finished => self.errored as f64 / finished as f64,
        }
    }
}

/// Persisted state of one hunt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HuntRecord {
    pub id: HuntId,
    pub flow_name: String,
    pub args: Value,
    pub selection: ClientSelectionRule,
    pub rate_limit: HuntRateLimit,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default)]
    pub output_plugins: Vec<OutputPluginDescriptor>,
    #[serde(default)]
    pub priority: FlowPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub max_error_fraction: f64,
    pub status: HuntStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub spawned: BTreeMap<ClientId, SpawnedFlow>,
    #[serde(default)]
    pub skipped: BTreeMap<ClientId, HuntSkip>,
    #[serde(default)]
    pub counters: HuntCounters,
    pub window_started_at: DateTime<Utc>,
    #[serde(default)]
    pub launched_in_window: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HuntRecord {
    /// A client is handled once it has either a flow or a skip entry.
    pub fn has_handled(&self, client: &ClientId) -> bool {
        self.spawned.contains_key(client) || self.skipped.contains_key(client)
    }

    pub fn handled_count(&self) -> u64 {
        (self.spawned.len() + self.skipped.len()) as u64
    }

    pub fn running_flows(&self) -> impl Iterator<Item = (&ClientId, &SpawnedFlow)> {
        self.spawned
            .iter()
            .filter(|(_, spawned)| spawned.state == SpawnState::Running)
    }

    pub fn client_limit_reached(&self) -> bool {
        self.client_limit
            .is_some_and(|limit| self.spawned.len() as u64 >= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_hunts_stay_completed() {
        assert!(HuntStatus::Completed
            .transition_to(HuntStatus::Started)
            .is_err());
        assert!(HuntStatus::Stopped
            .transition_to(HuntStatus::Started)
            .is_err());
        assert_eq!(
            HuntStatus::Paused.transition_to(HuntStatus::Started),
            Ok(HuntStatus::Started)
        );
    }

    #[test]
    fn error_fraction_ignores_running_flows() {
        let counters = HuntCounters {
            running: 5,
            completed: 3,
            errored: 1,
            skipped: 2,
        };
        assert!((counters.error_fraction() - 0.25).abs() < f64::EPSILON);
        assert_eq!(HuntCounters::default().error_fraction(), 0.0);
    }

    #[test]
    fn selection_rule_is_tagged() {
        let rule: ClientSelectionRule = serde_json::from_value(
            serde_json::json!({"kind": "labels", "all_of": ["linux"]}),
        )
        .expect("decode");
        assert_eq!(
            rule,
            ClientSelectionRule::Labels {
                all_of: vec!["linux".into()]
            }
        );
        assert!(!rule.is_finite());
    }
}
