//! Duplicate-launch suppression keyed by client and flow fingerprint.

use chrono::{DateTime, Utc};
use fleetflow_model::{ClientId, FlowId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    clock::SharedClock,
    config::ThrottleConfig,
    error::{OrchestratorError, Result},
    hashing::flow_fingerprint,
    store::{JsonStore, Update, keys},
};

const TARGET: &str = "fleetflow::throttle";

/// Last launch of one fingerprint against one client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThrottleRecord {
    pub flow_name: String,
    pub fingerprint: String,
    pub last_launch: DateTime<Utc>,
    pub flow_id: FlowId,
    /// The launch that wrote this record never produced a flow.
    #[serde(default)]
    pub rolled_back: bool,
}

#[derive(Clone, Debug)]
pub struct Throttle {
    store: JsonStore,
    clock: SharedClock,
    config: ThrottleConfig,
}

impl Throttle {
    pub fn new(store: JsonStore, clock: SharedClock, config: ThrottleConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Atomically checks and records a launch of `flow_id`. Fails with
    /// [`OrchestratorError::DuplicateFlow`] when the same fingerprint was
    /// launched on `client` within the window.
    ///
    /// `args` must already be normalized by the flow type's schema.
    pub async fn check(
        &self,
        client: &ClientId,
        flow_name: &str,
        args: &Value,
        flow_id: FlowId,
    ) -> Result<()> {
        let Some(window) = self.config.window() else {
            return Ok(());
        };
        let fingerprint = flow_fingerprint(flow_name, args);
        let key = keys::throttle(client, &fingerprint);

        let mut attempt = 0u16;
        loop {
            attempt += 1;
            let now = self.clock.now();
            let current = self.store.load::<ThrottleRecord>(&key).await?;

            if let Some(existing) = &current
                && !existing.value.rolled_back
                && now - existing.value.last_launch < window
            {
                tracing::debug!(
                    target: TARGET,
                    client_id = %client,
                    flow = flow_name,
                    previous = %existing.value.flow_id,
                    "rejecting duplicate launch"
                );
                return Err(OrchestratorError::DuplicateFlow(format!(
                    "identical {flow_name} flow {} started on {client} at {}",
                    existing.value.flow_id, existing.value.last_launch
                )));
            }

            let record = ThrottleRecord {
                flow_name: flow_name.to_string(),
                fingerprint: fingerprint.clone(),
                last_launch: now,
                flow_id,
                rolled_back: false,
            };
            match self
                .store
                .write(&key, &record, current.map(|v| v.version))
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) if err.is_version_conflict() => {
                    self.store.backoff(&key, attempt).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Withdraws the launch `check` recorded for `flow_id` after that launch
    /// failed before its flow existed. A newer launch is left alone.
    pub async fn rollback(
        &self,
        client: &ClientId,
        flow_name: &str,
        args: &Value,
        flow_id: FlowId,
    ) -> Result<()> {
        if self.config.window().is_none() {
            return Ok(());
        }
        let key = keys::throttle(client, &flow_fingerprint(flow_name, args));
        self.store
            .update(&key, |current: Option<ThrottleRecord>| {
                Ok(match current {
                    Some(mut record) if record.flow_id == flow_id && !record.rolled_back => {
                        record.rolled_back = true;
                        Update::Write(record, ())
                    }
                    _ => Update::Skip(()),
                })
            })
            .await?;
        tracing::debug!(
            target: TARGET,
            client_id = %client,
            flow = flow_name,
            flow_id = %flow_id,
            "launch rolled back"
        );
        Ok(())
    }

    pub async fn last_launch(
        &self,
        client: &ClientId,
        flow_name: &str,
        args: &Value,
    ) -> Result<Option<ThrottleRecord>> {
        let key = keys::throttle(client, &flow_fingerprint(flow_name, args));
        Ok(self.store.load(&key).await?.map(|v| v.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, config::RetryConfig, store::InMemoryObjectStore};
    use serde_json::json;
    use std::sync::Arc;

    fn throttle(clock: &ManualClock, secs: i64) -> Throttle {
        Throttle::new(
            JsonStore::new(
                Arc::new(InMemoryObjectStore::new()),
                RetryConfig::default(),
            ),
            Arc::new(clock.clone()),
            ThrottleConfig {
                dup_interval_secs: secs,
            },
        )
    }

    #[tokio::test]
    async fn disabled_window_never_rejects() -> Result<()> {
        let clock = ManualClock::default();
        let throttle = throttle(&clock, 0);
        let client = ClientId::from_index(1);
        for _ in 0..3 {
            throttle
                .check(&client, "Echo", &json!({}), FlowId::new())
                .await?;
        }
        assert!(throttle.last_launch(&client, "Echo", &json!({})).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn rolled_back_launch_does_not_block() -> Result<()> {
        let clock = ManualClock::default();
        let throttle = throttle(&clock, 600);
        let client = ClientId::from_index(1);
        let args = json!({ "path": "/tmp" });
        let failed = FlowId::new();
        throttle.check(&client, "Glob", &args, failed).await?;

        // Someone else's id does not undo the record.
        throttle.rollback(&client, "Glob", &args, FlowId::new()).await?;
        assert!(throttle
            .check(&client, "Glob", &args, FlowId::new())
            .await
            .is_err());

        throttle.rollback(&client, "Glob", &args, failed).await?;
        let retry = FlowId::new();
        throttle.check(&client, "Glob", &args, retry).await?;
        let record = throttle
            .last_launch(&client, "Glob", &args)
            .await?
            .expect("recorded");
        assert_eq!(record.flow_id, retry);
        assert!(!record.rolled_back);
        Ok(())
    }

    #[tokio::test]
    async fn different_args_are_independent() -> Result<()> {
        let clock = ManualClock::default();
        let throttle = throttle(&clock, 60);
        let client = ClientId::from_index(1);
        throttle
            .check(&client, "Glob", &json!({"path": "/a"}), FlowId::new())
            .await?;
        throttle
            .check(&client, "Glob", &json!({"path": "/b"}), FlowId::new())
            .await?;
        throttle
            .check(&ClientId::from_index(2), "Glob", &json!({"path": "/a"}), FlowId::new())
            .await?;
        Ok(())
    }
}
