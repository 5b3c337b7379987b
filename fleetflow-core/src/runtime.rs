//! Background task supervision for a single orchestrator process.

use std::{fmt, sync::Arc, time::Duration};

use tokio::{
    sync::{Mutex, broadcast::error::RecvError},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::OrchestratorConfig,
    error::Result,
    events::{EventStream, OrchestratorEvent},
    flow::FlowEngine,
    hunt::HuntEngine,
    scheduler::FlowScheduler,
};

const TARGET: &str = "fleetflow::runtime";

/// Owns the poller, the worker pool, the hunt ticker and the housekeeper.
/// All of them stop when [`OrchestratorRuntime::shutdown`] cancels the
/// shared token.
pub struct OrchestratorRuntime {
    config: OrchestratorConfig,
    flows: Arc<FlowEngine>,
    hunts: Arc<HuntEngine>,
    scheduler: Arc<FlowScheduler>,
    events: Arc<dyn EventStream + Send + Sync>,
    shutdown_token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for OrchestratorRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handle_count = self
            .handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();
        f.debug_struct("OrchestratorRuntime")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .field("handle_count", &handle_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl OrchestratorRuntime {
    pub fn new(
        config: OrchestratorConfig,
        flows: Arc<FlowEngine>,
        hunts: Arc<HuntEngine>,
        scheduler: Arc<FlowScheduler>,
        events: Arc<dyn EventStream + Send + Sync>,
    ) -> Self {
        Self {
            config,
            flows,
            hunts,
            scheduler,
            events,
            shutdown_token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn scheduler(&self) -> Arc<FlowScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown_token.is_cancelled()
    }

    pub async fn start(&self) -> Result<()> {
        let mut handles = self.handles.lock().await;

        let scheduler = self.scheduler();
        let shutdown = self.shutdown_token.clone();
        handles.push(tokio::spawn(async move {
            scheduler.run_poller(shutdown).await;
        }));

        for index in 0..self.config.scheduler.workers.max(1) {
            let scheduler = self.scheduler();
            let shutdown = self.shutdown_token.clone();
            handles.push(tokio::spawn(async move {
                scheduler.run_worker(index, shutdown).await;
            }));
        }

        handles.push(self.spawn_hunt_ticker());
        handles.push(self.spawn_housekeeper());

        tracing::info!(
            target: TARGET,
            workers = self.config.scheduler.workers.max(1),
            "orchestrator runtime started"
        );
        Ok(())
    }

    fn spawn_hunt_ticker(&self) -> JoinHandle<()> {
        let hunts = Arc::clone(&self.hunts);
        let mut events = self.events.subscribe_events();
        let interval = Duration::from_millis(self.config.hunts.tick_interval_ms.max(1));
        let shutdown = self.shutdown_token.clone();
        tokio::spawn(async move {
            let mut listening = true;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = hunts.tick_all().await {
                            tracing::warn!(target: TARGET, error = %err, "hunt tick failed");
                        }
                    }
                    received = events.recv(), if listening => match received {
                        Ok(envelope) => {
                            // A finished hunt flow frees a slot; expand now
                            // rather than on the next interval.
                            if let OrchestratorEvent::FlowFinished {
                                hunt_id: Some(hunt_id),
                                ..
                            } = envelope.event
                                && let Err(err) = hunts.tick(hunt_id).await
                            {
                                tracing::warn!(
                                    target: TARGET,
                                    hunt_id = %hunt_id,
                                    error = %err,
                                    "hunt tick failed"
                                );
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                target: TARGET,
                                skipped,
                                "hunt ticker lagged behind the event bus"
                            );
                        }
                        Err(RecvError::Closed) => {
                            tracing::info!(
                                target: TARGET,
                                "event bus closed; hunt ticker falls back to interval"
                            );
                            listening = false;
                        }
                    },
                }
            }
            tracing::info!(target: TARGET, "hunt ticker shutting down");
        })
    }

    fn spawn_housekeeper(&self) -> JoinHandle<()> {
        let flows = Arc::clone(&self.flows);
        let scheduler = self.scheduler();
        let interval = Duration::from_millis(self.config.lease.housekeeper_interval_ms.max(1));
        let shutdown = self.shutdown_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match flows.housekeep().await {
                            Ok(report) => {
                                for flow_id in &report.ready {
                                    scheduler.enqueue(*flow_id).await;
                                }
                                if !report.expired.is_empty() || !report.finalized.is_empty() {
                                    tracing::info!(
                                        target: TARGET,
                                        expired = report.expired.len(),
                                        finalized = report.finalized.len(),
                                        requeued = report.ready.len(),
                                        "housekeeping pass"
                                    );
                                }
                            }
                            Err(err) => {
                                tracing::warn!(target: TARGET, error = %err, "housekeeping failed");
                            }
                        }
                    }
                }
            }
            tracing::info!(target: TARGET, "housekeeper shutting down");
        })
    }

    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!(target: TARGET, "initiating orchestrator shutdown");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(target: TARGET, "task failed: {:?}", e),
                Err(_) => tracing::warn!(target: TARGET, "task timed out during shutdown"),
            }
        }

        tracing::info!(target: TARGET, "orchestrator shutdown complete");
        Ok(())
    }
}
