//! Ready queue plus the worker and poller loops that feed and drain it.

use std::{
    collections::{HashSet, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

use fleetflow_model::FlowId;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::{
    channel::MessageChannel,
    config::SchedulerConfig,
    error::Result,
    flow::{Delivery, FlowEngine, ProcessOutcome},
};

const TARGET: &str = "fleetflow::scheduler";

#[derive(Default)]
struct QueueState {
    order: VecDeque<FlowId>,
    queued: HashSet<FlowId>,
}

/// FIFO of flows with work waiting. A flow is queued at most once.
#[derive(Default)]
pub struct ReadyQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl fmt::Debug for ReadyQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ReadyQueue");
        match self.state.try_lock() {
            Ok(state) => debug.field("queued", &state.order.len()),
            Err(_) => debug.field("queued", &"<locked>"),
        };
        debug.finish()
    }
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the flow was already queued.
    pub async fn push(&self, flow_id: FlowId) -> bool {
        let mut state = self.state.lock().await;
        if !state.queued.insert(flow_id) {
            return false;
        }
        state.order.push_back(flow_id);
        drop(state);
        self.notify.notify_one();
        true
    }

    pub async fn pop(&self) -> Option<FlowId> {
        let mut state = self.state.lock().await;
        let flow_id = state.order.pop_front()?;
        state.queued.remove(&flow_id);
        Some(flow_id)
    }

    /// Waits for the next flow; `None` once `shutdown` fires.
    pub async fn next(&self, shutdown: &CancellationToken) -> Option<FlowId> {
        loop {
            if let Some(flow_id) = self.pop().await {
                return Some(flow_id);
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

pub struct FlowScheduler {
    engine: Arc<FlowEngine>,
    channel: Arc<dyn MessageChannel>,
    queue: Arc<ReadyQueue>,
    config: SchedulerConfig,
    worker_group: String,
}

impl fmt::Debug for FlowScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowScheduler")
            .field("worker_group", &self.worker_group)
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish()
    }
}

impl FlowScheduler {
    pub fn new(
        engine: Arc<FlowEngine>,
        channel: Arc<dyn MessageChannel>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            engine,
            channel,
            queue: Arc::new(ReadyQueue::new()),
            config,
            worker_group: format!("flows-{}", std::process::id()),
        }
    }

    pub fn queue(&self) -> Arc<ReadyQueue> {
        Arc::clone(&self.queue)
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    pub fn worker_id(&self, index: usize) -> String {
        format!("{}-w{}", self.worker_group, index)
    }

    pub async fn enqueue(&self, flow_id: FlowId) -> bool {
        self.queue.push(flow_id).await
    }

    /// Pulls one batch from the channel into flow inboxes and queues every
    /// flow that gained work. Returns the number of responses polled.
    pub async fn pump_once(&self) -> Result<usize> {
        let responses = self.channel.poll(self.config.poll_batch_size).await?;
        let polled = responses.len();
        for response in responses {
            let flow_id = response.session_id;
            let request_id = response.request_id;
            match self.engine.deliver(response).await {
                Ok(Delivery::Accepted) => {
                    self.queue.push(flow_id).await;
                }
                Ok(outcome) => tracing::debug!(
                    target: TARGET,
                    flow_id = %flow_id,
                    request_id = %request_id,
                    outcome = ?outcome,
                    "response not queued"
                ),
                Err(err) => tracing::warn!(
                    target: TARGET,
                    flow_id = %flow_id,
                    request_id = %request_id,
                    error = %err,
                    "response delivery failed"
                ),
            }
        }
        Ok(polled)
    }

    /// Runs one transition batch for `flow_id` and re-queues it when work
    /// remains or the lease was busy.
    pub async fn drive(&self, flow_id: FlowId, worker_id: &str) -> Result<ProcessOutcome> {
        let outcome = self.engine.process_as(flow_id, worker_id).await?;
        match outcome {
            ProcessOutcome::LeaseBusy => {
                tracing::trace!(
                    target: TARGET,
                    flow_id = %flow_id,
                    worker = worker_id,
                    "flow lease busy; requeueing"
                );
                tokio::time::sleep(Duration::from_millis(self.config.busy_backoff_ms))
                    .await;
                self.queue.push(flow_id).await;
            }
            ProcessOutcome::Advanced {
                more_work: true, ..
            } => {
                self.queue.push(flow_id).await;
            }
            ProcessOutcome::Advanced { .. } | ProcessOutcome::Idle => {}
        }
        Ok(outcome)
    }

    pub async fn run_worker(&self, index: usize, shutdown: CancellationToken) {
        let worker_id = self.worker_id(index);
        tracing::debug!(target: TARGET, worker = %worker_id, "worker started");
        while let Some(flow_id) = self.queue.next(&shutdown).await {
            if let Err(err) = self.drive(flow_id, &worker_id).await {
                tracing::warn!(
                    target: TARGET,
                    worker = %worker_id,
                    flow_id = %flow_id,
                    error = %err,
                    "flow transition failed"
                );
            }
        }
        tracing::info!(target: TARGET, worker = %worker_id, "worker shutting down");
    }

    pub async fn run_poller(&self, shutdown: CancellationToken) {
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            let polled = match self.pump_once().await {
                Ok(polled) => polled,
                Err(err) => {
                    tracing::warn!(target: TARGET, error = %err, "channel poll failed");
                    0
                }
            };
            // Full batches usually mean more is waiting.
            if polled >= self.config.poll_batch_size && !shutdown.is_cancelled() {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!(target: TARGET, "poller shutting down");
    }

    /// Polls and drives on the calling task until neither the channel nor the
    /// queue has anything left. Returns the number of transitions run; a flow
    /// whose transition fails is logged and left for housekeeping.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let worker_id = self.worker_id(0);
        let mut handled = 0;
        loop {
            let polled = self.pump_once().await?;
            let mut drove = false;
            while let Some(flow_id) = self.queue.pop().await {
                drove = true;
                match self.drive(flow_id, &worker_id).await {
                    Ok(ProcessOutcome::Advanced { handled: n, .. }) => handled += n,
                    Ok(_) => {}
                    Err(err) => tracing::warn!(
                        target: TARGET,
                        worker = %worker_id,
                        flow_id = %flow_id,
                        error = %err,
                        "flow transition failed"
                    ),
                }
            }
            if polled == 0 && !drove {
                return Ok(handled);
            }
        }
    }
}
