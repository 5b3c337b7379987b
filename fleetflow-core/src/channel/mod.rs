//! Transport contract between the orchestrator and remote agents.
//!
//! Delivery is at-least-once in both directions. The engine tolerates
//! duplicate and stale responses, so a channel never has to de-duplicate.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use fleetflow_model::{AgentRequest, AgentResponse};

use crate::error::Result;

pub use memory::InMemoryChannel;

#[async_trait]
pub trait MessageChannel: Send + Sync + fmt::Debug {
    /// Enqueue a request for delivery to `request.client_id`.
    async fn send(&self, request: AgentRequest) -> Result<()>;

    /// Drain up to `max` responses that arrived since the last poll.
    async fn poll(&self, max: usize) -> Result<Vec<AgentResponse>>;
}
