use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use fleetflow_model::{AgentRequest, AgentResponse, ClientId};
use tokio::sync::Mutex;

use super::MessageChannel;
use crate::error::Result;

#[derive(Debug, Default)]
struct ChannelState {
    outbound: BTreeMap<ClientId, VecDeque<AgentRequest>>,
    inbound: VecDeque<AgentResponse>,
}

/// Loopback channel: requests queue per client until someone plays the agent
/// and pushes responses back.
#[derive(Clone, Default)]
pub struct InMemoryChannel {
    state: Arc<Mutex<ChannelState>>,
}

impl fmt::Debug for InMemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryChannel");
        match self.state.try_lock() {
            Ok(state) => {
                let outbound: usize =
                    state.outbound.values().map(VecDeque::len).sum();
                debug
                    .field("outbound", &outbound)
                    .field("inbound", &state.inbound.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests waiting for `client`, oldest first.
    pub async fn take_requests(&self, client: &ClientId) -> Vec<AgentRequest> {
        let mut state = self.state.lock().await;
        state
            .outbound
            .remove(client)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub async fn take_all_requests(&self) -> Vec<AgentRequest> {
        let mut state = self.state.lock().await;
        std::mem::take(&mut state.outbound)
            .into_values()
            .flatten()
            .collect()
    }

    pub async fn pending_requests(&self) -> usize {
        let state = self.state.lock().await;
        state.outbound.values().map(VecDeque::len).sum()
    }

    pub async fn push_response(&self, response: AgentResponse) {
        let mut state = self.state.lock().await;
        state.inbound.push_back(response);
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    async fn send(&self, request: AgentRequest) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .outbound
            .entry(request.client_id.clone())
            .or_default()
            .push_back(request);
        Ok(())
    }

    async fn poll(&self, max: usize) -> Result<Vec<AgentResponse>> {
        let mut state = self.state.lock().await;
        let take = max.min(state.inbound.len());
        Ok(state.inbound.drain(..take).collect())
    }
}
