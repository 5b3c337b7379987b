//! Client enumeration for hunt selection rules.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    ops::Bound,
    sync::Arc,
};

use async_trait::async_trait;
use fleetflow_model::{ClientId, ClientSelectionRule};
use futures::{StreamExt, stream::BoxStream};
use tokio::sync::RwLock;

use crate::error::Result;

/// Source of clients matching a selection rule.
///
/// Enumeration is lazy: clients registered while a stream is being consumed
/// are still yielded if they sort after the current position.
#[async_trait]
pub trait ClientDirectory: Send + Sync + fmt::Debug {
    fn enumerate(
        &self,
        rule: &ClientSelectionRule,
    ) -> BoxStream<'static, Result<ClientId>>;

    async fn labels(&self, client: &ClientId) -> Result<Option<BTreeSet<String>>>;
}

type Clients = BTreeMap<ClientId, BTreeSet<String>>;

#[derive(Clone, Default)]
pub struct InMemoryClientDirectory {
    clients: Arc<RwLock<Clients>>,
}

impl fmt::Debug for InMemoryClientDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryClientDirectory");
        match self.clients.try_read() {
            Ok(clients) => debug.field("clients", &clients.len()),
            Err(_) => debug.field("clients", &"<locked>"),
        };
        debug.finish()
    }
}

impl InMemoryClientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or relabels a client.
    pub async fn register<I, S>(&self, client: ClientId, labels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels = labels.into_iter().map(Into::into).collect();
        self.clients.write().await.insert(client, labels);
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

#[async_trait]
impl ClientDirectory for InMemoryClientDirectory {
    fn enumerate(
        &self,
        rule: &ClientSelectionRule,
    ) -> BoxStream<'static, Result<ClientId>> {
        let all_of: Vec<String> = match rule {
            ClientSelectionRule::Explicit { clients } => {
                return futures::stream::iter(clients.clone().into_iter().map(Ok))
                    .boxed();
            }
            ClientSelectionRule::Labels { all_of } => all_of.clone(),
            ClientSelectionRule::All => Vec::new(),
        };

        let clients = Arc::clone(&self.clients);
        futures::stream::unfold(None::<ClientId>, move |cursor| {
            let clients = Arc::clone(&clients);
            let all_of = all_of.clone();
            async move {
                let guard = clients.read().await;
                let lower = match &cursor {
                    Some(last) => Bound::Excluded(last),
                    None => Bound::Unbounded,
                };
                let next = guard
                    .range((lower, Bound::Unbounded))
                    .find(|(_, labels)| {
                        all_of.iter().all(|label| labels.contains(label))
                    })
                    .map(|(client, _)| client.clone())?;
                Some((Ok(next.clone()), Some(next)))
            }
        })
        .boxed()
    }

    async fn labels(&self, client: &ClientId) -> Result<Option<BTreeSet<String>>> {
        Ok(self.clients.read().await.get(client).cloned())
    }
}
