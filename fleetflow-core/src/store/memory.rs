use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    ops::Bound,
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ObjectStore, Version, Versioned};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    version: Version,
}

/// Process-local [`ObjectStore`]. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    entries: Arc<RwLock<BTreeMap<String, Entry>>>,
}

impl fmt::Debug for InMemoryObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryObjectStore");
        match self.entries.try_read() {
            Ok(entries) => {
                debug.field("keys", &entries.len());
            }
            Err(_) => {
                debug.field("entries", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn open(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>> {
        let guard = self.entries.read().await;
        Ok(guard.get(key).map(|entry| Versioned {
            value: entry.value.clone(),
            version: entry.version,
        }))
    }

    async fn write(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: Option<Version>,
    ) -> Result<Version> {
        let mut guard = self.entries.write().await;
        let current = guard.get(key).map(|entry| entry.version);
        if current != expected {
            return Err(OrchestratorError::VersionConflict {
                key: key.to_string(),
            });
        }
        let version = current.unwrap_or(0) + 1;
        guard.insert(key.to_string(), Entry { value, version });
        Ok(version)
    }

    async fn list_children(&self, prefix: &str) -> Result<Vec<String>> {
        let base = format!("{}/", prefix.trim_end_matches('/'));
        let guard = self.entries.read().await;
        let mut children = BTreeSet::new();
        for key in guard
            .range::<str, _>((Bound::Included(base.as_str()), Bound::Unbounded))
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(&base))
        {
            let rest = &key[base.len()..];
            let child = rest.split('/').next().unwrap_or(rest);
            if !child.is_empty() {
                children.insert(child.to_string());
            }
        }
        Ok(children.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_children_returns_immediate_names() -> Result<()> {
        let store = InMemoryObjectStore::new();
        for key in [
            "flows/a",
            "flows/a/results/1",
            "flows/b",
            "flows/b/inbox/1",
            "flows/a-b",
            "flowsx/c",
            "hunts/h",
        ] {
            store.write(key, b"{}".to_vec(), None).await?;
        }
        assert_eq!(store.list_children("flows").await?, vec!["a", "a-b", "b"]);
        assert_eq!(store.list_children("flows/a/results").await?, vec!["1"]);
        assert!(store.list_children("missing").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn versions_increase_per_key() -> Result<()> {
        let store = InMemoryObjectStore::new();
        assert_eq!(store.write("k", vec![1], None).await?, 1);
        assert_eq!(store.write("k", vec![2], Some(1)).await?, 2);
        assert!(store.write("k", vec![3], None).await.is_err());
        Ok(())
    }
}
