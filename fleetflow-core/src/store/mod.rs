//! Versioned key-value contract that every piece of persisted state goes
//! through.
//!
//! All mutation is optimistic: a write names the version it read and fails
//! with [`OrchestratorError::VersionConflict`] when the stored version moved.
//! Leases, throttle records, hunt counters and flow records are all built on
//! that single primitive.

pub mod keys;
pub mod memory;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    config::RetryConfig,
    error::{OrchestratorError, Result},
};

pub use memory::InMemoryObjectStore;

pub type Version = u64;

#[derive(Clone, Debug, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    async fn open(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>>;

    /// `expected = None` only succeeds when the key does not exist yet.
    async fn write(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: Option<Version>,
    ) -> Result<Version>;

    /// Immediate child names below `prefix/`, sorted and de-duplicated.
    async fn list_children(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Outcome of one read-modify-write attempt inside [`JsonStore::update`].
#[derive(Debug)]
pub enum Update<T, R> {
    Write(T, R),
    Skip(R),
}

/// serde_json view over an [`ObjectStore`] with bounded conflict retries.
#[derive(Clone)]
pub struct JsonStore {
    inner: Arc<dyn ObjectStore>,
    retry: RetryConfig,
}

impl fmt::Debug for JsonStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonStore")
            .field("inner", &self.inner)
            .field("retry", &self.retry)
            .finish()
    }
}

impl JsonStore {
    pub fn new(inner: Arc<dyn ObjectStore>, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }

    pub fn raw(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.inner)
    }

    pub fn retry(&self) -> RetryConfig {
        self.retry
    }

    pub async fn load<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<Versioned<T>>> {
        match self.inner.open(key).await? {
            Some(raw) => Ok(Some(Versioned {
                value: serde_json::from_slice(&raw.value)?,
                version: raw.version,
            })),
            None => Ok(None),
        }
    }

    pub async fn write<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        expected: Option<Version>,
    ) -> Result<Version> {
        let bytes = serde_json::to_vec(value)?;
        self.inner.write(key, bytes, expected).await
    }

    /// Create-only write. Returns `None` when the key already exists.
    pub async fn create<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<Option<Version>> {
        match self.write(key, value, None).await {
            Ok(version) => Ok(Some(version)),
            Err(err) if err.is_version_conflict() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Unconditional overwrite.
    pub async fn put<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<Version> {
        let bytes = serde_json::to_vec(value)?;
        let mut attempt = 0u16;
        loop {
            attempt += 1;
            let expected = self.inner.open(key).await?.map(|raw| raw.version);
            match self.inner.write(key, bytes.clone(), expected).await {
                Err(err) if err.is_version_conflict() => {
                    self.backoff(key, attempt).await?;
                }
                other => return other,
            }
        }
    }

    /// Read-modify-write retried on conflict. `apply` sees the current value
    /// (if any) on every attempt and decides whether to write.
    pub async fn update<T, R, F>(&self, key: &str, mut apply: F) -> Result<R>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        R: Send,
        F: FnMut(Option<T>) -> Result<Update<T, R>> + Send,
    {
        let mut attempt = 0u16;
        loop {
            attempt += 1;
            let current = self.load::<T>(key).await?;
            let expected = current.as_ref().map(|v| v.version);
            match apply(current.map(|v| v.value))? {
                Update::Skip(out) => return Ok(out),
                Update::Write(next, out) => {
                    match self.write(key, &next, expected).await {
                        Ok(_) => return Ok(out),
                        Err(err) if err.is_version_conflict() => {
                            self.backoff(key, attempt).await?;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    pub async fn list_children(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list_children(prefix).await
    }

    pub(crate) async fn backoff(&self, key: &str, attempt: u16) -> Result<()> {
        if attempt >= self.retry.max_attempts {
            return Err(OrchestratorError::Transient(format!(
                "gave up on {key} after {attempt} conflicting writes"
            )));
        }
        tracing::trace!(key, attempt, "version conflict; retrying");
        tokio::time::sleep(self.retry.delay_for(attempt)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u32,
    }

    fn store() -> JsonStore {
        JsonStore::new(
            Arc::new(InMemoryObjectStore::new()),
            RetryConfig::default(),
        )
    }

    #[tokio::test]
    async fn create_is_create_only() -> Result<()> {
        let store = store();
        assert!(store.create("a", &Counter { value: 1 }).await?.is_some());
        assert!(store.create("a", &Counter { value: 2 }).await?.is_none());
        let loaded = store.load::<Counter>("a").await?.expect("stored");
        assert_eq!(loaded.value, Counter { value: 1 });
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_updates_do_not_lose_writes() -> Result<()> {
        let store = store();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .update("counter", |current: Option<Counter>| {
                        let value = current.map(|c| c.value).unwrap_or(0);
                        Ok(Update::Write(Counter { value: value + 1 }, ()))
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.expect("join")?;
        }
        let loaded = store.load::<Counter>("counter").await?.expect("stored");
        assert_eq!(loaded.value.value, 16);
        Ok(())
    }

    /// Every write loses the race.
    #[derive(Debug, Default)]
    struct ContendedStore {
        writes: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for ContendedStore {
        async fn open(&self, _key: &str) -> Result<Option<Versioned<Vec<u8>>>> {
            Ok(None)
        }

        async fn write(
            &self,
            key: &str,
            _value: Vec<u8>,
            _expected: Option<Version>,
        ) -> Result<Version> {
            self.writes
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(OrchestratorError::VersionConflict { key: key.to_string() })
        }

        async fn list_children(&self, _prefix: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn exhausted_conflict_retries_surface_as_transient() -> Result<()> {
        let inner = Arc::new(ContendedStore::default());
        let store = JsonStore::new(
            inner.clone(),
            RetryConfig {
                max_attempts: 2,
                backoff_base_ms: 1,
                backoff_max_ms: 1,
                jitter_ratio: 0.0,
            },
        );

        let err = store
            .update("hot", |_: Option<Counter>| {
                Ok(Update::Write(Counter { value: 1 }, ()))
            })
            .await
            .expect_err("retries exhausted");
        assert!(matches!(err, OrchestratorError::Transient(_)), "{err}");
        assert_eq!(inner.writes.load(std::sync::atomic::Ordering::SeqCst), 2);

        let err = store
            .put("hot", &Counter { value: 2 })
            .await
            .expect_err("retries exhausted");
        assert!(matches!(err, OrchestratorError::Transient(_)), "{err}");
        assert_eq!(inner.writes.load(std::sync::atomic::Ordering::SeqCst), 4);
        Ok(())
    }

    #[tokio::test]
    async fn stale_version_is_rejected() -> Result<()> {
        let store = store();
        let v1 = store.write("k", &Counter { value: 1 }, None).await?;
        store.write("k", &Counter { value: 2 }, Some(v1)).await?;
        let err = store
            .write("k", &Counter { value: 3 }, Some(v1))
            .await
            .expect_err("stale write");
        assert!(err.is_version_conflict());
        Ok(())
    }
}
