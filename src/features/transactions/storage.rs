use crate::core::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Storage hooks the transaction manager calls into. Writes are applied
/// immediately; `rollback_write` restores the value captured before the first write.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Read a resource, `None` if it does not exist
    async fn perform_read(&self, resource: &str) -> Result<Option<Bytes>>;

    /// Write a resource in place
    async fn perform_write(&self, resource: &str, value: Bytes) -> Result<()>;

    /// Restore a resource to `original`; `None` deletes it
    async fn rollback_write(&self, resource: &str, original: Option<Bytes>) -> Result<()>;
}

/// Default in-memory store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: DashMap<String, Bytes>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, resource: &str) -> Option<Bytes> {
        self.data.get(resource).map(|v| v.value().clone())
    }

    pub fn insert(&self, resource: impl Into<String>, value: impl Into<Bytes>) {
        self.data.insert(resource.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sorted copy of the contents
    pub fn snapshot(&self) -> BTreeMap<String, Bytes> {
        self.data
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn perform_read(&self, resource: &str) -> Result<Option<Bytes>> {
        Ok(self.get(resource))
    }

    async fn perform_write(&self, resource: &str, value: Bytes) -> Result<()> {
        self.data.insert(resource.to_string(), value);
        Ok(())
    }

    async fn rollback_write(&self, resource: &str, original: Option<Bytes>) -> Result<()> {
        match original {
            Some(value) => {
                self.data.insert(resource.to_string(), value);
            }
            None => {
                self.data.remove(resource);
            }
        }
        Ok(())
    }
}
