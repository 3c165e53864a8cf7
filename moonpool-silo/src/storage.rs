//! Grain state persistence collaborators.
//!
//! A [`StorageProvider`] reads, writes and clears serialized grain state
//! with ETag-based optimistic concurrency. The catalog reads state once
//! while activating a grain; grains write through their context.
//!
//! Providers are registered by name in [`StorageProviders`]; a grain type
//! names the provider it uses.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::types::GrainId;

/// Serialized grain state plus its concurrency token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredState {
    /// Serialized state bytes.
    pub data: Vec<u8>,
    /// Optimistic concurrency token.
    pub etag: String,
}

/// Durable grain state storage.
#[async_trait]
pub trait StorageProvider: fmt::Debug + Send + Sync {
    /// Read state; `Ok(None)` when nothing was ever written.
    async fn read_state(
        &self,
        grain_type: &str,
        grain: &GrainId,
    ) -> Result<Option<StoredState>, StorageError>;

    /// Write state. With `expected_etag` set, the write only succeeds if it
    /// matches the stored ETag. Returns the new ETag.
    async fn write_state(
        &self,
        grain_type: &str,
        grain: &GrainId,
        data: Vec<u8>,
        expected_etag: Option<&str>,
    ) -> Result<String, StorageError>;

    /// Delete state, with the same ETag rule as writes.
    async fn clear_state(
        &self,
        grain_type: &str,
        grain: &GrainId,
        expected_etag: Option<&str>,
    ) -> Result<(), StorageError>;
}

/// In-memory provider. ETags are a monotonically increasing counter.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    entries: Mutex<HashMap<(String, GrainId), StoredState>>,
    counter: AtomicU64,
}

impl InMemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_etag(&self) -> String {
        (self.counter.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    fn check_etag(
        current: Option<&StoredState>,
        expected: Option<&str>,
    ) -> Result<(), StorageError> {
        match (expected, current) {
            (None, _) => Ok(()),
            (Some(expected), Some(existing)) if existing.etag == expected => Ok(()),
            (Some(expected), current) => Err(StorageError::ETagMismatch {
                expected: Some(expected.to_string()),
                actual: current.map(|s| s.etag.clone()),
            }),
        }
    }
}

#[async_trait]
impl StorageProvider for InMemoryStorage {
    async fn read_state(
        &self,
        grain_type: &str,
        grain: &GrainId,
    ) -> Result<Option<StoredState>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(&(grain_type.to_string(), grain.clone())).cloned())
    }

    async fn write_state(
        &self,
        grain_type: &str,
        grain: &GrainId,
        data: Vec<u8>,
        expected_etag: Option<&str>,
    ) -> Result<String, StorageError> {
        let key = (grain_type.to_string(), grain.clone());
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Self::check_etag(entries.get(&key), expected_etag)?;

        let etag = self.next_etag();
        entries.insert(
            key,
            StoredState {
                data,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn clear_state(
        &self,
        grain_type: &str,
        grain: &GrainId,
        expected_etag: Option<&str>,
    ) -> Result<(), StorageError> {
        let key = (grain_type.to_string(), grain.clone());
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Self::check_etag(entries.get(&key), expected_etag)?;
        entries.remove(&key);
        Ok(())
    }
}

/// Named storage providers available to grain types.
#[derive(Debug, Clone, Default)]
pub struct StorageProviders {
    providers: HashMap<String, Arc<dyn StorageProvider>>,
}

impl StorageProviders {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` under `name`.
    pub fn add(&mut self, name: impl Into<String>, provider: Arc<dyn StorageProvider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Look up a provider.
    pub fn get(&self, name: &str) -> Result<Arc<dyn StorageProvider>, StorageError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnknownProvider(name.to_string()))
    }
}
