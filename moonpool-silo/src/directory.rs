//! Grain directory: maps grain identities to activation addresses.
//!
//! The directory is the cluster's authority on where a grain lives. The
//! catalog registers every new activation and learns from the result
//! whether it won the single-activation race.
//!
//! # Register Semantics
//!
//! `register_single_activation()` never overwrites:
//! - no entry: the address is stored and [`Registration::Registered`] returned
//! - an entry exists: nothing is stored and the existing address comes back as
//!   [`Registration::DuplicateExists`]
//!
//! # Orleans Reference
//!
//! Corresponds to the slice of Orleans' local grain directory the catalog
//! and dispatcher use. Partition ownership and caching stay behind the
//! trait.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::DirectoryError;
use crate::types::{ActivationAddress, GrainId, SiloAddress};

/// Outcome of a single-activation registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// Our address is now authoritative.
    Registered(ActivationAddress),
    /// Another activation already owns the grain.
    DuplicateExists(ActivationAddress),
}

impl Registration {
    /// The authoritative address either way.
    pub fn address(&self) -> &ActivationAddress {
        match self {
            Self::Registered(address) | Self::DuplicateExists(address) => address,
        }
    }
}

/// Directory collaborator consumed by the catalog and placement.
#[async_trait]
pub trait GrainDirectory: fmt::Debug + Send + Sync {
    /// Register one of possibly many activations of a grain (stateless workers).
    async fn register(&self, address: ActivationAddress) -> Result<(), DirectoryError>;

    /// Register the single activation of a grain, or learn who already owns it.
    async fn register_single_activation(
        &self,
        address: ActivationAddress,
    ) -> Result<Registration, DirectoryError>;

    /// Remove `address` if it is still registered.
    async fn unregister(&self, address: &ActivationAddress) -> Result<(), DirectoryError>;

    /// Batch variant of [`unregister`](Self::unregister).
    async fn unregister_many(&self, addresses: &[ActivationAddress]) -> Result<(), DirectoryError>;

    /// Authoritative lookup.
    async fn full_lookup(&self, grain: &GrainId) -> Result<Vec<ActivationAddress>, DirectoryError>;

    /// Cached lookup without remote calls; `None` on cache miss.
    fn local_lookup(&self, grain: &GrainId) -> Option<Vec<ActivationAddress>>;

    /// Drop any cached entry for `grain`.
    fn invalidate_cache_entry(&self, grain: &GrainId);

    /// Silo owning the directory partition of `grain`.
    fn primary_for_grain(&self, grain: &GrainId) -> Option<SiloAddress>;
}

#[derive(Debug, Default)]
struct DirectoryState {
    entries: HashMap<GrainId, Vec<ActivationAddress>>,
    partition_owners: Vec<SiloAddress>,
}

/// In-memory directory for single-silo hosting and tests.
///
/// Partition ownership is a hash of the grain id over the configured
/// owner list. The cache is the table itself, so
/// [`invalidate_cache_entry`](GrainDirectory::invalidate_cache_entry) only
/// records that an invalidation happened.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    state: Mutex<DirectoryState>,
    invalidations: Mutex<Vec<GrainId>>,
}

impl InMemoryDirectory {
    /// Create an empty directory with no partition owners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directory whose partitions are spread over `owners`.
    pub fn with_partition_owners(owners: Vec<SiloAddress>) -> Self {
        let directory = Self::default();
        directory.set_partition_owners(owners);
        directory
    }

    /// Replace the partition owner list.
    pub fn set_partition_owners(&self, owners: Vec<SiloAddress>) {
        self.lock().partition_owners = owners;
    }

    /// Number of registered addresses across all grains.
    pub fn entry_count(&self) -> usize {
        self.lock().entries.values().map(Vec::len).sum()
    }

    /// Grains whose cache entry was invalidated, oldest first.
    pub fn invalidations(&self) -> Vec<GrainId> {
        self.invalidations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_entry(state: &mut DirectoryState, address: &ActivationAddress) {
        if let Some(list) = state.entries.get_mut(&address.grain) {
            list.retain(|a| a.activation != address.activation);
            if list.is_empty() {
                state.entries.remove(&address.grain);
            }
        }
    }
}

#[async_trait]
impl GrainDirectory for InMemoryDirectory {
    async fn register(&self, address: ActivationAddress) -> Result<(), DirectoryError> {
        let mut state = self.lock();
        let list = state.entries.entry(address.grain.clone()).or_default();
        if !list.contains(&address) {
            list.push(address);
        }
        Ok(())
    }

    async fn register_single_activation(
        &self,
        address: ActivationAddress,
    ) -> Result<Registration, DirectoryError> {
        let mut state = self.lock();
        let list = state.entries.entry(address.grain.clone()).or_default();
        match list.first() {
            Some(existing) if existing.activation != address.activation => {
                Ok(Registration::DuplicateExists(existing.clone()))
            }
            Some(existing) => Ok(Registration::Registered(existing.clone())),
            None => {
                list.push(address.clone());
                Ok(Registration::Registered(address))
            }
        }
    }

    async fn unregister(&self, address: &ActivationAddress) -> Result<(), DirectoryError> {
        Self::remove_entry(&mut self.lock(), address);
        Ok(())
    }

    async fn unregister_many(&self, addresses: &[ActivationAddress]) -> Result<(), DirectoryError> {
        let mut state = self.lock();
        for address in addresses {
            Self::remove_entry(&mut state, address);
        }
        Ok(())
    }

    async fn full_lookup(&self, grain: &GrainId) -> Result<Vec<ActivationAddress>, DirectoryError> {
        Ok(self.lock().entries.get(grain).cloned().unwrap_or_default())
    }

    fn local_lookup(&self, grain: &GrainId) -> Option<Vec<ActivationAddress>> {
        self.lock().entries.get(grain).cloned()
    }

    fn invalidate_cache_entry(&self, grain: &GrainId) {
        self.invalidations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(grain.clone());
    }

    fn primary_for_grain(&self, grain: &GrainId) -> Option<SiloAddress> {
        let state = self.lock();
        if state.partition_owners.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        grain.hash(&mut hasher);
        let index = (hasher.finish() % state.partition_owners.len() as u64) as usize;
        state.partition_owners.get(index).copied()
    }
}
