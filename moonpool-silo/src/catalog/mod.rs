//! Activation catalog: the silo's registry of local activations.
//!
//! The catalog creates activations on demand, drives them through
//! activation (state load, directory registration, activate hook) and
//! orchestrates their deactivation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Catalog                                  │
//! │                                          │
//! │  ┌────────────────────────────────────┐  │
//! │  │ registry: Mutex<ActivationRegistry>│  │
//! │  │  (ActivationId → ActivationRecord) │  │
//! │  └────────────────────────────────────┘  │
//! │                                          │
//! │  collector ── directory ── storage       │
//! └──────────────────────────────────────────┘
//! ```
//!
//! # Creation
//!
//! ```text
//! get_or_create_activation(address, placement):
//!   1. Lock registry
//!   2. Found → touch collection ticket, return it
//!   3. No placement → NonExistentActivation
//!   4. Insert placeholder (state Create) so concurrent messages queue on it
//!   5. Unlock, spawn init:
//!        create grain → load state → register in directory → on_activate
//!        → Inactive, run the message pump
//! ```
//!
//! A single-activation registration that loses to another activation is not
//! an error: the placeholder forwards its queued messages to the winner and
//! is discarded.
//!
//! # Destroy
//!
//! ```text
//! Deactivating → on_deactivate → directory unregister_many
//!   → Invalid → unregister locally → reroute messages received meanwhile
//! ```
//!
//! # Lock order
//!
//! Registry lock, then activation lock. The registry lock is never taken
//! while an activation lock is held.

mod registry;
mod report;

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use tokio::task::JoinHandle;

pub use registry::ActivationRegistry;
pub use report::{DetailedGrainReport, GrainStatistic};

use crate::activation::{ActivationRecord, ActivationState, DeactivationReason};
use crate::client::RuntimeClient;
use crate::collector::ActivationCollector;
use crate::config::SiloConfig;
use crate::directory::{GrainDirectory, Registration};
use crate::dispatcher::Dispatcher;
use crate::error::{ActivationError, CatalogError, GrainError};
use crate::grain::{GrainContext, GrainTypeData, GrainTypeRegistry};
use crate::membership::{SiloStatus, SiloStatusListener, SiloStatusOracle};
use crate::message::RejectionType;
use crate::placement::{PlacementContext, PlacementStrategy};
use crate::storage::{StorageProviders, StoredState};
use crate::types::{ActivationAddress, ActivationId, GrainId, SiloAddress};

/// Collaborators the catalog is built with.
#[derive(Clone)]
pub struct CatalogServices {
    /// Grain types known to this silo.
    pub grain_types: Arc<GrainTypeRegistry>,
    /// Distributed grain directory.
    pub directory: Arc<dyn GrainDirectory>,
    /// Named storage providers.
    pub storage: Arc<StorageProviders>,
    /// Cluster status view.
    pub membership: Arc<dyn SiloStatusOracle>,
    /// Idle-activation collector.
    pub collector: Arc<ActivationCollector>,
    /// Outstanding-request table, used by grain contexts.
    pub client: Arc<RuntimeClient>,
}

type InitHandle = JoinHandle<Result<(), ActivationError>>;

/// Registry of local activations and owner of their lifecycle.
pub struct Catalog {
    local_silo: SiloAddress,
    config: Arc<SiloConfig>,
    grain_types: Arc<GrainTypeRegistry>,
    directory: Arc<dyn GrainDirectory>,
    storage: Arc<StorageProviders>,
    membership: Arc<dyn SiloStatusOracle>,
    collector: Arc<ActivationCollector>,
    client: Arc<RuntimeClient>,
    registry: Mutex<ActivationRegistry>,
    dispatcher: OnceLock<Weak<Dispatcher>>,
    weak_self: Weak<Catalog>,
}

impl Catalog {
    /// Create the catalog.
    pub fn new(local_silo: SiloAddress, config: Arc<SiloConfig>, services: CatalogServices) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            local_silo,
            config,
            grain_types: services.grain_types,
            directory: services.directory,
            storage: services.storage,
            membership: services.membership,
            collector: services.collector,
            client: services.client,
            registry: Mutex::new(ActivationRegistry::new()),
            dispatcher: OnceLock::new(),
            weak_self: weak_self.clone(),
        })
    }

    pub(crate) fn attach_dispatcher(&self, dispatcher: &Arc<Dispatcher>) {
        let _ = self.dispatcher.set(Arc::downgrade(dispatcher));
    }

    fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.dispatcher.get().and_then(Weak::upgrade)
    }

    fn registry(&self) -> MutexGuard<'_, ActivationRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// This silo.
    pub fn local_silo(&self) -> SiloAddress {
        self.local_silo
    }

    /// Idle-activation collector.
    pub fn collector(&self) -> &Arc<ActivationCollector> {
        &self.collector
    }

    /// Directory collaborator.
    pub fn directory(&self) -> &Arc<dyn GrainDirectory> {
        &self.directory
    }

    /// Cluster status view.
    pub fn membership(&self) -> &Arc<dyn SiloStatusOracle> {
        &self.membership
    }

    /// Number of local activations.
    pub fn activation_count(&self) -> usize {
        self.registry().count()
    }

    /// Local activation by id.
    pub fn find_activation(&self, activation: ActivationId) -> Option<Arc<ActivationRecord>> {
        self.registry().find_target(activation)
    }

    /// Every local activation of `grain`.
    pub fn find_activations(&self, grain: &GrainId) -> Vec<Arc<ActivationRecord>> {
        self.registry().find_targets(grain)
    }

    /// Placement strategy registered for the grain's type.
    pub fn placement_strategy(&self, grain: &GrainId) -> Option<PlacementStrategy> {
        self.grain_types.get(grain.grain_type).map(|data| data.placement)
    }

    /// Idle age limit for a grain type.
    pub fn collection_age_limit(&self, type_data: &GrainTypeData) -> Duration {
        type_data
            .collection_age_limit
            .unwrap_or_else(|| self.config.collection.age_limit_for(&type_data.name))
    }

    fn context_for(&self, record: &Arc<ActivationRecord>) -> GrainContext {
        GrainContext::new(
            record,
            self.weak_self.clone(),
            Arc::downgrade(&self.client),
            Vec::new(),
        )
    }

    /// Return the local activation at `address`, or create it.
    ///
    /// Without a placement strategy the activation must already exist;
    /// otherwise this fails with [`CatalogError::NonExistentActivation`].
    /// The flag is true when this call created the activation; its
    /// initialization then runs in the background.
    pub fn get_or_create_activation(
        &self,
        address: &ActivationAddress,
        placement: Option<PlacementStrategy>,
    ) -> Result<(Arc<ActivationRecord>, bool), CatalogError> {
        let (record, init) = self.get_or_create_inner(address, placement)?;
        Ok((record, init.is_some()))
    }

    fn get_or_create_inner(
        &self,
        address: &ActivationAddress,
        placement: Option<PlacementStrategy>,
    ) -> Result<(Arc<ActivationRecord>, Option<InitHandle>), CatalogError> {
        let type_data = match placement {
            Some(_) => Some(
                self.grain_types
                    .get(address.grain.grain_type)
                    .ok_or(CatalogError::UnknownGrainType(address.grain.grain_type))?,
            ),
            None => None,
        };

        let record = {
            let mut registry = self.registry();
            if let Some(existing) = registry.find_target(address.activation) {
                let age_limit = existing.lock().collection_age_limit();
                // activity on a scheduled activation moves its ticket; failure is fine
                self.collector.try_reschedule_collection(&existing, age_limit);
                return Ok((existing, None));
            }
            let Some(type_data) = type_data else {
                tracing::debug!(activation = %address, "non-existent activation");
                return Err(CatalogError::NonExistentActivation(address.clone()));
            };

            let limit = self.config.limits.for_grain(type_data.stateless_worker).clone();
            let age_limit = self.collection_age_limit(&type_data);
            let record = Arc::new(ActivationRecord::new(
                address.clone(),
                type_data,
                limit,
                age_limit,
            ));
            registry.record_new_target(record.clone());
            record
        };

        tracing::debug!(activation = %address, "created activation placeholder");
        let init = match self.weak_self.upgrade() {
            Some(catalog) => {
                let record = record.clone();
                Some(tokio::spawn(async move { catalog.init_activation(record).await }))
            }
            None => None,
        };
        Ok((record, init))
    }

    #[tracing::instrument(skip_all, fields(activation = %record.address()))]
    async fn init_activation(
        self: Arc<Self>,
        record: Arc<ActivationRecord>,
    ) -> Result<(), ActivationError> {
        let result = self.activate(&record).await;
        match &result {
            Ok(()) => {
                tracing::debug!("activation ready");
                if let Some(dispatcher) = self.dispatcher() {
                    dispatcher.on_activate_deactivate_completed(&record);
                }
            }
            Err(err) => self.on_activation_failed(&record, err).await,
        }
        result
    }

    async fn activate(&self, record: &Arc<ActivationRecord>) -> Result<(), ActivationError> {
        let type_data = record.type_data().clone();
        let grain = (type_data.factory)(record.grain_id());
        {
            let mut inner = record.lock();
            if !inner.set_state(ActivationState::Activating) {
                return Err(ActivationError::Invalidated);
            }
            inner.set_grain(grain.clone());
        }

        let state = self.load_state(&type_data, record.grain_id()).await?;
        still_activating(record)?;
        self.register_in_directory(record).await?;
        still_activating(record)?;

        let ctx = self.context_for(record);
        AssertUnwindSafe(grain.on_activate(&ctx, state))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(GrainError::Failed("activate hook panicked".into())))?;
        if let Err(err) = still_activating(record) {
            // destroyed while the hook ran; the destroy path skipped on_deactivate
            let reason = record
                .lock()
                .deactivation_reason()
                .unwrap_or(DeactivationReason::ExplicitRequest);
            let outcome = AssertUnwindSafe(grain.on_deactivate(&ctx, reason))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(GrainError::Failed("deactivate hook panicked".into())));
            if let Err(hook_err) = outcome {
                tracing::error!(activation = %record.address(), error = %hook_err, "deactivate hook failed");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn load_state(
        &self,
        type_data: &GrainTypeData,
        grain: &GrainId,
    ) -> Result<Option<StoredState>, ActivationError> {
        let Some(provider_name) = &type_data.storage_provider else {
            return Ok(None);
        };
        let provider = self.storage.get(provider_name)?;
        Ok(provider.read_state(&type_data.name, grain).await?)
    }

    async fn register_in_directory(&self, record: &ActivationRecord) -> Result<(), ActivationError> {
        let address = record.address().clone();
        if record.is_stateless_worker() {
            self.directory.register(address).await?;
            return Ok(());
        }
        match self.directory.register_single_activation(address).await? {
            Registration::Registered(_) => Ok(()),
            Registration::DuplicateExists(winner) => Err(ActivationError::Duplicate(winner)),
        }
    }

    async fn on_activation_failed(&self, record: &Arc<ActivationRecord>, err: &ActivationError) {
        let address = record.address().clone();
        let (pending, forward_to) = {
            let mut inner = record.lock();
            let forward_to = match err {
                ActivationError::Duplicate(winner) => Some(winner.clone()),
                _ => None,
            };
            inner.set_forwarding_address(forward_to.clone());
            inner.set_state(ActivationState::Invalid);
            (inner.take_pending(), forward_to)
        };
        self.unregister_message_target(record);
        let dispatcher = self.dispatcher();

        match forward_to {
            Some(winner) => {
                tracing::debug!(
                    activation = %address,
                    winner = %winner,
                    primary = ?self.directory.primary_for_grain(&address.grain),
                    pending = pending.len(),
                    "duplicate activation, forwarding to existing activation"
                );
                if let Some(dispatcher) = &dispatcher {
                    for message in pending {
                        dispatcher.process_request_to_invalid_activation(
                            message,
                            Some(&winner),
                            "resend from duplicate activation",
                        );
                    }
                }
            }
            None => {
                if matches!(err, ActivationError::Invalidated) {
                    tracing::debug!(activation = %address, "activation destroyed while initializing");
                } else {
                    tracing::error!(activation = %address, error = %err, "failed to create activation");
                }
                if let Some(dispatcher) = &dispatcher {
                    for mut message in pending {
                        message.add_cache_invalidation(address.clone());
                        dispatcher.reject_message(
                            message,
                            RejectionType::Unrecoverable,
                            format!("activation {} failed: {}", address, err),
                        );
                    }
                }
                if let Err(unregister_err) = self.directory.unregister(&address).await {
                    tracing::warn!(activation = %address, error = %unregister_err, "failed to undo directory registration");
                }
            }
        }
        record.notify_deactivated();
    }

    fn unregister_message_target(&self, record: &Arc<ActivationRecord>) {
        let removed = self.registry().remove_target(record);
        if removed {
            self.collector.try_cancel_collection(record);
            tracing::trace!(activation = %record.address(), "unregistered activation locally");
        }
    }

    /// Create a system grain on this silo and wait until it is active.
    pub async fn create_system_grain(&self, grain: GrainId) -> Result<Arc<ActivationRecord>, CatalogError> {
        let address = ActivationAddress::new_activation(self.local_silo, grain);
        let (record, init) = self.get_or_create_inner(&address, Some(PlacementStrategy::Explicit(self.local_silo)))?;
        if let Some(init) = init {
            match init.await {
                Ok(result) => result?,
                Err(join_err) => {
                    tracing::error!(activation = %address, error = %join_err, "system grain init task failed");
                    return Err(CatalogError::NotRunning);
                }
            }
        }
        Ok(record)
    }

    /// Gracefully deactivate `list`: idle activations now, busy ones the
    /// next time they go idle. Completes once all are destroyed.
    #[tracing::instrument(skip_all, fields(count = list.len(), reason = ?reason))]
    pub async fn shutdown_activations(&self, list: Vec<Arc<ActivationRecord>>, reason: DeactivationReason) {
        if list.is_empty() {
            return;
        }
        let mut destroy_now = Vec::new();
        let mut destroy_later = Vec::new();
        for record in list {
            let mut inner = record.lock();
            if !inner.start_shutting_down(reason) {
                continue;
            }
            if inner.state() == ActivationState::Inactive && inner.is_inactive() {
                drop(inner);
                destroy_now.push(record);
            } else {
                let catalog = self.weak_self.clone();
                let deferred = record.clone();
                inner.add_on_inactive(Box::new(move || {
                    if let Some(catalog) = catalog.upgrade() {
                        tokio::spawn(async move {
                            catalog.destroy_activations(vec![deferred]).await;
                        });
                    }
                }));
                drop(inner);
                destroy_later.push(record);
            }
        }
        tracing::info!(
            prompt = destroy_now.len(),
            delayed = destroy_later.len(),
            "shutting down activations"
        );

        let later = join_all(destroy_later.iter().map(|record| record.wait_deactivated()));
        futures::join!(self.destroy_activations(destroy_now), later);
    }

    /// Destroy activations now, regardless of running turns.
    #[tracing::instrument(skip_all, fields(count = list.len()))]
    pub async fn destroy_activations(&self, list: Vec<Arc<ActivationRecord>>) {
        let mut batch = Vec::with_capacity(list.len());
        for record in list {
            if self.registry().find_target(record.activation_id()).is_none() {
                continue;
            }
            let (grain, reason) = {
                let mut inner = record.lock();
                // the init task owns the hooks of an activation still initializing
                let activated = inner.state() == ActivationState::Inactive;
                if !inner.set_state(ActivationState::Deactivating) {
                    continue;
                }
                let reason = inner
                    .deactivation_reason()
                    .unwrap_or(DeactivationReason::ExplicitRequest);
                (inner.grain().filter(|_| activated), reason)
            };
            batch.push((record, grain, reason));
        }
        if batch.is_empty() {
            return;
        }

        join_all(batch.iter().map(|(record, grain, reason)| async move {
            let Some(grain) = grain else {
                return;
            };
            let ctx = self.context_for(record);
            let outcome = AssertUnwindSafe(grain.on_deactivate(&ctx, *reason))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(GrainError::Failed("deactivate hook panicked".into())));
            if let Err(err) = outcome {
                tracing::error!(activation = %record.address(), error = %err, "deactivate hook failed");
            }
        }))
        .await;

        let addresses: Vec<_> = batch.iter().map(|(r, _, _)| r.address().clone()).collect();
        if let Err(err) = self.directory.unregister_many(&addresses).await {
            tracing::warn!(count = addresses.len(), error = %err, "directory unregister_many failed");
        }

        let dispatcher = self.dispatcher();
        for (record, _, _) in batch {
            let pending = {
                let mut inner = record.lock();
                inner.set_state(ActivationState::Invalid);
                inner.set_forwarding_address(None);
                inner.take_pending()
            };
            self.unregister_message_target(&record);
            self.directory.invalidate_cache_entry(record.grain_id());
            record.notify_deactivated();
            tracing::debug!(activation = %record.address(), rerouted = pending.len(), "activation destroyed");

            if let Some(dispatcher) = &dispatcher {
                for mut message in pending {
                    message.clear_target_address();
                    dispatcher.send_message(message);
                }
            }
        }
    }

    /// Collect the activations the collector reports as stale. Returns how
    /// many were collected.
    pub async fn collect_stale(&self) -> usize {
        let stale = self.collector.scan_stale();
        let count = stale.len();
        if count > 0 {
            tracing::debug!(count, "collecting stale activations");
            self.shutdown_activations(stale, DeactivationReason::IdleCollection)
                .await;
        }
        count
    }

    /// Forced collection of every activation idle for at least `age_limit`.
    pub async fn collect_activations(&self, age_limit: Duration) -> usize {
        let victims = self.collector.scan_all(age_limit);
        let count = victims.len();
        tracing::info!(count, ?age_limit, "forced activation collection");
        self.shutdown_activations(victims, DeactivationReason::ExplicitRequest)
            .await;
        count
    }

    /// Destroy every local activation of the listed grains.
    pub async fn delete_grains_local(&self, grains: &[GrainId]) {
        let targets: Vec<_> = {
            let registry = self.registry();
            grains
                .iter()
                .flat_map(|grain| registry.find_targets(grain))
                .collect()
        };
        tracing::debug!(grains = grains.len(), activations = targets.len(), "delete grains");
        self.destroy_activations(targets).await;
    }

    /// Destroy the listed local activations.
    pub async fn delete_activations_local(&self, addresses: &[ActivationAddress]) {
        let targets: Vec<_> = {
            let registry = self.registry();
            addresses
                .iter()
                .filter_map(|address| registry.find_target(address.activation))
                .collect()
        };
        self.destroy_activations(targets).await;
    }

    /// Gracefully deactivate every local activation.
    pub async fn deactivate_all(&self, reason: DeactivationReason) {
        let all = self.registry().all();
        self.shutdown_activations(all, reason).await;
    }

    /// Extend the keep-alive of `record`, capped by the configured maximum.
    pub fn delay_deactivation(&self, record: &Arc<ActivationRecord>, duration: Duration) {
        let duration = match self.config.collection.max_keep_alive {
            Some(cap) if duration > cap => {
                tracing::debug!(activation = %record.address(), ?duration, ?cap, "keep-alive capped");
                cap
            }
            _ => duration,
        };
        record.lock().delay_deactivation(duration);
    }

    /// Deactivate `record` the next time it is idle.
    pub fn deactivate_on_idle(&self, record: Arc<ActivationRecord>) {
        record.lock().reset_keep_alive();
        let Some(catalog) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            catalog
                .shutdown_activations(vec![record], DeactivationReason::ApplicationRequest)
                .await;
        });
    }

    /// Activation count per grain type on this silo.
    pub fn get_grain_statistics(&self) -> Vec<GrainStatistic> {
        self.registry()
            .grain_type_counts()
            .into_iter()
            .map(|(grain_type, activation_count)| GrainStatistic {
                grain_type,
                silo: self.local_silo,
                activation_count,
            })
            .collect()
    }

    /// `(type name, count)` pairs.
    pub fn get_simple_grain_statistics(&self) -> Vec<(String, usize)> {
        self.registry().grain_type_counts()
    }

    /// Everything this silo knows about `grain`.
    pub fn get_detailed_grain_report(&self, grain: &GrainId) -> DetailedGrainReport {
        let local = self.find_activations(grain);
        DetailedGrainReport {
            grain: grain.clone(),
            silo: self.local_silo,
            grain_type: self.grain_types.get(grain.grain_type).map(|d| d.name.clone()),
            primary_for_grain: self.directory.primary_for_grain(grain),
            local_cache_activations: self.directory.local_lookup(grain).unwrap_or_default(),
            local_activations: local.iter().map(|r| r.address().clone()).collect(),
            activation_details: local.iter().map(|r| r.to_detailed_string()).collect(),
        }
    }

    fn on_silo_lost(&self, silo: SiloAddress) {
        let victims: Vec<_> = self
            .registry()
            .all()
            .into_iter()
            .filter(|record| self.directory.primary_for_grain(record.grain_id()) == Some(silo))
            .collect();
        for record in &victims {
            record.lock().reset_keep_alive();
        }
        tracing::info!(
            silo = %silo,
            count = victims.len(),
            "deactivating activations whose directory partition owner left"
        );
        if victims.is_empty() {
            return;
        }

        let Some(catalog) = self.weak_self.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    catalog
                        .shutdown_activations(victims, DeactivationReason::DirectoryOwnerLost)
                        .await;
                });
            }
            Err(err) => {
                tracing::error!(silo = %silo, error = %err, "no runtime to deactivate activations on");
            }
        }
    }
}

impl SiloStatusListener for Catalog {
    fn silo_status_change_notification(&self, silo: SiloAddress, status: SiloStatus) {
        if silo == self.local_silo {
            return;
        }
        if status.is_terminating() {
            self.on_silo_lost(silo);
        }
    }
}

impl PlacementContext for Catalog {
    fn local_silo(&self) -> SiloAddress {
        self.local_silo
    }

    fn active_silos(&self) -> Vec<SiloAddress> {
        let silos = self.membership.active_silos();
        if silos.is_empty() {
            tracing::warn!("no active silos known, using the local silo");
            return vec![self.local_silo];
        }
        silos
    }

    fn local_activations(&self, grain: &GrainId) -> Vec<ActivationAddress> {
        self.find_activations(grain)
            .into_iter()
            .filter(|record| record.state() != ActivationState::Invalid)
            .map(|record| record.address().clone())
            .collect()
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("local_silo", &self.local_silo)
            .field("activations", &self.activation_count())
            .finish_non_exhaustive()
    }
}

fn still_activating(record: &ActivationRecord) -> Result<(), ActivationError> {
    if record.lock().state() == ActivationState::Activating {
        Ok(())
    } else {
        Err(ActivationError::Invalidated)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::future::join_all;

    use super::*;
    use crate::config::MessagingConfig;
    use crate::directory::InMemoryDirectory;
    use crate::grain::Grain;
    use crate::membership::StaticMembership;
    use crate::types::GrainType;

    struct Noop;

    #[async_trait]
    impl Grain for Noop {
        async fn invoke(
            &self,
            _ctx: &GrainContext,
            _interface_id: u32,
            _method_id: u32,
            _body: &[u8],
        ) -> Result<Vec<u8>, GrainError> {
            Ok(Vec::new())
        }
    }

    fn local() -> SiloAddress {
        SiloAddress::localhost(5000, 1)
    }

    fn catalog(directory: Arc<InMemoryDirectory>) -> Arc<Catalog> {
        let mut grain_types = GrainTypeRegistry::new();
        grain_types.register(GrainTypeData::new(GrainType(1), "Noop", |_| {
            Arc::new(Noop) as Arc<dyn Grain>
        }));
        let config = Arc::new(SiloConfig::default());
        Catalog::new(
            local(),
            config.clone(),
            CatalogServices {
                grain_types: Arc::new(grain_types),
                directory,
                storage: Arc::new(StorageProviders::new()),
                membership: Arc::new(StaticMembership::new(local())),
                collector: Arc::new(ActivationCollector::new(config.collection.quantum)),
                client: RuntimeClient::new(local(), MessagingConfig::default()),
            },
        )
    }

    fn address(key: &str) -> ActivationAddress {
        ActivationAddress::new_activation(local(), GrainId::new(GrainType(1), key))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_creates_once() {
        let catalog = catalog(Arc::new(InMemoryDirectory::with_partition_owners(vec![local()])));
        let target = address("race");

        let tasks = (0..16).map(|_| {
            let catalog = catalog.clone();
            let target = target.clone();
            tokio::spawn(async move {
                catalog
                    .get_or_create_activation(&target, Some(PlacementStrategy::PreferLocal))
                    .map(|(record, created)| (record.activation_id(), created))
            })
        });
        let results: Vec<_> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.expect("join").expect("get or create"))
            .collect();

        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        assert!(results.iter().all(|(id, _)| *id == target.activation));
        assert_eq!(catalog.activation_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_activation_without_placement() {
        let catalog = catalog(Arc::new(InMemoryDirectory::new()));

        let err = catalog
            .get_or_create_activation(&address("gone"), None)
            .expect_err("nothing to find");
        assert!(matches!(err, CatalogError::NonExistentActivation(_)));

        let unknown = ActivationAddress::new_activation(local(), GrainId::new(GrainType(9), "x"));
        let err = catalog
            .get_or_create_activation(&unknown, Some(PlacementStrategy::PreferLocal))
            .expect_err("unknown type");
        assert!(matches!(err, CatalogError::UnknownGrainType(GrainType(9))));
        assert_eq!(catalog.activation_count(), 0);
    }

    #[tokio::test]
    async fn test_init_registers_in_directory() {
        let directory = Arc::new(InMemoryDirectory::with_partition_owners(vec![local()]));
        let catalog = catalog(directory.clone());
        let target = address("fresh");

        let (record, init) = catalog
            .get_or_create_inner(&target, Some(PlacementStrategy::PreferLocal))
            .expect("create");
        init.expect("new activation")
            .await
            .expect("join")
            .expect("init");

        assert!(record.lock().grain().is_some());
        let registered = directory.full_lookup(&target.grain).await.expect("lookup");
        assert_eq!(registered, vec![target]);
    }

    #[tokio::test]
    async fn test_duplicate_activation_loses_to_directory_winner() {
        let directory = Arc::new(InMemoryDirectory::with_partition_owners(vec![local()]));
        let catalog = catalog(directory.clone());
        let winner = address("dup");
        directory
            .register_single_activation(winner.clone())
            .await
            .expect("seed winner");

        let loser = address("dup");
        let (record, init) = catalog
            .get_or_create_inner(&loser, Some(PlacementStrategy::PreferLocal))
            .expect("create");
        let err = init
            .expect("new activation")
            .await
            .expect("join")
            .expect_err("loses registration");

        assert!(matches!(err, ActivationError::Duplicate(ref w) if *w == winner));
        assert_eq!(record.state(), ActivationState::Invalid);
        assert_eq!(record.lock().forwarding_address(), Some(&winner));
        assert_eq!(catalog.activation_count(), 0);
        assert_eq!(directory.full_lookup(&winner.grain).await.expect("lookup"), vec![winner]);
    }

    #[tokio::test]
    async fn test_unknown_storage_provider_fails_init() {
        let mut grain_types = GrainTypeRegistry::new();
        grain_types.register(
            GrainTypeData::new(GrainType(1), "Noop", |_| Arc::new(Noop) as Arc<dyn Grain>)
                .storage("nowhere"),
        );
        let directory = Arc::new(InMemoryDirectory::with_partition_owners(vec![local()]));
        let config = Arc::new(SiloConfig::default());
        let catalog = Catalog::new(
            local(),
            config.clone(),
            CatalogServices {
                grain_types: Arc::new(grain_types),
                directory: directory.clone(),
                storage: Arc::new(StorageProviders::new()),
                membership: Arc::new(StaticMembership::new(local())),
                collector: Arc::new(ActivationCollector::new(config.collection.quantum)),
                client: RuntimeClient::new(local(), MessagingConfig::default()),
            },
        );

        let target = address("nostore");
        let (record, init) = catalog
            .get_or_create_inner(&target, Some(PlacementStrategy::PreferLocal))
            .expect("create");
        let err = init
            .expect("new activation")
            .await
            .expect("join")
            .expect_err("no provider");

        assert!(matches!(err, ActivationError::Storage(_)));
        assert_eq!(record.state(), ActivationState::Invalid);
        assert_eq!(directory.entry_count(), 0);
    }
}
