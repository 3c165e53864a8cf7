//! Silo host: wires the runtime core together and runs its background tasks.
//!
//! ```text
//!            ┌───────────────┐   loopback   ┌────────────┐
//! callers ──►│ RuntimeClient │──► transport ─►│ receive    │
//!            └───────▲───────┘              │ pump task  │
//!                    │ responses            └─────┬──────┘
//!            ┌───────┴───────┐                    ▼
//!            │  Dispatcher   │◄──────── receive_message
//!            └───────┬───────┘
//!                    ▼
//!            ┌───────────────┐   every quantum  ┌──────────────┐
//!            │    Catalog    │◄─────────────────│ collection   │
//!            └───────────────┘   collect_stale  │ timer task   │
//!                                               └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let silo = SiloBuilder::new()
//!     .silo(SiloAddress::localhost(11111, 1))
//!     .config(SiloConfig::builder().collection_quantum(Duration::from_secs(10)).build())
//!     .grain_type(GrainTypeData::new(GrainType(1), "Counter", |_| Arc::new(Counter::default())))
//!     .start()?;
//!
//! let reply = silo.call(GrainId::new(GrainType(1), "a"), 1, 1, Vec::new()).await?;
//! silo.stop().await?;
//! ```

use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::activation::{ActivationRecord, DeactivationReason};
use crate::catalog::{Catalog, CatalogServices};
use crate::client::RuntimeClient;
use crate::collector::ActivationCollector;
use crate::config::SiloConfig;
use crate::directory::{GrainDirectory, InMemoryDirectory};
use crate::dispatcher::{Dispatcher, DispatcherServices};
use crate::error::{RequestError, SiloError};
use crate::grain::{GrainTypeData, GrainTypeRegistry};
use crate::membership::{SiloStatus, SiloStatusListener, SiloStatusOracle, StaticMembership};
use crate::message::{Message, MessageFlags};
use crate::placement::{DefaultPlacementDirector, PlacementDirector};
use crate::scheduler::{TokioScheduler, WorkScheduler};
use crate::storage::{StorageProvider, StorageProviders};
use crate::transport::{LocalTransport, MessageTransport};
use crate::types::{ActivationAddress, GrainId, SiloAddress};

/// Forwards membership changes to the catalog without keeping it alive.
struct CatalogListener(Weak<Catalog>);

impl SiloStatusListener for CatalogListener {
    fn silo_status_change_notification(&self, silo: SiloAddress, status: SiloStatus) {
        if let Some(catalog) = self.0.upgrade() {
            catalog.silo_status_change_notification(silo, status);
        }
    }
}

/// Builder for a [`Silo`].
pub struct SiloBuilder {
    silo: SiloAddress,
    config: SiloConfig,
    grain_types: GrainTypeRegistry,
    storage: StorageProviders,
    directory: Option<Arc<dyn GrainDirectory>>,
    membership: Option<Arc<StaticMembership>>,
    placement: Option<Arc<dyn PlacementDirector>>,
    scheduler: Option<Arc<dyn WorkScheduler>>,
    remote: Option<Arc<dyn MessageTransport>>,
}

impl Default for SiloBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SiloBuilder {
    /// Builder with default configuration listening on `127.0.0.1:11111`.
    pub fn new() -> Self {
        Self {
            silo: SiloAddress::localhost(11111, 1),
            config: SiloConfig::default(),
            grain_types: GrainTypeRegistry::new(),
            storage: StorageProviders::new(),
            directory: None,
            membership: None,
            placement: None,
            scheduler: None,
            remote: None,
        }
    }

    /// Address of this silo.
    pub fn silo(mut self, silo: SiloAddress) -> Self {
        self.silo = silo;
        self
    }

    /// Runtime configuration.
    pub fn config(mut self, config: SiloConfig) -> Self {
        self.config = config;
        self
    }

    /// Runtime configuration from a JSON document.
    pub fn config_json(mut self, json: &str) -> Result<Self, SiloError> {
        self.config = SiloConfig::from_json(json)?;
        Ok(self)
    }

    /// Register a grain type.
    pub fn grain_type(mut self, data: GrainTypeData) -> Self {
        self.grain_types.register(data);
        self
    }

    /// Register a named storage provider.
    pub fn storage_provider(mut self, name: impl Into<String>, provider: Arc<dyn StorageProvider>) -> Self {
        self.storage.add(name, provider);
        self
    }

    /// Use `directory` instead of a private in-memory one.
    pub fn directory(mut self, directory: Arc<dyn GrainDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Use a shared membership view.
    pub fn membership(mut self, membership: Arc<StaticMembership>) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Use a custom placement director.
    pub fn placement(mut self, placement: Arc<dyn PlacementDirector>) -> Self {
        self.placement = Some(placement);
        self
    }

    /// Use a custom work scheduler.
    pub fn scheduler(mut self, scheduler: Arc<dyn WorkScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Route messages for other silos through `remote`.
    pub fn remote_transport(mut self, remote: Arc<dyn MessageTransport>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Wire the runtime and spawn its background tasks on the current tokio
    /// runtime.
    pub fn start(self) -> Result<Silo, SiloError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| SiloError::NoRuntime)?;
        let local = self.silo;
        let config = Arc::new(self.config);

        let membership = self
            .membership
            .unwrap_or_else(|| Arc::new(StaticMembership::new(local)));
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(InMemoryDirectory::with_partition_owners(vec![local])));
        let placement = self
            .placement
            .unwrap_or_else(|| Arc::new(DefaultPlacementDirector::new(directory.clone())));
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(TokioScheduler::new()));

        let (transport, mut inbound) = LocalTransport::new(local);
        let transport = match self.remote {
            Some(remote) => transport.with_remote(remote),
            None => transport,
        };

        let collector = Arc::new(ActivationCollector::new(config.collection.quantum));
        let client = RuntimeClient::new(local, config.messaging.clone());
        let catalog = Catalog::new(
            local,
            config.clone(),
            CatalogServices {
                grain_types: Arc::new(self.grain_types),
                directory: directory.clone(),
                storage: Arc::new(self.storage),
                membership: membership.clone(),
                collector: collector.clone(),
                client: client.clone(),
            },
        );
        let dispatcher = Dispatcher::new(
            config.messaging.clone(),
            catalog.clone(),
            client.clone(),
            DispatcherServices {
                placement,
                transport: Arc::new(transport),
                scheduler,
            },
        );
        membership.subscribe(Arc::new(CatalogListener(Arc::downgrade(&catalog))));

        let receive_task = {
            let dispatcher = dispatcher.clone();
            handle.spawn(async move {
                while let Some(message) = inbound.recv().await {
                    dispatcher.receive_message(message);
                }
                tracing::debug!("receive pump stopped");
            })
        };

        let collection_task = {
            let catalog = Arc::downgrade(&catalog);
            let quantum = collector.quantum();
            handle.spawn(async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + quantum, quantum);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let Some(catalog) = catalog.upgrade() else {
                        break;
                    };
                    tokio::spawn(async move {
                        catalog.collect_stale().await;
                    });
                }
            })
        };

        tracing::info!(silo = %local, quantum = ?collector.quantum(), "silo started");
        Ok(Silo {
            local,
            config,
            membership,
            directory,
            catalog,
            dispatcher,
            client,
            tasks: vec![receive_task, collection_task],
        })
    }
}

/// A running silo.
pub struct Silo {
    local: SiloAddress,
    config: Arc<SiloConfig>,
    membership: Arc<StaticMembership>,
    directory: Arc<dyn GrainDirectory>,
    catalog: Arc<Catalog>,
    dispatcher: Arc<Dispatcher>,
    client: Arc<RuntimeClient>,
    tasks: Vec<JoinHandle<()>>,
}

impl Silo {
    /// Start building a silo.
    pub fn builder() -> SiloBuilder {
        SiloBuilder::new()
    }

    /// This silo's address.
    pub fn address(&self) -> SiloAddress {
        self.local
    }

    /// Configuration in effect.
    pub fn config(&self) -> &SiloConfig {
        &self.config
    }

    /// Activation catalog.
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Message dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Outstanding-request table.
    pub fn client(&self) -> &Arc<RuntimeClient> {
        &self.client
    }

    /// Membership view.
    pub fn membership(&self) -> &Arc<StaticMembership> {
        &self.membership
    }

    /// Grain directory.
    pub fn directory(&self) -> &Arc<dyn GrainDirectory> {
        &self.directory
    }

    /// Call a grain method from outside any grain.
    pub async fn call(
        &self,
        target: GrainId,
        interface_id: u32,
        method_id: u32,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, RequestError> {
        self.call_with_flags(target, interface_id, method_id, body, MessageFlags::empty())
            .await
    }

    /// [`call`](Self::call) with interleaving flags.
    pub async fn call_with_flags(
        &self,
        target: GrainId,
        interface_id: u32,
        method_id: u32,
        body: Vec<u8>,
        flags: MessageFlags,
    ) -> Result<Vec<u8>, RequestError> {
        let message = Message::request(target, interface_id, method_id, body).with_flags(flags);
        self.client.send_request(message).await
    }

    /// Send a one-way message from outside any grain.
    pub fn send_one_way(
        &self,
        target: GrainId,
        interface_id: u32,
        method_id: u32,
        body: Vec<u8>,
    ) -> Result<(), RequestError> {
        self.client
            .send_one_way(Message::one_way(target, interface_id, method_id, body))
    }

    /// Create a system grain on this silo.
    pub async fn create_system_grain(&self, grain: GrainId) -> Result<Arc<ActivationRecord>, SiloError> {
        Ok(self.catalog.create_system_grain(grain).await?)
    }

    /// Directory entries for `grain`.
    pub async fn lookup(&self, grain: &GrainId) -> Result<Vec<ActivationAddress>, SiloError> {
        Ok(self.directory.full_lookup(grain).await?)
    }

    /// Gracefully stop: reject new requests, deactivate every activation,
    /// then stop the background tasks.
    pub async fn stop(&self) -> Result<(), SiloError> {
        if self.membership.current_status().is_terminating() {
            return Err(SiloError::ShuttingDown);
        }
        tracing::info!(silo = %self.local, activations = self.catalog.activation_count(), "silo stopping");
        self.membership.update_status(self.local, SiloStatus::ShuttingDown);
        self.catalog.deactivate_all(DeactivationReason::SiloShutdown).await;
        self.membership.update_status(self.local, SiloStatus::Dead);
        for task in &self.tasks {
            task.abort();
        }
        tracing::info!(silo = %self.local, "silo stopped");
        Ok(())
    }
}

impl Drop for Silo {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Silo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Silo")
            .field("address", &self.local)
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}
