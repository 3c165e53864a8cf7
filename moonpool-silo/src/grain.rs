//! Grain programming surface: the [`Grain`] trait, per-turn
//! [`GrainContext`], and the startup-built type registry.
//!
//! # Dispatch
//!
//! Every grain type is registered once at silo startup as a
//! [`GrainTypeData`]: a factory plus the scheduling attributes the runtime
//! needs (reentrancy, stateless worker, placement, storage, age limit).
//! Method dispatch goes through [`Grain::invoke`]; grains with many methods
//! can build a [`MethodTable`] keyed by `(interface id, method id)` and
//! delegate to it.
//!
//! # Example
//!
//! ```rust,ignore
//! struct Counter { value: AtomicU64 }
//!
//! fn increment<'a>(g: &'a Counter, _ctx: &'a GrainContext, _body: &'a [u8]) -> MethodFuture<'a> {
//!     Box::pin(async move {
//!         let v = g.value.fetch_add(1, Ordering::SeqCst) + 1;
//!         Ok(v.to_le_bytes().to_vec())
//!     })
//! }
//!
//! let table = MethodTable::new().with(COUNTER, 1, increment);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::activation::{ActivationRecord, DeactivationReason};
use crate::catalog::Catalog;
use crate::client::RuntimeClient;
use crate::error::{GrainError, RequestError};
use crate::message::{CallChainEntry, Message, MessageFlags};
use crate::placement::PlacementStrategy;
use crate::storage::StoredState;
use crate::types::{ActivationAddress, ActivationId, GrainId, GrainType};

/// Application grain behaviour.
///
/// Methods take `&self`: interleaved turns (read-only, reentrant,
/// always-interleave) may run concurrently on one activation, so grain state
/// uses interior mutability.
#[async_trait]
pub trait Grain: Send + Sync + 'static {
    /// Called once after state load and directory registration.
    async fn on_activate(
        &self,
        _ctx: &GrainContext,
        _state: Option<StoredState>,
    ) -> Result<(), GrainError> {
        Ok(())
    }

    /// Called once before the activation is destroyed.
    async fn on_deactivate(
        &self,
        _ctx: &GrainContext,
        _reason: DeactivationReason,
    ) -> Result<(), GrainError> {
        Ok(())
    }

    /// Execute one turn.
    async fn invoke(
        &self,
        ctx: &GrainContext,
        interface_id: u32,
        method_id: u32,
        body: &[u8],
    ) -> Result<Vec<u8>, GrainError>;
}

/// Future returned by a [`MethodFn`].
pub type MethodFuture<'a> = BoxFuture<'a, Result<Vec<u8>, GrainError>>;

/// Typed method entry of a [`MethodTable`].
pub type MethodFn<G> = for<'a> fn(&'a G, &'a GrainContext, &'a [u8]) -> MethodFuture<'a>;

/// `(interface id, method id)` → typed function.
pub struct MethodTable<G> {
    methods: HashMap<(u32, u32), MethodFn<G>>,
}

impl<G> MethodTable<G> {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Add a method.
    pub fn with(mut self, interface_id: u32, method_id: u32, method: MethodFn<G>) -> Self {
        self.methods.insert((interface_id, method_id), method);
        self
    }

    /// Call the registered method, or fail with [`GrainError::UnknownMethod`].
    pub async fn dispatch(
        &self,
        grain: &G,
        ctx: &GrainContext,
        interface_id: u32,
        method_id: u32,
        body: &[u8],
    ) -> Result<Vec<u8>, GrainError> {
        match self.methods.get(&(interface_id, method_id)) {
            Some(method) => method(grain, ctx, body).await,
            None => Err(GrainError::UnknownMethod {
                interface_id,
                method_id,
            }),
        }
    }
}

impl<G> Default for MethodTable<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> fmt::Debug for MethodTable<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("methods", &self.methods.len())
            .finish()
    }
}

/// Creates a grain instance for an identity.
pub type GrainFactory = Arc<dyn Fn(&GrainId) -> Arc<dyn Grain> + Send + Sync>;

/// Static description of a grain type.
#[derive(Clone)]
pub struct GrainTypeData {
    /// Type code.
    pub grain_type: GrainType,
    /// Human-readable type name; keys age-limit overrides and storage.
    pub name: String,
    /// Instance factory.
    pub factory: GrainFactory,
    /// Any two turns may interleave.
    pub reentrant: bool,
    /// Many local activations per grain, no single-activation registration.
    pub stateless_worker: bool,
    /// Strategy for new activations.
    pub placement: PlacementStrategy,
    /// Named storage provider for persisted state.
    pub storage_provider: Option<String>,
    /// Idle age limit overriding the configured ones.
    pub collection_age_limit: Option<Duration>,
}

impl GrainTypeData {
    /// Describe a grain type with default attributes.
    pub fn new(
        grain_type: GrainType,
        name: impl Into<String>,
        factory: impl Fn(&GrainId) -> Arc<dyn Grain> + Send + Sync + 'static,
    ) -> Self {
        Self {
            grain_type,
            name: name.into(),
            factory: Arc::new(factory),
            reentrant: false,
            stateless_worker: false,
            placement: PlacementStrategy::PreferLocal,
            storage_provider: None,
            collection_age_limit: None,
        }
    }

    /// Mark as reentrant.
    pub fn reentrant(mut self) -> Self {
        self.reentrant = true;
        self
    }

    /// Mark as stateless worker with up to `max` local activations.
    pub fn stateless_worker(mut self, max: usize) -> Self {
        self.stateless_worker = true;
        self.placement = PlacementStrategy::Local { min: 1, max };
        self
    }

    /// Override the placement strategy.
    pub fn placement(mut self, strategy: PlacementStrategy) -> Self {
        self.placement = strategy;
        self
    }

    /// Load state from the named provider on activation.
    pub fn storage(mut self, provider: impl Into<String>) -> Self {
        self.storage_provider = Some(provider.into());
        self
    }

    /// Override the idle age limit.
    pub fn collection_age_limit(mut self, limit: Duration) -> Self {
        self.collection_age_limit = Some(limit);
        self
    }
}

impl fmt::Debug for GrainTypeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrainTypeData")
            .field("grain_type", &self.grain_type)
            .field("name", &self.name)
            .field("reentrant", &self.reentrant)
            .field("stateless_worker", &self.stateless_worker)
            .field("placement", &self.placement)
            .field("storage_provider", &self.storage_provider)
            .field("collection_age_limit", &self.collection_age_limit)
            .finish()
    }
}

/// Grain types known to this silo, built at startup.
#[derive(Debug, Clone, Default)]
pub struct GrainTypeRegistry {
    types: HashMap<GrainType, Arc<GrainTypeData>>,
}

impl GrainTypeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type, replacing any previous registration of its code.
    pub fn register(&mut self, data: GrainTypeData) {
        self.types.insert(data.grain_type, Arc::new(data));
    }

    /// Look up a type.
    pub fn get(&self, grain_type: GrainType) -> Option<Arc<GrainTypeData>> {
        self.types.get(&grain_type).cloned()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Per-turn view of the runtime handed to grain code.
#[derive(Clone)]
pub struct GrainContext {
    address: ActivationAddress,
    chain: Vec<CallChainEntry>,
    record: Weak<ActivationRecord>,
    catalog: Weak<Catalog>,
    client: Weak<RuntimeClient>,
}

impl GrainContext {
    pub(crate) fn new(
        record: &Arc<ActivationRecord>,
        catalog: Weak<Catalog>,
        client: Weak<RuntimeClient>,
        chain: Vec<CallChainEntry>,
    ) -> Self {
        Self {
            address: record.address().clone(),
            chain,
            record: Arc::downgrade(record),
            catalog,
            client,
        }
    }

    /// Full address of the running activation.
    pub fn address(&self) -> &ActivationAddress {
        &self.address
    }

    /// Grain identity.
    pub fn grain_id(&self) -> &GrainId {
        &self.address.grain
    }

    /// Activation identity.
    pub fn activation_id(&self) -> ActivationId {
        self.address.activation
    }

    /// Call chain that outgoing requests from this turn carry.
    pub fn call_chain(&self) -> &[CallChainEntry] {
        &self.chain
    }

    fn client(&self) -> Result<Arc<RuntimeClient>, RequestError> {
        self.client
            .upgrade()
            .ok_or_else(|| RequestError::SendFailed("runtime client stopped".into()))
    }

    fn outgoing(&self, mut message: Message, flags: MessageFlags) -> Message {
        message.flags = flags;
        message.sending_silo = Some(self.address.silo);
        message.sending_grain = Some(self.address.grain.clone());
        message.sending_activation = Some(self.address.activation);
        message.call_chain = self.chain.clone();
        message
    }

    /// Call another grain and wait for its response.
    pub async fn call(
        &self,
        target: GrainId,
        interface_id: u32,
        method_id: u32,
        body: Vec<u8>,
        flags: MessageFlags,
    ) -> Result<Vec<u8>, RequestError> {
        let message = self.outgoing(
            Message::request(target, interface_id, method_id, body),
            flags,
        );
        self.client()?.send_request(message).await
    }

    /// Send a one-way message to another grain.
    pub fn send_one_way(
        &self,
        target: GrainId,
        interface_id: u32,
        method_id: u32,
        body: Vec<u8>,
    ) -> Result<(), RequestError> {
        let message = self.outgoing(
            Message::one_way(target, interface_id, method_id, body),
            MessageFlags::empty(),
        );
        self.client()?.send_one_way(message)
    }

    /// Keep this activation alive for at least `duration`; zero clears the keep-alive.
    pub fn delay_deactivation(&self, duration: Duration) {
        if let (Some(record), Some(catalog)) = (self.record.upgrade(), self.catalog.upgrade()) {
            catalog.delay_deactivation(&record, duration);
        }
    }

    /// Deactivate this activation the next time it is idle.
    pub fn deactivate_on_idle(&self) {
        if let (Some(record), Some(catalog)) = (self.record.upgrade(), self.catalog.upgrade()) {
            catalog.deactivate_on_idle(record);
        }
    }
}

impl fmt::Debug for GrainContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrainContext")
            .field("address", &self.address)
            .field("chain", &self.chain.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    fn echo<'a>(_g: &'a Echo, _ctx: &'a GrainContext, body: &'a [u8]) -> MethodFuture<'a> {
        Box::pin(async move { Ok(body.to_vec()) })
    }

    #[async_trait]
    impl Grain for Echo {
        async fn invoke(
            &self,
            _ctx: &GrainContext,
            _interface_id: u32,
            _method_id: u32,
            body: &[u8],
        ) -> Result<Vec<u8>, GrainError> {
            Ok(body.to_vec())
        }
    }

    #[test]
    fn test_grain_type_builder() {
        let data = GrainTypeData::new(GrainType(3), "Worker", |_| Arc::new(Echo) as Arc<dyn Grain>)
            .stateless_worker(8)
            .collection_age_limit(Duration::from_secs(5));

        assert!(data.stateless_worker);
        assert_eq!(data.placement, PlacementStrategy::Local { min: 1, max: 8 });
        assert!(data.placement.is_multi_activation());
        assert_eq!(data.collection_age_limit, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = GrainTypeRegistry::new();
        assert!(registry.is_empty());
        registry.register(GrainTypeData::new(GrainType(1), "Echo", |_| {
            Arc::new(Echo) as Arc<dyn Grain>
        }));

        assert_eq!(registry.len(), 1);
        assert!(registry.get(GrainType(1)).is_some());
        assert!(registry.get(GrainType(2)).is_none());
    }

    #[test]
    fn test_method_table_registration() {
        let table = MethodTable::<Echo>::new().with(1, 1, echo);
        assert_eq!(format!("{:?}", table), "MethodTable { methods: 1 }");
    }
}
