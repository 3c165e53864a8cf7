//! Message pipeline of the silo.
//!
//! The dispatcher decides what happens to every message that reaches the
//! silo and owns the send path for messages leaving it.
//!
//! # Receive
//!
//! ```text
//! receive_message(msg)
//!   ├─ expired → drop
//!   ├─ fault injection (requests only) → reject / drop
//!   ├─ response → RuntimeClient (or gateway proxy)
//!   └─ request / one-way
//!        ├─ silo shutting down → reject
//!        ├─ catalog.get_or_create_activation
//!        │     └─ NonExistentActivation → forward (bounded) or reject
//!        └─ receive_request (under the activation lock)
//!              ├─ Invalid → forwarding address or reject
//!              ├─ may accept → record running, schedule the turn
//!              └─ otherwise → deadlock check, overload check, enqueue
//! ```
//!
//! # Message pump
//!
//! When a turn completes the head of the mailbox is re-examined. Messages
//! are dispatched in FIFO order for as long as the head may interleave with
//! the turns still running; an incompatible head blocks the rest.
//!
//! # Send
//!
//! Unaddressed messages are resolved by the placement director, then handed
//! to the transport. Addressing failures are returned to the sender as
//! unrecoverable rejections.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::FutureExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use crate::activation::{ActivationInner, ActivationRecord, ActivationState};
use crate::catalog::Catalog;
use crate::client::RuntimeClient;
use crate::config::MessagingConfig;
use crate::error::{CatalogError, GrainError};
use crate::grain::GrainContext;
use crate::membership::SiloStatus;
use crate::message::{CallChainEntry, Direction, GrainFault, Message, RejectionType, Response};
use crate::placement::{PlacementDirector, PlacementStrategy};
use crate::scheduler::WorkScheduler;
use crate::transport::MessageTransport;
use crate::types::{ActivationAddress, SiloAddress};

/// Collaborators the dispatcher hands work to.
#[derive(Clone)]
pub struct DispatcherServices {
    /// Resolves unaddressed messages.
    pub placement: Arc<dyn PlacementDirector>,
    /// Wire layer.
    pub transport: Arc<dyn MessageTransport>,
    /// Runs turns.
    pub scheduler: Arc<dyn WorkScheduler>,
}

/// Message pipeline: acceptance, queuing, rejection, turn execution and the
/// send path.
pub struct Dispatcher {
    local_silo: SiloAddress,
    config: MessagingConfig,
    catalog: Arc<Catalog>,
    client: Arc<RuntimeClient>,
    placement: Arc<dyn PlacementDirector>,
    transport: Arc<dyn MessageTransport>,
    scheduler: Arc<dyn WorkScheduler>,
    fault_rng: Mutex<StdRng>,
    weak_self: Weak<Dispatcher>,
}

impl Dispatcher {
    /// Create the dispatcher and attach it to the catalog and client.
    pub fn new(
        config: MessagingConfig,
        catalog: Arc<Catalog>,
        client: Arc<RuntimeClient>,
        services: DispatcherServices,
    ) -> Arc<Self> {
        let fault_rng = match config.fault_injection_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let dispatcher = Arc::new_cyclic(|weak_self| Self {
            local_silo: catalog.local_silo(),
            config,
            catalog: catalog.clone(),
            client: client.clone(),
            placement: services.placement,
            transport: services.transport,
            scheduler: services.scheduler,
            fault_rng: Mutex::new(fault_rng),
            weak_self: weak_self.clone(),
        });
        catalog.attach_dispatcher(&dispatcher);
        client.attach_dispatcher(&dispatcher);
        dispatcher
    }

    /// Messaging configuration in effect.
    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    fn silo_status(&self) -> SiloStatus {
        self.catalog.membership().current_status()
    }

    fn roll(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        let mut rng = self.fault_rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.gen::<f64>() < rate
    }

    /// Entry point for every message arriving at this silo.
    pub fn receive_message(&self, mut message: Message) {
        if message.is_expired() {
            tracing::warn!(%message, "dropping expired message");
            return;
        }

        if message.direction == Direction::Request {
            if self.roll(self.config.rejection_injection_rate) {
                tracing::debug!(%message, "injected rejection");
                self.reject_message(message, RejectionType::Transient, "Injected rejection");
                return;
            }
            if self.roll(self.config.message_loss_injection_rate) {
                tracing::debug!(%message, "injected message loss");
                return;
            }
        }

        for stale in std::mem::take(&mut message.cache_invalidation) {
            self.catalog.directory().invalidate_cache_entry(&stale.grain);
        }

        let Some(target) = message.target_address() else {
            if message.direction == Direction::Response {
                self.deliver_response(message);
            } else {
                tracing::warn!(%message, "received request without a resolved target");
                self.reject_message(
                    message,
                    RejectionType::Unrecoverable,
                    "message is not fully addressed",
                );
            }
            return;
        };
        if message.direction == Direction::Response && message.target_grain.is_client() {
            self.deliver_response(message);
            return;
        }

        if message.is_request_like() && !self.silo_can_accept() {
            self.reject_for_shutdown(message);
            return;
        }

        let placement = if message.is_new_placement {
            message
                .placement
                .or_else(|| self.catalog.placement_strategy(&message.target_grain))
        } else {
            None
        };

        match self.catalog.get_or_create_activation(&target, placement) {
            Ok((record, _)) => {
                if message.direction == Direction::Response {
                    if record.state() == ActivationState::Invalid {
                        tracing::warn!(%message, activation = %target, "response for invalid activation dropped");
                        return;
                    }
                    self.deliver_response(message);
                    return;
                }
                record.increment_enqueued_on_dispatcher();
                self.receive_request(message, &record);
                record.decrement_enqueued_on_dispatcher();
            }
            Err(CatalogError::NonExistentActivation(stale)) => {
                if message.direction == Direction::Response {
                    tracing::warn!(%message, activation = %stale, "response for non-existent activation dropped");
                    self.catalog.directory().invalidate_cache_entry(&stale.grain);
                    return;
                }
                self.forward_to_new_target(message, stale);
            }
            Err(CatalogError::UnknownGrainType(grain_type)) => {
                self.reject_message(
                    message,
                    RejectionType::Unrecoverable,
                    format!("unknown grain type {}", grain_type),
                );
            }
            Err(err) => {
                tracing::warn!(%message, error = %err, "failed to resolve target activation");
                self.reject_message(message, RejectionType::Transient, err.to_string());
            }
        }
    }

    fn deliver_response(&self, message: Message) {
        if self.transport.try_deliver_to_proxy(&message) {
            return;
        }
        self.client.receive_response(message);
    }

    fn silo_can_accept(&self) -> bool {
        !self.silo_status().is_terminating()
    }

    fn reject_for_shutdown(&self, message: Message) {
        let kind = if message.resend_count < self.config.max_resend_count {
            RejectionType::Transient
        } else {
            RejectionType::Unrecoverable
        };
        self.reject_message(
            message,
            kind,
            format!("silo {} is shutting down", self.local_silo),
        );
    }

    /// The target went away: unregister it and send the message on to
    /// whatever the directory resolves next.
    fn forward_to_new_target(&self, mut message: Message, stale: ActivationAddress) {
        tracing::debug!(%message, activation = %stale, "target activation does not exist, forwarding");
        message.add_cache_invalidation(stale.clone());
        self.catalog.directory().invalidate_cache_entry(&stale.grain);

        let Some(dispatcher) = self.weak_self.upgrade() else {
            return;
        };
        match self.config.lazy_unregister_delay {
            None => {
                tokio::spawn(async move {
                    dispatcher.unregister_stale(&stale).await;
                    dispatcher.forward_or_reject(message, &stale);
                });
            }
            Some(delay) => {
                let unregister = dispatcher.clone();
                let delayed = stale.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    unregister.unregister_stale(&delayed).await;
                });
                self.forward_or_reject(message, &stale);
            }
        }
    }

    async fn unregister_stale(&self, stale: &ActivationAddress) {
        if let Err(err) = self.catalog.directory().unregister(stale).await {
            tracing::warn!(activation = %stale, error = %err, "failed to unregister stale activation");
        }
    }

    fn forward_or_reject(&self, message: Message, stale: &ActivationAddress) {
        if self.client.try_forward_message(message.clone(), None) {
            return;
        }
        self.reject_message(
            message,
            RejectionType::Transient,
            format!("non-existent activation {}, forward budget exhausted", stale),
        );
    }

    /// Accept, queue or reject a request for `record`.
    pub fn receive_request(&self, message: Message, record: &Arc<ActivationRecord>) {
        let mut inner = record.lock();
        if inner.state() == ActivationState::Invalid {
            let forward = inner.forwarding_address().cloned();
            drop(inner);
            self.process_request_to_invalid_activation(
                message,
                forward.as_ref(),
                "request for invalid activation",
            );
            return;
        }

        if inner.may_accept(&message, record.is_reentrant()) {
            self.handle_incoming_request(message, record, &mut inner);
            return;
        }

        if self.config.perform_deadlock_detection
            && !record.is_reentrant()
            && message.call_chain_contains(record.activation_id())
        {
            drop(inner);
            self.reply_deadlock(message, record);
            return;
        }

        self.enqueue_request(message, record, &mut inner);
    }

    fn reply_deadlock(&self, message: Message, record: &ActivationRecord) {
        let mut chain = message.call_chain.clone();
        chain.push(CallChainEntry {
            grain: record.grain_id().clone(),
            activation: record.activation_id(),
            interface_id: message.interface_id,
            method_id: message.method_id,
        });
        tracing::warn!(
            %message,
            activation = %record.address(),
            hops = chain.len(),
            "deadlock detected, rejecting request"
        );
        if message.direction == Direction::Request {
            self.send_response(&message, Response::Fault(GrainFault::Deadlock { chain }));
        }
    }

    fn enqueue_request(
        &self,
        message: Message,
        record: &Arc<ActivationRecord>,
        inner: &mut ActivationInner,
    ) {
        if let Err(limit) = record.check_overloaded_locked(inner) {
            tracing::warn!(%message, activation = %record.address(), error = %limit, "activation overloaded");
            self.reject_message(message, RejectionType::Overloaded, limit.to_string());
            return;
        }
        tracing::trace!(%message, activation = %record.address(), waiting = inner.waiting_count(), "enqueued");
        if let Err(err) = inner.enqueue_message(message) {
            tracing::error!(activation = %record.address(), error = %err, "enqueue failed on a live activation");
        }
    }

    /// Handle a message addressed to an activation that no longer accepts
    /// work: forward it to `forward_to`, or reject it.
    pub fn process_request_to_invalid_activation(
        &self,
        mut message: Message,
        forward_to: Option<&ActivationAddress>,
        reason: &str,
    ) {
        if let Some(stale) = message.target_address() {
            message.add_cache_invalidation(stale);
        }
        if let Some(target) = forward_to {
            if self.client.try_forward_message(message.clone(), Some(target)) {
                return;
            }
        }
        self.reject_message(message, RejectionType::Unrecoverable, reason);
    }

    fn handle_incoming_request(
        &self,
        message: Message,
        record: &Arc<ActivationRecord>,
        inner: &mut ActivationInner,
    ) {
        inner.record_running(&message);
        let Some(dispatcher) = self.weak_self.upgrade() else {
            return;
        };
        let turn_record = record.clone();
        self.scheduler.queue_work_item(
            record.activation_id(),
            Box::pin(async move { dispatcher.invoke(turn_record, message).await }),
        );
    }

    async fn invoke(self: Arc<Self>, record: Arc<ActivationRecord>, message: Message) {
        let started = Instant::now();
        let mut chain = message.call_chain.clone();
        chain.push(CallChainEntry {
            grain: record.grain_id().clone(),
            activation: record.activation_id(),
            interface_id: message.interface_id,
            method_id: message.method_id,
        });
        let ctx = GrainContext::new(
            &record,
            Arc::downgrade(&self.catalog),
            Arc::downgrade(&self.client),
            chain,
        );

        let grain = record.lock().grain();
        let outcome = match grain {
            Some(grain) => AssertUnwindSafe(grain.invoke(
                &ctx,
                message.interface_id,
                message.method_id,
                &message.body,
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(GrainError::Failed("grain method panicked".into()))),
            None => Err(GrainError::Failed("activation has no grain instance".into())),
        };

        match (message.direction, outcome) {
            (Direction::Request, Ok(body)) => self.send_response(&message, Response::Success(body)),
            (Direction::Request, Err(err)) => {
                tracing::debug!(%message, error = %err, "grain method failed");
                self.send_response(
                    &message,
                    Response::Fault(GrainFault::Application(err.to_string())),
                );
            }
            (_, Err(err)) => tracing::warn!(%message, error = %err, "one-way grain method failed"),
            (_, Ok(_)) => {}
        }

        let elapsed = started.elapsed();
        if elapsed > self.config.max_request_processing_time {
            tracing::warn!(
                %message,
                activation = %record.address(),
                ?elapsed,
                "turn exceeded the maximum request processing time"
            );
        }
        self.on_activation_completed_request(&record, &message);
    }

    /// A turn of `message` finished: update collection bookkeeping, run the
    /// message pump and the on-idle actions.
    pub fn on_activation_completed_request(&self, record: &Arc<ActivationRecord>, message: &Message) {
        let actions = {
            let mut inner = record.lock();
            inner.reset_running(message.id);
            self.schedule_collection_locked(record, &mut inner);
            self.run_message_pump(record, &mut inner);
            inner.take_on_inactive_if_idle()
        };
        for action in actions {
            action();
        }
    }

    /// Activation init finished: mark the activation usable and start
    /// draining the messages queued while it was activating.
    pub fn on_activate_deactivate_completed(&self, record: &Arc<ActivationRecord>) {
        let actions = {
            let mut inner = record.lock();
            if inner.state() == ActivationState::Activating && inner.set_state(ActivationState::Inactive) {
                self.schedule_collection_locked(record, &mut inner);
                self.run_message_pump(record, &mut inner);
            }
            inner.take_on_inactive_if_idle()
        };
        for action in actions {
            action();
        }
    }

    fn schedule_collection_locked(&self, record: &Arc<ActivationRecord>, inner: &mut ActivationInner) {
        if record.is_exempt_from_collection() {
            return;
        }
        let collector = self.catalog.collector();
        let age_limit = inner.collection_age_limit();
        if collector.try_reschedule_collection_locked(record, inner, age_limit) {
            return;
        }
        if let Err(err) = collector.schedule_collection_locked(record, inner, age_limit) {
            tracing::debug!(activation = %record.address(), error = %err, "not scheduled for collection");
        }
    }

    fn run_message_pump(&self, record: &Arc<ActivationRecord>, inner: &mut ActivationInner) {
        while inner.state().is_usable() {
            let Some(next) = inner.peek_next() else {
                break;
            };
            if !inner.may_accept(next, record.is_reentrant()) {
                break;
            }
            let Some(message) = inner.dequeue_next() else {
                break;
            };
            if message.is_expired() {
                tracing::warn!(%message, activation = %record.address(), "dropping message that expired in the mailbox");
                continue;
            }
            self.handle_incoming_request(message, record, inner);
        }
    }

    /// Send a message. Unaddressed messages are resolved first.
    pub fn send_message(&self, message: Message) {
        if message.direction == Direction::Response {
            self.transport_response(message);
            return;
        }
        if message.is_fully_addressed() {
            self.transport_message(message);
            return;
        }
        let Some(dispatcher) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move { dispatcher.address_message(message).await });
    }

    async fn address_message(&self, mut message: Message) {
        let strategy = match message
            .placement
            .or_else(|| self.catalog.placement_strategy(&message.target_grain))
        {
            Some(strategy) => strategy,
            None if message.target_grain.is_client() => PlacementStrategy::default(),
            None => {
                let reason = format!("unknown grain type {}", message.target_grain.grain_type);
                self.reject_message(message, RejectionType::Unrecoverable, reason);
                return;
            }
        };

        let sender = message.sending_address();
        let resolved = self
            .placement
            .select_or_add_target(
                sender.as_ref(),
                &message.target_grain,
                self.catalog.as_ref(),
                &strategy,
            )
            .await;
        match resolved {
            Ok(result) => {
                message = message.with_target_address(&result.address);
                message.is_new_placement = result.is_new_placement;
                message.placement = Some(result.strategy);
                tracing::trace!(%message, new_placement = result.is_new_placement, "addressed");
                self.transport_message(message);
            }
            Err(err) => {
                tracing::warn!(%message, error = %err, "failed to address message");
                self.reject_message(message, RejectionType::Unrecoverable, err.to_string());
            }
        }
    }

    fn transport_message(&self, message: Message) {
        self.transport.send_message(message);
    }

    fn transport_response(&self, message: Message) {
        if message.target_silo.is_none() {
            tracing::warn!(%message, "response without target silo dropped");
            return;
        }
        self.transport.send_message(message);
    }

    /// Reply to `request` with `response`.
    pub fn send_response(&self, request: &Message, response: Response) {
        self.send_message(request.create_response(response));
    }

    /// Reject a request back to its sender. Other messages are discarded.
    pub fn reject_message(&self, message: Message, kind: RejectionType, reason: impl Into<String>) {
        let reason = reason.into();
        if message.direction != Direction::Request {
            tracing::warn!(%message, %kind, %reason, "discarding message that cannot be rejected");
            return;
        }
        tracing::debug!(%message, %kind, %reason, "rejecting request");
        self.send_message(message.create_rejection(kind, reason));
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("local_silo", &self.local_silo)
            .field("placement", &self.placement)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}
