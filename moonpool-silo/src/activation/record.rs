//! Per-activation control block.
//!
//! An [`ActivationRecord`] owns everything the runtime tracks about one
//! activation: lifecycle state, mailbox, running-turn bookkeeping, idle
//! collection metadata, keep-alive deadline and forwarding address.
//!
//! # Locking
//!
//! All mutable state sits behind one instance lock ([`ActivationInner`]).
//! The dispatcher, catalog and collector take it for short, non-blocking
//! critical sections and never await while holding it. Components that
//! already hold the lock use the `ActivationInner` methods directly; the
//! `ActivationRecord` methods lock for you.
//!
//! # Interleaving
//!
//! A turn may start alongside already running turns when, for every running
//! turn that is not itself always-interleave, either both turns are
//! read-only, the grain type is reentrant, or the incoming turn is flagged
//! always-interleave.

use std::collections::VecDeque;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use super::state::{ActivationState, DeactivationReason};
use crate::config::LimitValue;
use crate::error::{EnqueueError, LimitExceeded};
use crate::grain::{Grain, GrainTypeData};
use crate::message::{Message, MessageFlags};
use crate::types::{ActivationAddress, ActivationId, CorrelationId, GrainId};

/// Keep-alive used when `now + duration` does not fit in an `Instant`.
const KEEP_ALIVE_FOREVER: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Action run once the activation next becomes idle.
pub type OnInactiveAction = Box<dyn FnOnce() + Send>;

/// A turn currently executing on the activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningTurn {
    /// Correlation id of the message.
    pub id: CorrelationId,
    /// Read-only flag of the message.
    pub read_only: bool,
    /// Always-interleave flag of the message.
    pub always_interleave: bool,
    /// Whether completing the turn counts as activity.
    pub suppress_keep_alive: bool,
    /// When the turn was dispatched.
    pub started: Instant,
}

impl RunningTurn {
    fn from_message(message: &Message) -> Self {
        Self {
            id: message.id,
            read_only: message.is_read_only(),
            always_interleave: message.is_always_interleave(),
            suppress_keep_alive: message.flags.contains(MessageFlags::SUPPRESS_KEEP_ALIVE),
            started: Instant::now(),
        }
    }
}

/// Collection bookkeeping shared with the activation collector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CollectionSlot {
    /// Wheel bucket currently holding the activation.
    pub(crate) ticket: Option<u64>,
    /// Set by whichever side (cancel or scan) claims the ticket first.
    pub(crate) cancelled: bool,
}

impl CollectionSlot {
    pub(crate) fn try_set_cancelled(&mut self) -> bool {
        if self.ticket.is_some() && !self.cancelled {
            self.cancelled = true;
            true
        } else {
            false
        }
    }
}

/// Mutable state of an activation, guarded by the record's instance lock.
pub struct ActivationInner {
    state: ActivationState,
    grain: Option<Arc<dyn Grain>>,
    mailbox: VecDeque<Message>,
    running: Option<RunningTurn>,
    interleaved: Vec<RunningTurn>,
    became_idle: Instant,
    keep_alive_until: Option<Instant>,
    pub(crate) collection: CollectionSlot,
    collection_age_limit: Duration,
    forwarding_address: Option<ActivationAddress>,
    on_inactive: Vec<OnInactiveAction>,
    shutting_down: bool,
    deactivation_reason: Option<DeactivationReason>,
}

impl ActivationInner {
    fn new(collection_age_limit: Duration) -> Self {
        Self {
            state: ActivationState::Create,
            grain: None,
            mailbox: VecDeque::new(),
            running: None,
            interleaved: Vec::new(),
            became_idle: Instant::now(),
            keep_alive_until: None,
            collection: CollectionSlot::default(),
            collection_age_limit,
            forwarding_address: None,
            on_inactive: Vec::new(),
            shutting_down: false,
            deactivation_reason: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ActivationState {
        self.state
    }

    /// Move to `next` if the transition is legal. Returns whether it moved.
    pub fn set_state(&mut self, next: ActivationState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Grain instance, once constructed.
    pub fn grain(&self) -> Option<Arc<dyn Grain>> {
        self.grain.clone()
    }

    pub(crate) fn set_grain(&mut self, grain: Arc<dyn Grain>) {
        self.grain = Some(grain);
    }

    /// Append to the mailbox. Fails once the activation is invalid.
    pub fn enqueue_message(&mut self, message: Message) -> Result<(), EnqueueError> {
        if self.state.is_terminal() {
            return Err(EnqueueError::Invalid(message.target_grain.to_string()));
        }
        self.mailbox.push_back(message);
        Ok(())
    }

    /// Head of the mailbox.
    pub fn peek_next(&self) -> Option<&Message> {
        self.mailbox.front()
    }

    /// Pop the head of the mailbox.
    pub fn dequeue_next(&mut self) -> Option<Message> {
        self.mailbox.pop_front()
    }

    /// Mailbox length.
    pub fn waiting_count(&self) -> usize {
        self.mailbox.len()
    }

    /// Number of turns currently executing.
    pub fn running_count(&self) -> usize {
        self.running.iter().count() + self.interleaved.len()
    }

    /// The first turn that started among those still running.
    pub fn running(&self) -> Option<&RunningTurn> {
        self.running.as_ref()
    }

    /// True when `message` may start now given the running turns.
    pub fn may_interleave(&self, message: &Message, reentrant: bool) -> bool {
        if reentrant || message.is_always_interleave() {
            return true;
        }
        let incoming_read_only = message.is_read_only();
        self.running
            .iter()
            .chain(self.interleaved.iter())
            .filter(|turn| !turn.always_interleave)
            .all(|turn| turn.read_only && incoming_read_only)
    }

    /// True when `message` may be dispatched immediately.
    pub fn may_accept(&self, message: &Message, reentrant: bool) -> bool {
        self.state.is_usable()
            && (self.running.is_none() || self.may_interleave(message, reentrant))
    }

    /// Mark `message` as executing.
    pub fn record_running(&mut self, message: &Message) {
        let turn = RunningTurn::from_message(message);
        if self.running.is_none() {
            self.running = Some(turn);
        } else {
            self.interleaved.push(turn);
        }
    }

    /// Mark the turn of `id` as finished. Returns the finished turn.
    ///
    /// When the first running turn finishes while interleaved turns are still
    /// executing, the oldest of them takes its place.
    pub fn reset_running(&mut self, id: CorrelationId) -> Option<RunningTurn> {
        let finished = if self.running.as_ref().map(|t| t.id) == Some(id) {
            let finished = self.running.take();
            if !self.interleaved.is_empty() {
                self.running = Some(self.interleaved.remove(0));
            }
            finished
        } else {
            let index = self.interleaved.iter().position(|t| t.id == id)?;
            Some(self.interleaved.remove(index))
        };

        if let Some(turn) = &finished {
            if !turn.suppress_keep_alive && self.running.is_none() {
                self.became_idle = Instant::now();
            }
        }
        finished
    }

    /// No running turn and an empty mailbox.
    pub fn is_inactive(&self) -> bool {
        self.running.is_none() && self.mailbox.is_empty()
    }

    /// Time since the activation last became idle; zero while busy.
    pub fn idleness(&self, now: Instant) -> Duration {
        if self.is_inactive() {
            now.saturating_duration_since(self.became_idle)
        } else {
            Duration::ZERO
        }
    }

    /// Idle for at least the collection age limit.
    pub fn is_stale(&self, now: Instant) -> bool {
        self.collection_age_limit <= self.idleness(now)
    }

    /// Protected by an unexpired keep-alive.
    pub fn should_be_kept_alive(&self, now: Instant) -> bool {
        self.keep_alive_until.map_or(false, |until| until >= now)
    }

    /// Usable, idle, and not kept alive.
    pub fn is_collection_candidate(&self, now: Instant) -> bool {
        self.state.is_usable() && self.is_inactive() && !self.should_be_kept_alive(now)
    }

    /// Idle age limit.
    pub fn collection_age_limit(&self) -> Duration {
        self.collection_age_limit
    }

    pub(crate) fn set_collection_age_limit(&mut self, limit: Duration) {
        self.collection_age_limit = limit;
    }

    /// Extend the keep-alive by `duration`, or clear it when zero.
    pub fn delay_deactivation(&mut self, duration: Duration) {
        if duration.is_zero() {
            self.keep_alive_until = None;
            return;
        }
        let now = Instant::now();
        self.keep_alive_until = Some(
            now.checked_add(duration)
                .unwrap_or_else(|| now + KEEP_ALIVE_FOREVER),
        );
    }

    /// Drop any keep-alive.
    pub fn reset_keep_alive(&mut self) {
        self.keep_alive_until = None;
    }

    /// Keep-alive deadline, if any.
    pub fn keep_alive_until(&self) -> Option<Instant> {
        self.keep_alive_until
    }

    /// Forwarding address (only meaningful once invalid).
    pub fn forwarding_address(&self) -> Option<&ActivationAddress> {
        self.forwarding_address.as_ref()
    }

    pub(crate) fn set_forwarding_address(&mut self, address: Option<ActivationAddress>) {
        self.forwarding_address = address;
    }

    /// Queue an action for the next time the activation is idle.
    pub fn add_on_inactive(&mut self, action: OnInactiveAction) {
        self.on_inactive.push(action);
    }

    /// Take the queued on-inactive actions if the activation is idle now.
    pub fn take_on_inactive_if_idle(&mut self) -> Vec<OnInactiveAction> {
        if self.is_inactive() {
            std::mem::take(&mut self.on_inactive)
        } else {
            Vec::new()
        }
    }

    /// Remove every queued message.
    pub fn take_pending(&mut self) -> Vec<Message> {
        self.mailbox.drain(..).collect()
    }

    /// Mark for shutdown. Returns false if it already was.
    pub fn start_shutting_down(&mut self, reason: DeactivationReason) -> bool {
        if self.shutting_down {
            return false;
        }
        self.shutting_down = true;
        self.deactivation_reason = Some(reason);
        true
    }

    /// True once shutdown was requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Reason given when shutdown was requested.
    pub fn deactivation_reason(&self) -> Option<DeactivationReason> {
        self.deactivation_reason
    }

    /// Number of requests counted against the overload limit.
    pub fn request_count(&self) -> usize {
        self.waiting_count() + self.running_count()
    }
}

/// Control block of one activation.
pub struct ActivationRecord {
    address: ActivationAddress,
    type_data: Arc<GrainTypeData>,
    limit: LimitValue,
    exempt_from_collection: bool,
    created: Instant,
    enqueued_on_dispatcher: AtomicUsize,
    inner: Mutex<ActivationInner>,
    deactivated: watch::Sender<bool>,
}

impl ActivationRecord {
    /// Create a record in state `Create`.
    pub fn new(
        address: ActivationAddress,
        type_data: Arc<GrainTypeData>,
        limit: LimitValue,
        collection_age_limit: Duration,
    ) -> Self {
        let exempt_from_collection = address.grain.is_system();
        let (deactivated, _) = watch::channel(false);
        Self {
            address,
            type_data,
            limit,
            exempt_from_collection,
            created: Instant::now(),
            enqueued_on_dispatcher: AtomicUsize::new(0),
            inner: Mutex::new(ActivationInner::new(collection_age_limit)),
            deactivated,
        }
    }

    /// Take the instance lock.
    pub fn lock(&self) -> MutexGuard<'_, ActivationInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Full address.
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

    /// Static grain type data.
    pub fn type_data(&self) -> &Arc<GrainTypeData> {
        &self.type_data
    }

    /// Grain type permits any interleaving.
    pub fn is_reentrant(&self) -> bool {
        self.type_data.reentrant
    }

    /// Stateless worker.
    pub fn is_stateless_worker(&self) -> bool {
        self.type_data.stateless_worker
    }

    /// Overload limit applied to this activation.
    pub fn limit(&self) -> &LimitValue {
        &self.limit
    }

    /// System activations are never collected.
    pub fn is_exempt_from_collection(&self) -> bool {
        self.exempt_from_collection
    }

    /// Creation time.
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Lifecycle state.
    pub fn state(&self) -> ActivationState {
        self.lock().state()
    }

    /// Append to the mailbox. Fails once the activation is invalid.
    pub fn enqueue_message(&self, message: Message) -> Result<(), EnqueueError> {
        let result = self.lock().enqueue_message(message);
        if let Err(err) = &result {
            tracing::warn!(activation = %self.address, error = %err, "enqueue on invalid activation");
        }
        result
    }

    /// Compare the request count against the overload limit.
    ///
    /// Above the hard limit this is an error; above the soft limit it only
    /// logs.
    pub fn check_overloaded(&self) -> Result<(), LimitExceeded> {
        let count = self.lock().request_count() + self.enqueued_on_dispatcher();
        self.check_overloaded_count(count)
    }

    pub(crate) fn check_overloaded_locked(&self, inner: &ActivationInner) -> Result<(), LimitExceeded> {
        self.check_overloaded_count(inner.request_count() + self.enqueued_on_dispatcher())
    }

    fn check_overloaded_count(&self, count: usize) -> Result<(), LimitExceeded> {
        if self.limit.hard > 0 && count > self.limit.hard {
            return Err(LimitExceeded {
                limit_name: self.limit.name.clone(),
                count,
                hard: self.limit.hard,
            });
        }
        if self.limit.soft > 0 && count > self.limit.soft {
            tracing::warn!(
                activation = %self.address,
                count,
                soft = self.limit.soft,
                "{} soft limit exceeded",
                self.limit.name
            );
        }
        Ok(())
    }

    /// Messages the dispatcher is handling for this activation right now.
    pub fn enqueued_on_dispatcher(&self) -> usize {
        self.enqueued_on_dispatcher.load(Ordering::Acquire)
    }

    pub(crate) fn increment_enqueued_on_dispatcher(&self) {
        self.enqueued_on_dispatcher.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn decrement_enqueued_on_dispatcher(&self) {
        self.enqueued_on_dispatcher.fetch_sub(1, Ordering::AcqRel);
    }

    /// Signal that destroy finished.
    pub(crate) fn notify_deactivated(&self) {
        self.deactivated.send_replace(true);
    }

    /// Wait until the activation was destroyed.
    pub async fn wait_deactivated(&self) {
        let mut receiver = self.deactivated.subscribe();
        let _ = receiver.wait_for(|done| *done).await;
    }

    /// Multi-line status dump for diagnostics.
    pub fn to_detailed_string(&self) -> String {
        let inner = self.lock();
        let now = Instant::now();
        let mut out = format!(
            "{} #{} State={} Waiting={} Running={} Idle={:?} AgeLimit={:?}",
            self.address,
            self.type_data.name,
            inner.state(),
            inner.waiting_count(),
            inner.running_count(),
            inner.idleness(now),
            inner.collection_age_limit(),
        );
        if let Some(until) = inner.keep_alive_until() {
            let _ = write!(out, " KeepAlive={:?}", until.saturating_duration_since(now));
        }
        if let Some(ticket) = inner.collection.ticket {
            let _ = write!(out, " Ticket={}", ticket);
        }
        if let Some(forward) = inner.forwarding_address() {
            let _ = write!(out, " ForwardTo={}", forward);
        }
        if let Some(turn) = inner.running() {
            let _ = write!(
                out,
                "\n   Processing {} for {:?}",
                turn.id,
                now.saturating_duration_since(turn.started)
            );
        }
        for message in inner.mailbox.iter() {
            let _ = write!(out, "\n   Waiting: {}", message);
        }
        out
    }
}

impl fmt::Display for ActivationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.address, self.type_data.name)
    }
}

impl fmt::Debug for ActivationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationRecord")
            .field("address", &self.address)
            .field("grain_type", &self.type_data.name)
            .finish_non_exhaustive()
    }
}
