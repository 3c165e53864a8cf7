//! Idle-activation collector: a timing wheel of collection buckets.
//!
//! Going idle puts an activation in the bucket whose deadline is its idle
//! timeout rounded up to the next quantum. A periodic scan (period = quantum)
//! pops every due bucket and re-validates each activation: confirmed idle and
//! stale activations are returned for destruction, the others go back into
//! the wheel. Scheduling, cancelling and rescheduling are O(1).
//!
//! ```text
//!  next_ticket
//!      │
//!      ▼
//!  ┌───────┬───────┬───────┬───────┬─────
//!  │ t=40s │ t=50s │ t=60s │ t=70s │ ...     buckets keyed by ticket
//!  │ a, b  │       │ c     │ d, e  │
//!  └───────┴───────┴───────┴───────┴─────
//! ```
//!
//! # Races
//!
//! A cancel (or reschedule) and a scan can race for the same activation.
//! Whichever side removes the activation's entry from its bucket owns it, and
//! a bucket only claims an activation whose ticket still names that bucket.
//! An activation that moved on after its old bucket was dequeued leaves a
//! stale entry behind, which the scan drops without claiming. Buckets are only
//! created under the ticket lock, so a dequeued quantum is never refilled. No
//! bucket guard is ever held while an activation lock is taken.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::activation::{ActivationInner, ActivationRecord};
use crate::error::CollectorError;
use crate::types::ActivationId;

struct Bucket {
    key: u64,
    items: DashMap<ActivationId, Arc<ActivationRecord>>,
}

impl Bucket {
    fn new(key: u64) -> Self {
        Self {
            key,
            items: DashMap::new(),
        }
    }

    fn add(&self, item: &Arc<ActivationRecord>) {
        self.items.insert(item.activation_id(), item.clone());
    }

    /// Claim and remove `item`. The caller holds the item's lock.
    ///
    /// Only an item whose ticket still names this bucket can be claimed.
    fn try_remove(&self, item: &ActivationRecord, inner: &mut ActivationInner) -> bool {
        if inner.collection.ticket != Some(self.key) || inner.collection.cancelled {
            return false;
        }
        if self.items.remove(&item.activation_id()).is_none() {
            return false;
        }
        inner.collection.cancelled = true;
        true
    }

    /// Empty the bucket. Returns how many entries were removed and the items
    /// claimed by this bucket. Entries left behind by an item that has since
    /// moved to another bucket are removed but not claimed.
    fn drain(&self) -> (usize, Vec<Arc<ActivationRecord>>) {
        let ids: Vec<ActivationId> = self.items.iter().map(|e| *e.key()).collect();
        let mut removed = 0;
        let mut claimed = Vec::new();
        for id in ids {
            let Some((_, item)) = self.items.remove(&id) else {
                continue;
            };
            removed += 1;
            let owned = {
                let mut inner = item.lock();
                inner.collection.ticket == Some(self.key) && inner.collection.try_set_cancelled()
            };
            if owned {
                claimed.push(item);
            }
        }
        (removed, claimed)
    }

    fn snapshot(&self) -> Vec<Arc<ActivationRecord>> {
        self.items.iter().map(|e| e.value().clone()).collect()
    }
}

/// Timing wheel scheduling idle activations for collection.
pub struct ActivationCollector {
    quantum: Duration,
    epoch: Instant,
    next_ticket: Mutex<u64>,
    buckets: DashMap<u64, Arc<Bucket>>,
    count: AtomicUsize,
}

impl ActivationCollector {
    /// Create a collector with the given quantum. The first bucket is due now.
    pub fn new(quantum: Duration) -> Self {
        Self {
            quantum: quantum.max(Duration::from_millis(1)),
            epoch: Instant::now(),
            next_ticket: Mutex::new(0),
            buckets: DashMap::new(),
            count: AtomicUsize::new(0),
        }
    }

    /// Wheel granularity.
    pub fn quantum(&self) -> Duration {
        self.quantum
    }

    /// Activations currently held in buckets.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Buckets currently allocated.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn next_ticket(&self) -> u64 {
        *self.next_ticket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ticket_deadline(&self, ticket: u64) -> Instant {
        let nanos = self.quantum.as_nanos().saturating_mul(u128::from(ticket));
        self.epoch + Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    fn is_expired(&self, ticket: u64) -> bool {
        ticket < self.next_ticket()
    }

    /// Ticket for `timeout` from now. `next` is the first ticket not yet
    /// dequeued, read under the ticket lock.
    fn make_ticket(&self, next: u64, timeout: Duration) -> Result<u64, CollectorError> {
        if timeout < self.quantum {
            return Err(CollectorError::TimeoutBelowQuantum {
                timeout,
                quantum: self.quantum,
            });
        }
        let since_epoch = (Instant::now() + timeout)
            .saturating_duration_since(self.epoch)
            .as_nanos();
        let quantum = self.quantum.as_nanos();
        let ticket = u64::try_from(since_epoch.div_ceil(quantum)).unwrap_or(u64::MAX);
        if ticket < next {
            return Err(CollectorError::TicketExpired);
        }
        Ok(ticket)
    }

    /// Insert into bucket `ticket`. Callers hold the ticket lock so the
    /// bucket cannot be dequeued in between.
    fn add(&self, item: &Arc<ActivationRecord>, inner: &mut ActivationInner, ticket: u64) {
        inner.collection.cancelled = false;
        let bucket = self
            .buckets
            .entry(ticket)
            .or_insert_with(|| Arc::new(Bucket::new(ticket)))
            .clone();
        bucket.add(item);
        self.count.fetch_add(1, Ordering::AcqRel);
        inner.collection.ticket = Some(ticket);
    }

    /// Take `item` out of the bucket named by its ticket.
    fn remove_from_bucket(
        &self,
        item: &ActivationRecord,
        inner: &mut ActivationInner,
        ticket: u64,
    ) -> bool {
        let Some(bucket) = self.buckets.get(&ticket).map(|b| b.value().clone()) else {
            return false;
        };
        if !bucket.try_remove(item, inner) {
            return false;
        }
        self.removed();
        inner.collection.ticket = None;
        true
    }

    fn removed(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Put an idle activation into the wheel, `timeout` from now.
    ///
    /// A zero timeout disables collection and is a no-op. Scheduling an
    /// activation that already holds a ticket is an error.
    pub fn schedule_collection(
        &self,
        item: &Arc<ActivationRecord>,
        timeout: Duration,
    ) -> Result<(), CollectorError> {
        let mut inner = item.lock();
        self.schedule_collection_locked(item, &mut inner, timeout)
    }

    /// [`schedule_collection`](Self::schedule_collection) for callers holding the item's lock.
    pub fn schedule_collection_locked(
        &self,
        item: &Arc<ActivationRecord>,
        inner: &mut ActivationInner,
        timeout: Duration,
    ) -> Result<(), CollectorError> {
        if item.is_exempt_from_collection() {
            return Err(CollectorError::Exempt(item.address().to_string()));
        }
        if timeout.is_zero() {
            return Ok(());
        }
        if inner.collection.ticket.is_some() {
            return Err(CollectorError::AlreadyScheduled(item.address().to_string()));
        }
        let next = self.next_ticket.lock().unwrap_or_else(PoisonError::into_inner);
        let ticket = self.make_ticket(*next, timeout)?;
        self.add(item, inner, ticket);
        Ok(())
    }

    /// Remove an activation from the wheel. Fails if it is not scheduled or a
    /// scan already claimed it.
    pub fn try_cancel_collection(&self, item: &Arc<ActivationRecord>) -> bool {
        if item.is_exempt_from_collection() {
            return false;
        }
        let mut inner = item.lock();
        self.try_cancel_collection_locked(item, &mut inner)
    }

    /// [`try_cancel_collection`](Self::try_cancel_collection) for callers holding the item's lock.
    pub fn try_cancel_collection_locked(
        &self,
        item: &Arc<ActivationRecord>,
        inner: &mut ActivationInner,
    ) -> bool {
        let Some(ticket) = inner.collection.ticket else {
            return false;
        };
        if self.is_expired(ticket) {
            return false;
        }
        self.remove_from_bucket(item, inner, ticket)
    }

    /// Move an activation to the bucket `timeout` from now.
    ///
    /// Returns true if the activation ends up scheduled (including when the
    /// ticket did not change). On failure the activation's ticket is cleared.
    pub fn try_reschedule_collection(&self, item: &Arc<ActivationRecord>, timeout: Duration) -> bool {
        if item.is_exempt_from_collection() {
            return false;
        }
        let mut inner = item.lock();
        self.try_reschedule_collection_locked(item, &mut inner, timeout)
    }

    /// [`try_reschedule_collection`](Self::try_reschedule_collection) for callers holding the item's lock.
    pub fn try_reschedule_collection_locked(
        &self,
        item: &Arc<ActivationRecord>,
        inner: &mut ActivationInner,
        timeout: Duration,
    ) -> bool {
        if item.is_exempt_from_collection() {
            return false;
        }
        if self.reschedule_impl(item, inner, timeout) {
            return true;
        }
        inner.collection.ticket = None;
        false
    }

    fn reschedule_impl(
        &self,
        item: &Arc<ActivationRecord>,
        inner: &mut ActivationInner,
        timeout: Duration,
    ) -> bool {
        let Some(old_ticket) = inner.collection.ticket else {
            return false;
        };
        let next = self.next_ticket.lock().unwrap_or_else(PoisonError::into_inner);
        if old_ticket < *next {
            return false;
        }
        let new_ticket = match self.make_ticket(*next, timeout) {
            Ok(ticket) => ticket,
            Err(err) => {
                tracing::debug!(activation = %item.address(), error = %err, "reschedule rejected");
                self.remove_from_bucket(item, inner, old_ticket);
                return false;
            }
        };
        if new_ticket == old_ticket {
            return true;
        }
        if !self.remove_from_bucket(item, inner, old_ticket) {
            return false;
        }
        self.add(item, inner, new_ticket);
        true
    }

    fn dequeue_quantum(&self, now: Instant) -> Option<(u64, Vec<Arc<ActivationRecord>>)> {
        let key = {
            let mut next = self.next_ticket.lock().unwrap_or_else(PoisonError::into_inner);
            if self.ticket_deadline(*next) > now {
                return None;
            }
            let key = *next;
            *next += 1;
            key
        };

        let items = match self.buckets.remove(&key) {
            Some((_, bucket)) => {
                let (removed, claimed) = bucket.drain();
                self.count.fetch_sub(removed, Ordering::AcqRel);
                claimed
            }
            None => Vec::new(),
        };
        Some((key, items))
    }

    /// Pop every due bucket and return the activations confirmed idle and
    /// stale. Activations that were used in the meantime are rescheduled.
    pub fn scan_stale(&self) -> Vec<Arc<ActivationRecord>> {
        let now = Instant::now();
        let mut stale = Vec::new();
        while let Some((key, items)) = self.dequeue_quantum(now) {
            for item in items {
                let mut inner = item.lock();
                if inner.collection.ticket != Some(key) {
                    // re-added to the wheel since the bucket was claimed
                    continue;
                }
                inner.collection.ticket = None;
                if inner.is_collection_candidate(now) && inner.is_stale(now) {
                    drop(inner);
                    stale.push(item);
                } else {
                    let age_limit = inner.collection_age_limit();
                    if let Err(err) = self.schedule_collection_locked(&item, &mut inner, age_limit) {
                        tracing::warn!(activation = %item.address(), error = %err, "failed to reschedule collection");
                    }
                }
            }
        }
        if !stale.is_empty() {
            tracing::debug!(count = stale.len(), "scan found stale activations");
        }
        stale
    }

    /// Forced scan over every bucket for activations idle at least `age_limit`.
    ///
    /// Works on a point-in-time copy of the buckets and their items; items
    /// added during the scan are not visited. Each returned activation was
    /// claimed from the bucket its ticket names, so no activation is returned twice
    /// and none is returned by a concurrent `scan_stale` as well.
    pub fn scan_all(&self, age_limit: Duration) -> Vec<Arc<ActivationRecord>> {
        let now = Instant::now();
        let buckets: Vec<Arc<Bucket>> = self.buckets.iter().map(|b| b.value().clone()).collect();
        let mut result = Vec::new();
        for bucket in buckets {
            for item in bucket.snapshot() {
                let mut inner = item.lock();
                if inner.is_collection_candidate(now)
                    && inner.idleness(now) >= age_limit
                    && bucket.try_remove(&item, &mut inner)
                {
                    self.removed();
                    inner.collection.ticket = None;
                    drop(inner);
                    result.push(item);
                }
            }
        }
        result
    }
}

impl fmt::Debug for ActivationCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationCollector")
            .field("quantum", &self.quantum)
            .field("count", &self.count())
            .field("buckets", &self.bucket_count())
            .field("next_ticket", &self.next_ticket())
            .finish()
    }
}
