//! Local activation registry.
//!
//! Maps activation ids and grain ids to the records hosted on this silo and
//! keeps per-type counts for statistics. The registry itself is not
//! synchronized: the catalog holds it behind its registry lock.

use std::collections::HashMap;
use std::sync::Arc;

use crate::activation::ActivationRecord;
use crate::types::{ActivationId, GrainId};

/// Local registry of activations.
///
/// A grain normally has one local activation. Several appear transiently
/// during placement races and permanently for stateless workers.
#[derive(Debug, Default)]
pub struct ActivationRegistry {
    activations: HashMap<ActivationId, Arc<ActivationRecord>>,
    by_grain: HashMap<GrainId, Vec<Arc<ActivationRecord>>>,
    per_type: HashMap<String, usize>,
}

impl ActivationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered activations.
    pub fn count(&self) -> usize {
        self.activations.len()
    }

    /// Find an activation by id.
    pub fn find_target(&self, activation: ActivationId) -> Option<Arc<ActivationRecord>> {
        self.activations.get(&activation).cloned()
    }

    /// Every local activation of `grain`, oldest first.
    pub fn find_targets(&self, grain: &GrainId) -> Vec<Arc<ActivationRecord>> {
        self.by_grain.get(grain).cloned().unwrap_or_default()
    }

    /// Number of local activations of `grain`.
    pub fn grain_activation_count(&self, grain: &GrainId) -> usize {
        self.by_grain.get(grain).map_or(0, Vec::len)
    }

    /// Record a new activation. Re-recording the same activation is a no-op.
    pub fn record_new_target(&mut self, target: Arc<ActivationRecord>) {
        if self.activations.contains_key(&target.activation_id()) {
            return;
        }
        self.activations
            .insert(target.activation_id(), target.clone());
        *self
            .per_type
            .entry(target.type_data().name.clone())
            .or_insert(0) += 1;
        self.by_grain
            .entry(target.grain_id().clone())
            .or_default()
            .push(target);
    }

    /// Remove an activation. Returns `true` if it was registered.
    pub fn remove_target(&mut self, target: &ActivationRecord) -> bool {
        if self.activations.remove(&target.activation_id()).is_none() {
            return false;
        }

        let type_name = &target.type_data().name;
        if let Some(count) = self.per_type.get_mut(type_name) {
            *count -= 1;
            if *count == 0 {
                self.per_type.remove(type_name);
            }
        }

        let grain = target.grain_id();
        if let Some(list) = self.by_grain.get_mut(grain) {
            list.retain(|a| a.activation_id() != target.activation_id());
            if list.is_empty() {
                self.by_grain.remove(grain);
            }
        }
        true
    }

    /// Snapshot of every registered activation.
    pub fn all(&self) -> Vec<Arc<ActivationRecord>> {
        self.activations.values().cloned().collect()
    }

    /// `(type name, activation count)` pairs, sorted by name.
    pub fn grain_type_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<_> = self
            .per_type
            .iter()
            .map(|(name, count)| (name.clone(), *count))
            .collect();
        counts.sort();
        counts
    }
}
