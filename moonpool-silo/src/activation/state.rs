//! Activation lifecycle state machine and deactivation reasons.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Activation lifecycle state.
///
/// # State Transitions
///
/// ```text
/// Create → Activating → Inactive → Deactivating → Invalid
///    └──────────┴───────────┴─────────────────────→ Invalid (failure)
/// ```
///
/// States only move forward. `Invalid` is terminal; a record in that state
/// is only kept to forward or reject late messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ActivationState {
    /// Placeholder registered; grain not yet constructed.
    Create,
    /// State load, directory registration or activate hook in progress.
    Activating,
    /// Ready to run turns.
    Inactive,
    /// Deactivate hook and unregistration in progress.
    Deactivating,
    /// Disposed.
    Invalid,
}

impl ActivationState {
    /// Check if `next` is a legal successor.
    pub fn can_transition_to(&self, next: ActivationState) -> bool {
        use ActivationState::*;
        matches!(
            (self, next),
            (Create, Activating)
                | (Activating, Inactive)
                | (Inactive, Deactivating)
                | (Create | Activating, Deactivating)
                | (Create | Activating | Inactive | Deactivating, Invalid)
        )
    }

    /// Only `Inactive` activations accept turns.
    pub fn is_usable(&self) -> bool {
        matches!(self, ActivationState::Inactive)
    }

    /// Check if this is the terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActivationState::Invalid)
    }
}

impl fmt::Display for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why an activation is being deactivated. Passed to the deactivate hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeactivationReason {
    /// Idle longer than its collection age limit.
    IdleCollection,
    /// Admin request (delete grains, forced collection).
    ExplicitRequest,
    /// The grain asked to be deactivated once idle.
    ApplicationRequest,
    /// Directory partition owner left the cluster.
    DirectoryOwnerLost,
    /// This silo is shutting down.
    SiloShutdown,
}

impl DeactivationReason {
    /// True when the silo, not the grain, initiated the deactivation.
    pub fn is_runtime_initiated(&self) -> bool {
        !matches!(self, DeactivationReason::ApplicationRequest)
    }
}
