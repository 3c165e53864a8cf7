//! Activations: lifecycle states and the per-activation control block.

mod record;
mod state;

pub use record::{ActivationInner, ActivationRecord, OnInactiveAction, RunningTurn};
pub use state::{ActivationState, DeactivationReason};
