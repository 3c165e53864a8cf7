//! Placement: per-grain-type strategy and the director that interprets it.
//!
//! Placement separates two concerns:
//!
//! - **[`PlacementStrategy`]**: a closed set of policies declared per grain
//!   type, saying *what* the grain wants.
//! - **[`PlacementDirector`]**: the algorithm that, given the strategy and
//!   a [`PlacementContext`], returns the target activation and whether it is
//!   a brand new placement.
//!
//! The policies' load-balancing algorithms live outside this crate; the
//! [`DefaultPlacementDirector`] only implements the directory-first
//! resolution and simple silo choices needed to run a silo.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::directory::GrainDirectory;
use crate::error::PlacementError;
use crate::types::{ActivationAddress, ActivationId, GrainId, SiloAddress};

/// Placement policy for new activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlacementStrategy {
    /// Any active silo, uniformly at random.
    #[default]
    Random,
    /// The caller's silo when it is active, otherwise random.
    PreferLocal,
    /// Always local; between `min` and `max` activations per silo (stateless workers).
    Local {
        /// Activations created before existing ones are reused.
        min: usize,
        /// Upper bound of local activations.
        max: usize,
    },
    /// Least loaded silo.
    LoadAware,
    /// A specific silo.
    Explicit(SiloAddress),
    /// Co-locate frequently communicating grains.
    GraphPartition,
}

impl PlacementStrategy {
    /// True for strategies that allow many activations of one grain.
    pub fn is_multi_activation(&self) -> bool {
        matches!(self, Self::Local { .. })
    }
}

/// Where a message should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementResult {
    /// Target activation.
    pub address: ActivationAddress,
    /// True if the activation does not exist yet.
    pub is_new_placement: bool,
    /// Strategy that produced the decision.
    pub strategy: PlacementStrategy,
}

/// Silo-side view the director decides with. Implemented by the catalog.
pub trait PlacementContext: Send + Sync {
    /// This silo.
    fn local_silo(&self) -> SiloAddress;

    /// Silos currently accepting new activations.
    fn active_silos(&self) -> Vec<SiloAddress>;

    /// Live local activations of `grain`.
    fn local_activations(&self, grain: &GrainId) -> Vec<ActivationAddress>;
}

/// Placement collaborator.
#[async_trait]
pub trait PlacementDirector: fmt::Debug + Send + Sync {
    /// Resolve `target` to an existing activation or choose a new one.
    async fn select_or_add_target(
        &self,
        sender: Option<&ActivationAddress>,
        target: &GrainId,
        context: &dyn PlacementContext,
        strategy: &PlacementStrategy,
    ) -> Result<PlacementResult, PlacementError>;
}

/// Directory-first director with simple silo selection.
#[derive(Debug)]
pub struct DefaultPlacementDirector {
    directory: Arc<dyn GrainDirectory>,
}

impl DefaultPlacementDirector {
    /// Create a director backed by `directory`.
    pub fn new(directory: Arc<dyn GrainDirectory>) -> Self {
        Self { directory }
    }

    fn choose_silo(
        target: &GrainId,
        context: &dyn PlacementContext,
        strategy: &PlacementStrategy,
    ) -> Result<SiloAddress, PlacementError> {
        let local = context.local_silo();
        let active = context.active_silos();
        match strategy {
            PlacementStrategy::Local { .. } => Ok(local),
            PlacementStrategy::PreferLocal if active.contains(&local) => Ok(local),
            PlacementStrategy::Explicit(silo) => {
                if active.contains(silo) {
                    Ok(*silo)
                } else {
                    Err(PlacementError::NoCandidates(target.clone()))
                }
            }
            _ => pick_random(&active).ok_or_else(|| PlacementError::NoCandidates(target.clone())),
        }
    }
}

fn pick_random<T: Clone>(candidates: &[T]) -> Option<T> {
    candidates.choose(&mut rand::thread_rng()).cloned()
}

#[async_trait]
impl PlacementDirector for DefaultPlacementDirector {
    async fn select_or_add_target(
        &self,
        _sender: Option<&ActivationAddress>,
        target: &GrainId,
        context: &dyn PlacementContext,
        strategy: &PlacementStrategy,
    ) -> Result<PlacementResult, PlacementError> {
        if let PlacementStrategy::Local { min, max } = *strategy {
            let local = context.local_activations(target);
            let wanted = min.max(1).min(max.max(1));
            if local.len() >= wanted {
                if let Some(existing) = pick_random(&local) {
                    return Ok(PlacementResult {
                        address: existing,
                        is_new_placement: false,
                        strategy: *strategy,
                    });
                }
            }
        } else {
            let existing = match self.directory.local_lookup(target) {
                Some(cached) if !cached.is_empty() => cached,
                _ => self.directory.full_lookup(target).await?,
            };
            if let Some(address) = existing.into_iter().next() {
                return Ok(PlacementResult {
                    address,
                    is_new_placement: false,
                    strategy: *strategy,
                });
            }
        }

        if target.is_client() {
            return Err(PlacementError::UnregisteredClient(target.clone()));
        }

        let silo = Self::choose_silo(target, context, strategy)?;
        Ok(PlacementResult {
            address: ActivationAddress::new(silo, target.clone(), ActivationId::new_random()),
            is_new_placement: true,
            strategy: *strategy,
        })
    }
}
