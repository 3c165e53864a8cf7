//! Silo status view: which silos exist and what state they are in.
//!
//! The [`SiloStatusOracle`] gives the runtime core a read-only view of the
//! cluster and of the local silo's own lifecycle. Status changes reach
//! interested components through [`SiloStatusListener`].
//!
//! [`StaticMembership`] is a simple shared implementation used by
//! single-process silos and tests: statuses are set explicitly and listeners
//! are notified synchronously.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, PoisonError};

use serde::{Deserialize, Serialize};

use crate::types::SiloAddress;

/// Lifecycle status of a silo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SiloStatus {
    /// Process created, not yet joining.
    Created,
    /// Announced, not yet serving.
    Joining,
    /// Serving requests.
    Active,
    /// Graceful shutdown in progress.
    ShuttingDown,
    /// Fast stop in progress.
    Stopping,
    /// Declared dead.
    Dead,
}

impl SiloStatus {
    /// True once the silo began leaving the cluster.
    pub fn is_terminating(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Stopping | Self::Dead)
    }
}

impl fmt::Display for SiloStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "Created",
            Self::Joining => "Joining",
            Self::Active => "Active",
            Self::ShuttingDown => "ShuttingDown",
            Self::Stopping => "Stopping",
            Self::Dead => "Dead",
        };
        f.write_str(name)
    }
}

/// Receives silo status changes.
pub trait SiloStatusListener: Send + Sync {
    /// `silo` moved to `status`.
    fn silo_status_change_notification(&self, silo: SiloAddress, status: SiloStatus);
}

/// Read-only cluster status view.
pub trait SiloStatusOracle: fmt::Debug + Send + Sync {
    /// This silo's address.
    fn local_silo(&self) -> SiloAddress;

    /// This silo's status.
    fn current_status(&self) -> SiloStatus;

    /// Best-known status of every silo.
    fn silo_statuses(&self) -> Vec<(SiloAddress, SiloStatus)>;

    /// Silos currently `Active`.
    fn active_silos(&self) -> Vec<SiloAddress> {
        self.silo_statuses()
            .into_iter()
            .filter(|(_, status)| *status == SiloStatus::Active)
            .map(|(silo, _)| silo)
            .collect()
    }
}

/// Explicitly driven membership table.
pub struct StaticMembership {
    local: SiloAddress,
    statuses: RwLock<HashMap<SiloAddress, SiloStatus>>,
    listeners: RwLock<Vec<Arc<dyn SiloStatusListener>>>,
}

impl StaticMembership {
    /// Membership containing only `local`, in `Active` status.
    pub fn new(local: SiloAddress) -> Self {
        let mut statuses = HashMap::new();
        statuses.insert(local, SiloStatus::Active);
        Self {
            local,
            statuses: RwLock::new(statuses),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener for status changes.
    pub fn subscribe(&self, listener: Arc<dyn SiloStatusListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Record a status change and notify listeners. Repeated statuses are ignored.
    pub fn update_status(&self, silo: SiloAddress, status: SiloStatus) {
        let previous = self
            .statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(silo, status);
        if previous == Some(status) {
            return;
        }

        tracing::info!(silo = %silo, %status, "silo status changed");
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.silo_status_change_notification(silo, status);
        }
    }
}

impl fmt::Debug for StaticMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticMembership")
            .field("local", &self.local)
            .field("statuses", &self.silo_statuses())
            .finish()
    }
}

impl SiloStatusOracle for StaticMembership {
    fn local_silo(&self) -> SiloAddress {
        self.local
    }

    fn current_status(&self) -> SiloStatus {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.local)
            .copied()
            .unwrap_or(SiloStatus::Created)
    }

    fn silo_statuses(&self) -> Vec<(SiloAddress, SiloStatus)> {
        let mut statuses: Vec<_> = self
            .statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(silo, status)| (*silo, *status))
            .collect();
        statuses.sort_by_key(|(silo, _)| *silo);
        statuses
    }
}
