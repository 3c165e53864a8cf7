//! Identity types: silos, grains, activations and correlation ids.
//!
//! A grain is a logical actor identity; an activation is one in-memory
//! instance of that grain on one silo. The triple
//! `(silo, grain, activation)` is an [`ActivationAddress`] and is globally
//! unique.
//!
//! # Orleans Reference
//!
//! | moonpool-silo         | Orleans              |
//! |-----------------------|----------------------|
//! | `SiloAddress`         | `SiloAddress`        |
//! | `GrainId`             | `GrainId`            |
//! | `ActivationId`        | `ActivationId`       |
//! | `ActivationAddress`   | `ActivationAddress`  |
//! | `CorrelationId`       | `CorrelationId`      |

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Address of a silo process.
///
/// The generation distinguishes two incarnations of a silo restarted on the
/// same endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SiloAddress {
    /// Network endpoint of the silo.
    pub endpoint: SocketAddr,
    /// Start generation of the silo process.
    pub generation: u64,
}

impl SiloAddress {
    /// Create a silo address.
    pub fn new(endpoint: SocketAddr, generation: u64) -> Self {
        Self {
            endpoint,
            generation,
        }
    }

    /// Convenience constructor for a loopback silo on `port`.
    pub fn localhost(port: u16, generation: u64) -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], port)), generation)
    }
}

impl fmt::Display for SiloAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}@{}", self.endpoint, self.generation)
    }
}

/// Numeric grain type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GrainType(pub u64);

impl fmt::Display for GrainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// What kind of entity a [`GrainId`] names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GrainKind {
    /// Application grain, subject to idle collection.
    Grain,
    /// Client pseudo-grain. Never placed; only reachable through a gateway.
    Client,
    /// Runtime-owned grain, exempt from idle collection.
    System,
}

/// Logical identity of a grain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GrainId {
    /// Grain type code.
    pub grain_type: GrainType,
    /// Application key, unique within the type.
    pub key: String,
    /// Entity kind.
    pub kind: GrainKind,
}

impl GrainId {
    /// Create an application grain id.
    pub fn new(grain_type: GrainType, key: impl Into<String>) -> Self {
        Self {
            grain_type,
            key: key.into(),
            kind: GrainKind::Grain,
        }
    }

    /// Create a system grain id.
    pub fn system(grain_type: GrainType, key: impl Into<String>) -> Self {
        Self {
            kind: GrainKind::System,
            ..Self::new(grain_type, key)
        }
    }

    /// Create a client pseudo-grain id.
    pub fn client(key: impl Into<String>) -> Self {
        Self {
            kind: GrainKind::Client,
            ..Self::new(GrainType(0), key)
        }
    }

    /// True for client pseudo-grains.
    pub fn is_client(&self) -> bool {
        self.kind == GrainKind::Client
    }

    /// True for runtime-owned grains.
    pub fn is_system(&self) -> bool {
        self.kind == GrainKind::System
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            GrainKind::Grain => "grain",
            GrainKind::Client => "client",
            GrainKind::System => "sys",
        };
        write!(f, "{}/{}/{}", prefix, self.grain_type, self.key)
    }
}

/// Identifier of one activation of a grain.
///
/// Randomly generated so that independently created activations on different
/// silos never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivationId(pub u64);

impl ActivationId {
    /// Generate a fresh random activation id.
    pub fn new_random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "act-{:016x}", self.0)
    }
}

/// Fully resolved location of an activation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationAddress {
    /// Hosting silo.
    pub silo: SiloAddress,
    /// Grain identity.
    pub grain: GrainId,
    /// Activation instance.
    pub activation: ActivationId,
}

impl ActivationAddress {
    /// Create an activation address.
    pub fn new(silo: SiloAddress, grain: GrainId, activation: ActivationId) -> Self {
        Self {
            silo,
            grain,
            activation,
        }
    }

    /// Address of a brand new activation of `grain` on `silo`.
    pub fn new_activation(silo: SiloAddress, grain: GrainId) -> Self {
        Self::new(silo, grain, ActivationId::new_random())
    }
}

impl fmt::Display for ActivationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {} {}]", self.silo, self.grain, self.activation)
    }
}

/// Request/response correlation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    /// Generate a fresh random correlation id.
    pub fn new_random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "corr-{:016x}", self.0)
    }
}
