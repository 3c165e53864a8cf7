//! Diagnostic snapshots produced by the catalog.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ActivationAddress, GrainId, SiloAddress};

/// Activation count of one grain type on one silo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrainStatistic {
    /// Registered type name.
    pub grain_type: String,
    /// Reporting silo.
    pub silo: SiloAddress,
    /// Local activations of the type.
    pub activation_count: usize,
}

/// Everything one silo knows about a grain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailedGrainReport {
    /// Grain the report is about.
    pub grain: GrainId,
    /// Reporting silo.
    pub silo: SiloAddress,
    /// Registered type name, if the type is known here.
    pub grain_type: Option<String>,
    /// Silo owning the grain's directory partition.
    pub primary_for_grain: Option<SiloAddress>,
    /// Cached directory entries on this silo.
    pub local_cache_activations: Vec<ActivationAddress>,
    /// Local activations.
    pub local_activations: Vec<ActivationAddress>,
    /// Detailed dump per local activation.
    pub activation_details: Vec<String>,
}

impl fmt::Display for DetailedGrainReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} on {}", self.grain, self.silo)?;
        writeln!(
            f,
            "   type: {}",
            self.grain_type.as_deref().unwrap_or("<unknown>")
        )?;
        match self.primary_for_grain {
            Some(silo) => writeln!(f, "   directory partition owner: {}", silo)?,
            None => writeln!(f, "   directory partition owner: <none>")?,
        }
        for address in &self.local_cache_activations {
            writeln!(f, "   cached: {}", address)?;
        }
        for detail in &self.activation_details {
            writeln!(f, "   {}", detail)?;
        }
        Ok(())
    }
}
