//! Error types for the silo runtime core.
//!
//! Infrastructure errors stay inside the pipeline: the dispatcher and
//! catalog convert them into [`Response::Rejection`](crate::Response)
//! messages for the affected senders. [`RequestError`] is what a caller
//! finally observes.

use std::time::Duration;

use thiserror::Error;

use crate::message::{CallChainEntry, RejectionType};
use crate::types::{ActivationAddress, GrainId, GrainType};

/// Errors from the activation collector.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CollectorError {
    /// The activation already holds a collection ticket.
    #[error("activation {0} is already scheduled for collection")]
    AlreadyScheduled(String),

    /// Timeout shorter than the wheel granularity.
    #[error("collection timeout {timeout:?} is below the quantum {quantum:?}")]
    TimeoutBelowQuantum {
        /// Requested timeout.
        timeout: Duration,
        /// Wheel quantum.
        quantum: Duration,
    },

    /// Ticket would land in a bucket that was already scanned.
    #[error("collection ticket is already expired")]
    TicketExpired,

    /// System activations are never collected.
    #[error("activation {0} is exempt from collection")]
    Exempt(String),
}

/// Errors from the grain directory collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    /// Directory partition owner is unreachable.
    #[error("directory unavailable: {0}")]
    Unavailable(String),

    /// Directory operation timed out.
    #[error("directory operation timed out")]
    Timeout,
}

/// Errors from storage providers.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Optimistic concurrency check failed.
    #[error("etag mismatch: expected {expected:?}, found {actual:?}")]
    ETagMismatch {
        /// ETag supplied by the writer.
        expected: Option<String>,
        /// ETag currently stored.
        actual: Option<String>,
    },

    /// Backend unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// No provider registered under that name.
    #[error("unknown storage provider: {0}")]
    UnknownProvider(String),
}

/// Errors from the placement director.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlacementError {
    /// No silo can host the activation.
    #[error("no compatible silo for {0}")]
    NoCandidates(GrainId),

    /// Client pseudo-grains cannot be placed.
    #[error("client {0} is not registered with any gateway")]
    UnregisteredClient(GrainId),

    /// Directory lookup failed during placement.
    #[error("placement lookup failed: {0}")]
    Directory(#[from] DirectoryError),
}

/// Error returned by grain code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GrainError {
    /// Method id not handled by the grain.
    #[error("unknown method {interface_id}.{method_id}")]
    UnknownMethod {
        /// Interface id.
        interface_id: u32,
        /// Method id.
        method_id: u32,
    },

    /// Application failure.
    #[error("{0}")]
    Failed(String),
}

/// Hard overload limit exceeded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{limit_name} exceeded: {count} requests (hard limit {hard})")]
pub struct LimitExceeded {
    /// Name of the limit.
    pub limit_name: String,
    /// Observed count.
    pub count: usize,
    /// Hard threshold.
    pub hard: usize,
}

/// Mailbox rejected a message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnqueueError {
    /// Activation is invalid; its mailbox is closed.
    #[error("activation {0} is invalid")]
    Invalid(String),
}

/// Why an activation could not be initialized.
#[derive(Debug, Error)]
pub enum ActivationError {
    /// Another activation won the single-activation race.
    #[error("duplicate activation, winner is {0}")]
    Duplicate(ActivationAddress),

    /// Grain type is not registered on this silo.
    #[error("unknown grain type {0}")]
    UnknownGrainType(GrainType),

    /// Loading persisted state failed.
    #[error("state load failed: {0}")]
    Storage(#[from] StorageError),

    /// Directory registration failed.
    #[error("directory registration failed: {0}")]
    Directory(#[from] DirectoryError),

    /// The activate hook returned an error.
    #[error("activate hook failed: {0}")]
    Hook(#[from] GrainError),

    /// The activation was invalidated while initializing.
    #[error("activation invalidated during initialization")]
    Invalidated,
}

/// Errors from catalog lookups.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Target activation is not on this silo and no placement was supplied.
    #[error("non-existent activation {0}")]
    NonExistentActivation(ActivationAddress),

    /// Message lacks a resolved target.
    #[error("message is not fully addressed")]
    NotAddressed,

    /// Grain type is not registered on this silo.
    #[error("unknown grain type {0}")]
    UnknownGrainType(GrainType),

    /// Initialization failed.
    #[error("activation failed: {0}")]
    Activation(#[from] ActivationError),

    /// Silo wiring is incomplete or torn down.
    #[error("silo runtime is not running")]
    NotRunning,
}

/// What a caller observes for a failed request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    /// Runtime rejected the request.
    #[error("request rejected ({kind}): {reason}")]
    Rejected {
        /// Rejection classification.
        kind: RejectionType,
        /// Reason supplied by the rejecting silo.
        reason: String,
    },

    /// Request would have deadlocked.
    #[error("deadlock detected along call chain of {} hops", chain.len())]
    Deadlock {
        /// Call chain including the rejected hop.
        chain: Vec<CallChainEntry>,
    },

    /// No response in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The grain method failed.
    #[error("grain method failed: {0}")]
    Fault(String),

    /// Completion handle was dropped without an outcome.
    #[error("request was abandoned")]
    Abandoned,

    /// Sending was impossible (e.g. silo not running).
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Top-level silo error.
#[derive(Debug, Error)]
pub enum SiloError {
    /// Catalog error.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Placement error.
    #[error(transparent)]
    Placement(#[from] PlacementError),

    /// Directory error.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// Silo is shutting down.
    #[error("silo is shutting down")]
    ShuttingDown,

    /// No tokio runtime to spawn the silo's tasks on.
    #[error("silo must be started from within a tokio runtime")]
    NoRuntime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_exceeded_message() {
        let err = LimitExceeded {
            limit_name: "MaxEnqueuedRequests".into(),
            count: 11,
            hard: 10,
        };
        assert_eq!(
            err.to_string(),
            "MaxEnqueuedRequests exceeded: 11 requests (hard limit 10)"
        );
    }

    #[test]
    fn test_error_conversions() {
        let err: ActivationError = DirectoryError::Timeout.into();
        assert!(matches!(err, ActivationError::Directory(_)));

        let err: CatalogError = err.into();
        assert!(err.to_string().contains("directory registration failed"));
    }
}
