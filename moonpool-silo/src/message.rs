//! Messages exchanged between grains, clients and silos.
//!
//! A [`Message`] carries addressing, correlation, the request body or the
//! [`Response`], interleaving flags and the causal call chain used for
//! deadlock detection.
//!
//! # Direction
//!
//! ```text
//! Request → Response  (matching correlation id)
//! OneWay  → (terminal, no response)
//! ```

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::placement::PlacementStrategy;
use crate::types::{ActivationAddress, ActivationId, CorrelationId, GrainId, SiloAddress};

/// Message flow semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Request expecting a response; tracked by a `CallbackData` on the caller.
    Request,
    /// Response to a previous request, matched by correlation id.
    Response,
    /// Fire-and-forget.
    OneWay,
}

bitflags! {
    /// Control flags for message processing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MessageFlags: u16 {
        /// Message doesn't mutate grain state; may interleave with other read-only turns.
        const READ_ONLY = 1 << 0;

        /// May interleave with any other turn.
        const ALWAYS_INTERLEAVE = 1 << 1;

        /// Must not be forwarded to another silo.
        const IS_LOCAL_ONLY = 1 << 2;

        /// Doesn't count as activity for idle collection.
        const SUPPRESS_KEEP_ALIVE = 1 << 3;
    }
}

impl Serialize for MessageFlags {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessageFlags {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bits = u16::deserialize(deserializer)?;
        Ok(MessageFlags::from_bits_truncate(bits))
    }
}

/// Classification of a rejected message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionType {
    /// Temporary condition; the caller may resend.
    Transient,
    /// Target unreachable without a new placement; do not resend.
    Unrecoverable,
    /// Request was already seen; silently ignored by the caller.
    DuplicateRequest,
    /// Target mailbox exceeded its hard limit.
    Overloaded,
}

impl fmt::Display for RejectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "Transient"),
            Self::Unrecoverable => write!(f, "Unrecoverable"),
            Self::DuplicateRequest => write!(f, "DuplicateRequest"),
            Self::Overloaded => write!(f, "Overloaded"),
        }
    }
}

/// One hop of a causal call chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallChainEntry {
    /// Grain that issued the call.
    pub grain: GrainId,
    /// Activation that issued the call.
    pub activation: ActivationId,
    /// Interface being executed when the call was issued.
    pub interface_id: u32,
    /// Method being executed when the call was issued.
    pub method_id: u32,
}

/// Application-visible failure carried by a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrainFault {
    /// The grain method returned an error (or panicked).
    Application(String),
    /// The request would have closed a cycle on a non-reentrant activation.
    Deadlock {
        /// Call chain including the rejected hop.
        chain: Vec<CallChainEntry>,
    },
    /// No response arrived within the response timeout.
    Timeout {
        /// Total time waited.
        after: Duration,
    },
}

/// Outcome carried by a response message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Method completed; serialized return value.
    Success(Vec<u8>),
    /// Method or runtime fault visible to the application.
    Fault(GrainFault),
    /// Runtime refused to execute the request.
    Rejection {
        /// Rejection classification.
        kind: RejectionType,
        /// Human-readable reason.
        reason: String,
    },
}

/// Unit of communication between grains.
///
/// # Invariants
///
/// - A response swaps sender/target of its request and copies the correlation id.
/// - `forward_count` and `resend_count` bound re-routing of a single message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// For matching responses to requests.
    pub id: CorrelationId,
    /// Request, Response, or OneWay.
    pub direction: Direction,

    /// Silo of the sender, if known.
    pub sending_silo: Option<SiloAddress>,
    /// Sending grain (a client pseudo-grain for external callers).
    pub sending_grain: Option<GrainId>,
    /// Sending activation.
    pub sending_activation: Option<ActivationId>,

    /// Target silo, set by addressing.
    pub target_silo: Option<SiloAddress>,
    /// Target grain.
    pub target_grain: GrainId,
    /// Target activation, set by addressing.
    pub target_activation: Option<ActivationId>,

    /// Invoked interface.
    pub interface_id: u32,
    /// Invoked method.
    pub method_id: u32,
    /// Serialized arguments (requests and one-way).
    pub body: Vec<u8>,
    /// Outcome (responses only).
    pub response: Option<Response>,
    /// Interleaving and lifetime flags.
    pub flags: MessageFlags,

    /// Absolute expiry; not serialized, recomputed by the receiver's clock.
    #[serde(skip)]
    pub expires_at: Option<Instant>,

    /// Strategy used when the target has no activation yet.
    pub placement: Option<PlacementStrategy>,
    /// Set when addressing created a brand new placement for the target.
    pub is_new_placement: bool,

    /// Activations visited on the causal path of this request.
    pub call_chain: Vec<CallChainEntry>,
    /// Times the message was forwarded by a silo.
    pub forward_count: u8,
    /// Times the caller resent the message.
    pub resend_count: u8,
    /// Stale addresses the receiver should drop from its directory cache.
    pub cache_invalidation: Vec<ActivationAddress>,
}

impl Message {
    fn blank(direction: Direction, target_grain: GrainId) -> Self {
        Self {
            id: CorrelationId::new_random(),
            direction,
            sending_silo: None,
            sending_grain: None,
            sending_activation: None,
            target_silo: None,
            target_grain,
            target_activation: None,
            interface_id: 0,
            method_id: 0,
            body: Vec::new(),
            response: None,
            flags: MessageFlags::empty(),
            expires_at: None,
            placement: None,
            is_new_placement: false,
            call_chain: Vec::new(),
            forward_count: 0,
            resend_count: 0,
            cache_invalidation: Vec::new(),
        }
    }

    /// Create a request to `target`.
    pub fn request(target: GrainId, interface_id: u32, method_id: u32, body: Vec<u8>) -> Self {
        Self {
            interface_id,
            method_id,
            body,
            ..Self::blank(Direction::Request, target)
        }
    }

    /// Create a one-way message to `target`.
    pub fn one_way(target: GrainId, interface_id: u32, method_id: u32, body: Vec<u8>) -> Self {
        Self {
            interface_id,
            method_id,
            body,
            ..Self::blank(Direction::OneWay, target)
        }
    }

    /// Set the sender.
    pub fn with_sender(
        mut self,
        silo: SiloAddress,
        grain: GrainId,
        activation: Option<ActivationId>,
    ) -> Self {
        self.sending_silo = Some(silo);
        self.sending_grain = Some(grain);
        self.sending_activation = activation;
        self
    }

    /// Set the interleaving flags.
    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Expire the message `ttl` from now.
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(Instant::now() + ttl);
        self
    }

    /// Pin the message to a fully resolved activation.
    pub fn with_target_address(mut self, address: &ActivationAddress) -> Self {
        self.target_silo = Some(address.silo);
        self.target_grain = address.grain.clone();
        self.target_activation = Some(address.activation);
        self
    }

    /// Placement strategy for a not-yet-existing target.
    pub fn with_placement(mut self, strategy: PlacementStrategy) -> Self {
        self.placement = Some(strategy);
        self
    }

    /// True for requests and one-way messages.
    pub fn is_request_like(&self) -> bool {
        matches!(self.direction, Direction::Request | Direction::OneWay)
    }

    /// True once the expiry has passed.
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expiry| Instant::now() > expiry)
            .unwrap_or(false)
    }

    /// Read-only flag.
    pub fn is_read_only(&self) -> bool {
        self.flags.contains(MessageFlags::READ_ONLY)
    }

    /// Always-interleave flag.
    pub fn is_always_interleave(&self) -> bool {
        self.flags.contains(MessageFlags::ALWAYS_INTERLEAVE)
    }

    /// True when the target silo and activation are both known.
    pub fn is_fully_addressed(&self) -> bool {
        self.target_silo.is_some() && self.target_activation.is_some()
    }

    /// Resolved target, if fully addressed.
    pub fn target_address(&self) -> Option<ActivationAddress> {
        match (self.target_silo, self.target_activation) {
            (Some(silo), Some(activation)) => Some(ActivationAddress::new(
                silo,
                self.target_grain.clone(),
                activation,
            )),
            _ => None,
        }
    }

    /// Resolved sender, if the sender is an activation.
    pub fn sending_address(&self) -> Option<ActivationAddress> {
        match (self.sending_silo, &self.sending_grain, self.sending_activation) {
            (Some(silo), Some(grain), Some(activation)) => {
                Some(ActivationAddress::new(silo, grain.clone(), activation))
            }
            _ => None,
        }
    }

    /// Drop target silo/activation so the next send re-addresses the message.
    pub fn clear_target_address(&mut self) {
        self.target_silo = None;
        self.target_activation = None;
        self.is_new_placement = false;
    }

    /// Ask the receiver to drop `address` from its directory cache.
    pub fn add_cache_invalidation(&mut self, address: ActivationAddress) {
        if !self.cache_invalidation.contains(&address) {
            self.cache_invalidation.push(address);
        }
    }

    /// True if `activation` already appears on the call chain.
    pub fn call_chain_contains(&self, activation: ActivationId) -> bool {
        self.call_chain.iter().any(|e| e.activation == activation)
    }

    /// Build the response to this request.
    pub fn create_response(&self, response: Response) -> Message {
        let mut reply = Self::blank(Direction::Response, self.sending_grain_or_client());
        reply.id = self.id;
        reply.sending_silo = self.target_silo;
        reply.sending_grain = Some(self.target_grain.clone());
        reply.sending_activation = self.target_activation;
        reply.target_silo = self.sending_silo;
        reply.target_activation = self.sending_activation;
        reply.interface_id = self.interface_id;
        reply.method_id = self.method_id;
        reply.response = Some(response);
        reply.cache_invalidation = self.cache_invalidation.clone();
        reply
    }

    /// Build a rejection response to this request.
    pub fn create_rejection(&self, kind: RejectionType, reason: impl Into<String>) -> Message {
        self.create_response(Response::Rejection {
            kind,
            reason: reason.into(),
        })
    }

    fn sending_grain_or_client(&self) -> GrainId {
        self.sending_grain
            .clone()
            .unwrap_or_else(|| GrainId::client("anonymous"))
    }

    /// Rejection classification of a response, if it is one.
    pub fn rejection_type(&self) -> Option<RejectionType> {
        match &self.response {
            Some(Response::Rejection { kind, .. }) => Some(*kind),
            _ => None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} {}.{} -> {}",
            self.direction, self.id, self.interface_id, self.method_id, self.target_grain
        )?;
        if let Some(activation) = self.target_activation {
            write!(f, " {}", activation)?;
        }
        if !self.flags.is_empty() {
            write!(f, " {:?}", self.flags)?;
        }
        Ok(())
    }
}
