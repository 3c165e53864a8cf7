//! # moonpool-silo
//!
//! Activation lifecycle and message dispatch core for moonpool virtual
//! actors ("grains").
//!
//! A silo hosts activations of grains. This crate manages their mailboxes,
//! creates them on demand, decides which messages may run, queue or must be
//! rejected, reclaims idle activations, and tracks the outstanding requests
//! of callers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Silo (host, background tasks)                                │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Dispatcher        accept / queue / reject, message pump,     │
//! │                   deadlock detection, send-path addressing   │
//! ├───────────────────────────────┬──────────────────────────────┤
//! │ Catalog                       │ RuntimeClient + CallbackData │
//! │  get-or-create, activate,     │  outstanding requests,       │
//! │  deactivate, membership       │  timeouts and resends        │
//! ├───────────────────────────────┤                              │
//! │ ActivationRecord + Collector  │                              │
//! │  mailbox, state, timing wheel │                              │
//! ├───────────────────────────────┴──────────────────────────────┤
//! │ Collaborators: GrainDirectory, PlacementDirector,            │
//! │ StorageProvider, WorkScheduler, MessageTransport,            │
//! │ SiloStatusOracle                                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use moonpool_silo::*;
//!
//! let silo = Silo::builder()
//!     .grain_type(GrainTypeData::new(GrainType(1), "Echo", |_| Arc::new(Echo)))
//!     .start()?;
//!
//! let reply = silo.call(GrainId::new(GrainType(1), "a"), 1, 1, b"hi".to_vec()).await?;
//! ```
//!
//! ## Logging
//!
//! Everything is instrumented with `tracing`. Install a subscriber (for
//! example `tracing_subscriber::fmt`) to see activation lifecycle, rejection
//! and collection events.

#![deny(missing_docs)]

pub mod activation;
pub mod callback;
pub mod catalog;
pub mod client;
pub mod collector;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod grain;
pub mod membership;
pub mod message;
pub mod placement;
pub mod scheduler;
pub mod silo;
pub mod storage;
pub mod transport;
pub mod types;

pub use activation::{ActivationRecord, ActivationState, DeactivationReason};
pub use callback::{CallbackConfig, CallbackData};
pub use catalog::{Catalog, CatalogServices, DetailedGrainReport, GrainStatistic};
pub use client::RuntimeClient;
pub use collector::ActivationCollector;
pub use config::{CollectionConfig, LimitConfig, LimitValue, MessagingConfig, SiloConfig};
pub use directory::{GrainDirectory, InMemoryDirectory, Registration};
pub use dispatcher::{Dispatcher, DispatcherServices};
pub use error::{
    ActivationError, CatalogError, CollectorError, DirectoryError, GrainError, PlacementError,
    RequestError, SiloError, StorageError,
};
pub use grain::{Grain, GrainContext, GrainTypeData, GrainTypeRegistry, MethodTable};
pub use membership::{SiloStatus, SiloStatusListener, SiloStatusOracle, StaticMembership};
pub use message::{
    CallChainEntry, Direction, GrainFault, Message, MessageFlags, RejectionType, Response,
};
pub use placement::{DefaultPlacementDirector, PlacementDirector, PlacementStrategy};
pub use scheduler::{TokioScheduler, WorkScheduler};
pub use silo::{Silo, SiloBuilder};
pub use storage::{InMemoryStorage, StorageProvider, StorageProviders, StoredState};
pub use transport::{LocalTransport, MessageTransport};
pub use types::{ActivationAddress, ActivationId, CorrelationId, GrainId, GrainType, SiloAddress};
