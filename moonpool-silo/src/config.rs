//! Silo runtime configuration.
//!
//! Three sections mirror the three subsystems they tune:
//!
//! - [`MessagingConfig`]: timeouts, resend/forward budgets, deadlock
//!   detection and fault injection.
//! - [`CollectionConfig`]: idle-collection quantum and age limits.
//! - [`LimitConfig`]: per-activation overload thresholds.
//!
//! All sections deserialize with defaults, so a JSON document only needs
//! the values it overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = SiloConfig::builder()
//!     .collection_quantum(Duration::from_secs(10))
//!     .default_age_limit(Duration::from_secs(60))
//!     .resend_on_timeout(true)
//!     .build();
//!
//! let config = SiloConfig::from_json(r#"{"messaging": {"max_resend_count": 5}}"#)?;
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Soft/hard threshold pair.
///
/// A value of `0` disables that threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitValue {
    /// Name used in log lines and errors.
    pub name: String,
    /// Warn above this count.
    pub soft: usize,
    /// Reject above this count.
    pub hard: usize,
}

impl LimitValue {
    /// Create a limit.
    pub fn new(name: impl Into<String>, soft: usize, hard: usize) -> Self {
        Self {
            name: name.into(),
            soft,
            hard,
        }
    }
}

/// Messaging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Time a caller waits for a response.
    pub response_timeout: Duration,
    /// Resend a request when its response timeout sub-period elapses.
    pub resend_on_timeout: bool,
    /// Maximum resends of one request.
    pub max_resend_count: u8,
    /// Maximum forwards of one message between silos.
    pub max_forward_count: u8,
    /// Reject requests that would close a cycle on a non-reentrant activation.
    pub perform_deadlock_detection: bool,
    /// Turns running longer than this are logged on completion.
    pub max_request_processing_time: Duration,
    /// Delay before unregistering a stale directory entry; `None` unregisters at once.
    pub lazy_unregister_delay: Option<Duration>,
    /// Fraction of incoming requests rejected as transient (chaos testing).
    pub rejection_injection_rate: f64,
    /// Fraction of incoming requests silently dropped (chaos testing).
    pub message_loss_injection_rate: f64,
    /// Seed for fault injection; random when unset.
    pub fault_injection_seed: Option<u64>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            resend_on_timeout: false,
            max_resend_count: 2,
            max_forward_count: 2,
            perform_deadlock_detection: true,
            max_request_processing_time: Duration::from_secs(2 * 60 * 60),
            lazy_unregister_delay: None,
            rejection_injection_rate: 0.0,
            message_loss_injection_rate: 0.0,
            fault_injection_seed: None,
        }
    }
}

/// Idle-activation collection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Granularity of the timing wheel and period of the collection timer.
    pub quantum: Duration,
    /// Idle time after which an activation is collected.
    pub default_age_limit: Duration,
    /// Per grain type (by registered name) overrides of the age limit.
    pub age_limits: HashMap<String, Duration>,
    /// Upper bound on a single keep-alive extension; unbounded when unset.
    pub max_keep_alive: Option<Duration>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            quantum: Duration::from_secs(60),
            default_age_limit: Duration::from_secs(2 * 60 * 60),
            age_limits: HashMap::new(),
            max_keep_alive: None,
        }
    }
}

impl CollectionConfig {
    /// Age limit for a grain type name.
    pub fn age_limit_for(&self, type_name: &str) -> Duration {
        self.age_limits
            .get(type_name)
            .copied()
            .unwrap_or(self.default_age_limit)
    }
}

/// Overload thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Limit for ordinary grains.
    pub max_enqueued_requests: LimitValue,
    /// Limit for stateless-worker grains.
    pub max_enqueued_requests_stateless_worker: LimitValue,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_enqueued_requests: LimitValue::new("MaxEnqueuedRequests", 1_000, 5_000),
            max_enqueued_requests_stateless_worker: LimitValue::new(
                "MaxEnqueuedRequests_StatelessWorker",
                10_000,
                50_000,
            ),
        }
    }
}

impl LimitConfig {
    /// Limit that applies to a grain type.
    pub fn for_grain(&self, stateless_worker: bool) -> &LimitValue {
        if stateless_worker {
            &self.max_enqueued_requests_stateless_worker
        } else {
            &self.max_enqueued_requests
        }
    }
}

/// Complete silo runtime configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SiloConfig {
    /// Messaging section.
    pub messaging: MessagingConfig,
    /// Collection section.
    pub collection: CollectionConfig,
    /// Limits section.
    pub limits: LimitConfig,
}

impl SiloConfig {
    /// Start building a configuration from defaults.
    pub fn builder() -> SiloConfigBuilder {
        SiloConfigBuilder::default()
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Builder for [`SiloConfig`].
#[derive(Debug, Clone, Default)]
pub struct SiloConfigBuilder {
    config: SiloConfig,
}

impl SiloConfigBuilder {
    /// Caller-side response timeout.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.messaging.response_timeout = timeout;
        self
    }

    /// Enable resend on timeout sub-periods.
    pub fn resend_on_timeout(mut self, enabled: bool) -> Self {
        self.config.messaging.resend_on_timeout = enabled;
        self
    }

    /// Maximum resends per request.
    pub fn max_resend_count(mut self, count: u8) -> Self {
        self.config.messaging.max_resend_count = count;
        self
    }

    /// Maximum forwards per message.
    pub fn max_forward_count(mut self, count: u8) -> Self {
        self.config.messaging.max_forward_count = count;
        self
    }

    /// Toggle deadlock detection.
    pub fn deadlock_detection(mut self, enabled: bool) -> Self {
        self.config.messaging.perform_deadlock_detection = enabled;
        self
    }

    /// Fault injection rates and optional seed.
    pub fn fault_injection(mut self, rejection_rate: f64, loss_rate: f64, seed: Option<u64>) -> Self {
        self.config.messaging.rejection_injection_rate = rejection_rate;
        self.config.messaging.message_loss_injection_rate = loss_rate;
        self.config.messaging.fault_injection_seed = seed;
        self
    }

    /// Collection wheel quantum.
    pub fn collection_quantum(mut self, quantum: Duration) -> Self {
        self.config.collection.quantum = quantum;
        self
    }

    /// Default idle age limit.
    pub fn default_age_limit(mut self, limit: Duration) -> Self {
        self.config.collection.default_age_limit = limit;
        self
    }

    /// Age limit override for one grain type name.
    pub fn age_limit(mut self, type_name: impl Into<String>, limit: Duration) -> Self {
        self.config.collection.age_limits.insert(type_name.into(), limit);
        self
    }

    /// Cap on keep-alive extensions.
    pub fn max_keep_alive(mut self, cap: Duration) -> Self {
        self.config.collection.max_keep_alive = Some(cap);
        self
    }

    /// Overload limit for ordinary grains.
    pub fn max_enqueued_requests(mut self, soft: usize, hard: usize) -> Self {
        self.config.limits.max_enqueued_requests.soft = soft;
        self.config.limits.max_enqueued_requests.hard = hard;
        self
    }

    /// Overload limit for stateless workers.
    pub fn max_enqueued_requests_stateless_worker(mut self, soft: usize, hard: usize) -> Self {
        self.config.limits.max_enqueued_requests_stateless_worker.soft = soft;
        self.config.limits.max_enqueued_requests_stateless_worker.hard = hard;
        self
    }

    /// Finish.
    pub fn build(self) -> SiloConfig {
        self.config
    }
}
