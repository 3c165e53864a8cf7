//! Callback data for request-response correlation.
//!
//! A [`CallbackData`] tracks one outstanding request: it owns the completion
//! channel of the caller, the response timer, and the resend budget. Exactly
//! one of "response arrived" and "timeout fired" completes it.
//!
//! # Architecture
//!
//! ```text
//! Request Flow:
//!   1. Create CallbackData with oneshot::Sender
//!   2. Store in RuntimeClient callbacks map
//!   3. start_timer(response_timeout)
//!   4. Send request through the dispatcher
//!   5. Caller waits on oneshot::Receiver
//!
//! Response Flow:
//!   6. Response arrives, lookup by correlation id
//!   7. do_callback(response): mark fired, stop timer, unregister
//!   8. oneshot::Sender fires outside the lock
//!
//! Timeout Flow (resend enabled, budget N):
//!   timer period = timeout / (N + 1)
//!   each tick resends the request while budget remains
//!   the last tick completes with a synthesized timeout response
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::MessagingConfig;
use crate::message::{GrainFault, Message, RejectionType, Response};
use crate::types::CorrelationId;

/// Resend hook. Gets the stored request and returns whether it was resent.
pub type ResendFn = Arc<dyn Fn(&mut Message) -> bool + Send + Sync>;

/// Removes the callback from its owner's table.
pub type UnregisterFn = Arc<dyn Fn(CorrelationId) + Send + Sync>;

/// Timeout and resend policy of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackConfig {
    /// Total time the caller waits.
    pub timeout: Duration,
    /// Resend at sub-periods of the timeout.
    pub resend_on_timeout: bool,
    /// Resend budget.
    pub max_resend_count: u8,
}

impl CallbackConfig {
    /// Policy derived from the messaging settings.
    pub fn from_messaging(config: &MessagingConfig) -> Self {
        Self {
            timeout: config.response_timeout,
            resend_on_timeout: config.resend_on_timeout,
            max_resend_count: config.max_resend_count,
        }
    }

    /// Timer period: the whole timeout, or an equal share per attempt when
    /// resending.
    pub fn timer_period(&self) -> Duration {
        if self.resend_on_timeout && self.max_resend_count > 0 {
            self.timeout / (u32::from(self.max_resend_count) + 1)
        } else {
            self.timeout
        }
    }

    fn repeats(&self) -> bool {
        self.resend_on_timeout && self.max_resend_count > 0
    }
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self::from_messaging(&MessagingConfig::default())
    }
}

struct CallbackState {
    message: Message,
    fired: bool,
    timer: Option<JoinHandle<()>>,
    sender: Option<oneshot::Sender<Message>>,
}

/// One outstanding request awaiting its response.
pub struct CallbackData {
    id: CorrelationId,
    config: CallbackConfig,
    started: Instant,
    resend: ResendFn,
    unregister: UnregisterFn,
    state: Mutex<CallbackState>,
}

impl CallbackData {
    /// Create the callback. The timer is not running until
    /// [`start_timer`](Self::start_timer).
    pub fn new(
        message: Message,
        sender: oneshot::Sender<Message>,
        config: CallbackConfig,
        resend: ResendFn,
        unregister: UnregisterFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: message.id,
            config,
            started: Instant::now(),
            resend,
            unregister,
            state: Mutex::new(CallbackState {
                message,
                fired: false,
                timer: None,
                sender: Some(sender),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CallbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Correlation id of the request.
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Copy of the request as last sent.
    pub fn message(&self) -> Message {
        self.lock().message.clone()
    }

    /// Time since the callback was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Check if the callback already completed.
    pub fn is_completed(&self) -> bool {
        self.lock().fired
    }

    /// Start the response timer.
    pub fn start_timer(self: &Arc<Self>) {
        let period = self.config.timer_period();
        let repeats = self.config.repeats();
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(callback) = weak.upgrade() else {
                    return;
                };
                callback.on_timeout();
                if !repeats || callback.is_completed() {
                    return;
                }
            }
        });

        let mut state = self.lock();
        if state.fired {
            handle.abort();
        } else if let Some(previous) = state.timer.replace(handle) {
            previous.abort();
        }
    }

    /// Timer tick: resend while budget remains, otherwise complete with a
    /// timeout response.
    pub fn on_timeout(&self) {
        let (sender, reply) = {
            let mut state = self.lock();
            if state.fired {
                return;
            }
            if self.config.resend_on_timeout && (self.resend)(&mut state.message) {
                tracing::debug!(id = %self.id, resend_count = state.message.resend_count, "request resent on timeout");
                return;
            }
            state.fired = true;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            let after = self.started.elapsed();
            let reply = state
                .message
                .create_response(Response::Fault(GrainFault::Timeout { after }));
            tracing::warn!(id = %self.id, target = %state.message.target_grain, ?after, "response timeout");
            (state.sender.take(), reply)
        };

        (self.unregister)(self.id);
        if let Some(sender) = sender {
            let _ = sender.send(reply);
        }
    }

    /// Deliver `response` to the caller.
    ///
    /// A transient rejection is absorbed when the request can still be
    /// resent; the callback then stays pending.
    pub fn do_callback(&self, response: Message) {
        let sender = {
            let mut state = self.lock();
            if state.fired {
                return;
            }
            if response.rejection_type() == Some(RejectionType::Transient)
                && (self.resend)(&mut state.message)
            {
                tracing::debug!(id = %self.id, "transient rejection, request resent");
                return;
            }
            state.fired = true;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.sender.take()
        };

        (self.unregister)(self.id);
        if let Some(sender) = sender {
            let _ = sender.send(response);
        }
    }

    /// Stop the timer. Safe to call repeatedly.
    pub fn dispose(&self) {
        if let Some(timer) = self.lock().timer.take() {
            timer.abort();
        }
    }
}

impl Drop for CallbackData {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for CallbackData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackData")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("completed", &self.is_completed())
            .finish()
    }
}
