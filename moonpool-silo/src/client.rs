//! Calling side of the silo: outstanding requests and response delivery.
//!
//! The [`RuntimeClient`] owns the table of [`CallbackData`] keyed by
//! correlation id. Outgoing requests register a callback, go out through the
//! dispatcher's send path and complete when the matching response comes back
//! through [`RuntimeClient::receive_response`] or the response timer fires.

use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::callback::{CallbackConfig, CallbackData, ResendFn, UnregisterFn};
use crate::config::MessagingConfig;
use crate::dispatcher::Dispatcher;
use crate::error::RequestError;
use crate::message::{Direction, GrainFault, Message, RejectionType, Response};
use crate::types::{ActivationAddress, CorrelationId, GrainId, SiloAddress};

/// Outstanding-request table of one silo.
pub struct RuntimeClient {
    local_silo: SiloAddress,
    client_id: GrainId,
    config: MessagingConfig,
    callbacks: DashMap<CorrelationId, Arc<CallbackData>>,
    dispatcher: OnceLock<Weak<Dispatcher>>,
    weak_self: Weak<RuntimeClient>,
}

impl RuntimeClient {
    /// Create the client. Requests fail until a dispatcher is attached.
    pub fn new(local_silo: SiloAddress, config: MessagingConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            local_silo,
            client_id: GrainId::client(format!("silo-{}", local_silo)),
            config,
            callbacks: DashMap::new(),
            dispatcher: OnceLock::new(),
            weak_self: weak_self.clone(),
        })
    }

    pub(crate) fn attach_dispatcher(&self, dispatcher: &Arc<Dispatcher>) {
        let _ = self.dispatcher.set(Arc::downgrade(dispatcher));
    }

    fn dispatcher(&self) -> Result<Arc<Dispatcher>, RequestError> {
        self.dispatcher
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| RequestError::SendFailed("dispatcher not running".into()))
    }

    /// Pseudo-grain id used as sender for calls made outside any grain.
    pub fn client_id(&self) -> &GrainId {
        &self.client_id
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.callbacks.len()
    }

    fn stamp_sender(&self, message: &mut Message) {
        if message.sending_grain.is_none() {
            message.sending_grain = Some(self.client_id.clone());
        }
        if message.sending_silo.is_none() {
            message.sending_silo = Some(self.local_silo);
        }
    }

    /// Send a request and wait for its outcome.
    pub async fn send_request(&self, mut message: Message) -> Result<Vec<u8>, RequestError> {
        let dispatcher = self.dispatcher()?;
        message.direction = Direction::Request;
        self.stamp_sender(&mut message);
        if message.expires_at.is_none() {
            message = message.with_time_to_live(self.config.response_timeout);
        }

        let (tx, rx) = oneshot::channel();
        let resend: ResendFn = {
            let client = self.weak_self.clone();
            Arc::new(move |message: &mut Message| {
                client
                    .upgrade()
                    .map(|client| client.try_resend_message(message))
                    .unwrap_or(false)
            })
        };
        let unregister: UnregisterFn = {
            let client = self.weak_self.clone();
            Arc::new(move |id| {
                if let Some(client) = client.upgrade() {
                    client.callbacks.remove(&id);
                }
            })
        };
        let callback = CallbackData::new(
            message.clone(),
            tx,
            CallbackConfig::from_messaging(&self.config),
            resend,
            unregister,
        );
        self.callbacks.insert(message.id, callback.clone());
        callback.start_timer();

        tracing::trace!(id = %message.id, target = %message.target_grain, "sending request");
        dispatcher.send_message(message);

        let reply = rx.await.map_err(|_| RequestError::Abandoned)?;
        response_to_result(reply)
    }

    /// Send a one-way message. No response is expected.
    pub fn send_one_way(&self, mut message: Message) -> Result<(), RequestError> {
        let dispatcher = self.dispatcher()?;
        message.direction = Direction::OneWay;
        self.stamp_sender(&mut message);
        dispatcher.send_message(message);
        Ok(())
    }

    /// Deliver a response to the waiting caller.
    pub fn receive_response(&self, message: Message) {
        if message.rejection_type() == Some(RejectionType::DuplicateRequest) {
            tracing::debug!(id = %message.id, "duplicate request rejection ignored");
            return;
        }
        let callback = self.callbacks.get(&message.id).map(|c| c.value().clone());
        match callback {
            Some(callback) => callback.do_callback(message),
            None => tracing::warn!(id = %message.id, "no callback for response, dropped"),
        }
    }

    /// Resend `message` if its resend budget allows. Addressing is cleared so
    /// the target is resolved again.
    pub fn try_resend_message(&self, message: &mut Message) -> bool {
        if message.resend_count >= self.config.max_resend_count {
            return false;
        }
        let Ok(dispatcher) = self.dispatcher() else {
            return false;
        };
        message.resend_count += 1;
        message.clear_target_address();
        tracing::debug!(id = %message.id, resend_count = message.resend_count, "resending request");
        dispatcher.send_message(message.clone());
        true
    }

    /// Forward `message` to `forward_to` (or re-address it when unknown) if
    /// its forward budget allows.
    pub fn try_forward_message(
        &self,
        mut message: Message,
        forward_to: Option<&ActivationAddress>,
    ) -> bool {
        if message.forward_count >= self.config.max_forward_count {
            return false;
        }
        let Ok(dispatcher) = self.dispatcher() else {
            return false;
        };
        message.forward_count += 1;
        match forward_to {
            Some(address) => {
                message = message.with_target_address(address);
                message.is_new_placement = false;
            }
            None => message.clear_target_address(),
        }
        tracing::debug!(id = %message.id, forward_count = message.forward_count, "forwarding message");
        dispatcher.send_message(message);
        true
    }
}

impl std::fmt::Debug for RuntimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeClient")
            .field("local_silo", &self.local_silo)
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Map a response message to what the caller sees.
pub fn response_to_result(reply: Message) -> Result<Vec<u8>, RequestError> {
    match reply.response {
        Some(Response::Success(body)) => Ok(body),
        Some(Response::Fault(GrainFault::Application(reason))) => Err(RequestError::Fault(reason)),
        Some(Response::Fault(GrainFault::Deadlock { chain })) => Err(RequestError::Deadlock { chain }),
        Some(Response::Fault(GrainFault::Timeout { after })) => Err(RequestError::Timeout(after)),
        Some(Response::Rejection { kind, reason }) => Err(RequestError::Rejected { kind, reason }),
        None => Err(RequestError::Fault("response without outcome".into())),
    }
}
