//! Transport collaborator: hands messages to the wire.
//!
//! [`LocalTransport`] loops messages addressed to this silo back into a
//! channel drained by the silo's receive pump. Messages for other silos go
//! to an optional remote transport.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::message::Message;
use crate::types::SiloAddress;

/// Wire layer as seen by the dispatcher.
pub trait MessageTransport: fmt::Debug + Send + Sync {
    /// Send a fully addressed message.
    fn send_message(&self, message: Message);

    /// Deliver a response to a client connected through this silo's gateway.
    /// Returns false when the target is not a gateway client here.
    fn try_deliver_to_proxy(&self, _message: &Message) -> bool {
        false
    }
}

/// Loopback transport for single-silo hosting.
#[derive(Debug)]
pub struct LocalTransport {
    local: SiloAddress,
    inbound: mpsc::UnboundedSender<Message>,
    remote: Option<Arc<dyn MessageTransport>>,
}

impl LocalTransport {
    /// Create the transport and the receiving end of its loopback channel.
    pub fn new(local: SiloAddress) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (inbound, receiver) = mpsc::unbounded_channel();
        (
            Self {
                local,
                inbound,
                remote: None,
            },
            receiver,
        )
    }

    /// Route messages for other silos through `remote`.
    pub fn with_remote(mut self, remote: Arc<dyn MessageTransport>) -> Self {
        self.remote = Some(remote);
        self
    }
}

impl MessageTransport for LocalTransport {
    fn send_message(&self, message: Message) {
        let is_local = message.target_silo.map_or(true, |silo| silo == self.local);
        if is_local {
            if self.inbound.send(message).is_err() {
                tracing::debug!("loopback receiver closed, dropping message");
            }
            return;
        }
        match &self.remote {
            Some(remote) => remote.send_message(message),
            None => tracing::warn!(%message, "no route to remote silo, dropping message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActivationAddress, ActivationId, GrainId, GrainType};

    #[tokio::test]
    async fn test_local_messages_loop_back() {
        let local = SiloAddress::localhost(1, 1);
        let (transport, mut rx) = LocalTransport::new(local);
        let grain = GrainId::new(GrainType(1), "a");
        let msg = Message::request(grain.clone(), 1, 1, Vec::new())
            .with_target_address(&ActivationAddress::new(local, grain, ActivationId(1)));

        transport.send_message(msg.clone());
        let received = rx.recv().await.expect("looped back");
        assert_eq!(received.id, msg.id);
    }

    #[tokio::test]
    async fn test_remote_without_route_is_dropped() {
        let local = SiloAddress::localhost(1, 1);
        let (transport, mut rx) = LocalTransport::new(local);
        let grain = GrainId::new(GrainType(1), "a");
        let msg = Message::request(grain.clone(), 1, 1, Vec::new()).with_target_address(
            &ActivationAddress::new(SiloAddress::localhost(2, 1), grain, ActivationId(1)),
        );

        transport.send_message(msg);
        assert!(rx.try_recv().is_err());
    }
}
