use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::address::{Address, REQUEST_OBJECT_PREFIX};
use crate::error::{Error, ErrorKind};
use crate::message::Message;
use crate::net::peer::PeerRegistry;

/// A sink for messages bound to an address.
///
/// Handlers are invoked from whatever worker delivers the message (a peer
/// connection reader, a service worker, or the caller itself for local
/// sends) and must therefore return quickly and never block.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, message: Message) -> Result<(), Error>;
}

/// Routes messages within the local context and to peer contexts.
///
/// Each context owns one router. Local destinations resolve through the
/// handler table without serializing the payload; remote destinations are
/// framed onto the peer connection responsible for the destination context.
pub struct MessageRouter {
    context_name: String,
    handlers: Mutex<HashMap<String, Arc<dyn MessageHandler>>>,
    peers: Arc<PeerRegistry>,
    peer_removed: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
}

impl MessageRouter {
    pub fn new(context_name: &str, peers: Arc<PeerRegistry>) -> Arc<MessageRouter> {
        let router = Arc::new(MessageRouter {
            context_name: context_name.to_string(),
            handlers: Mutex::new(HashMap::new()),
            peers: Arc::clone(&peers),
            peer_removed: Mutex::new(None),
        });
        peers.attach_router(&router);
        router
    }

    pub fn context_name(&self) -> &str {
        &self.context_name
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    /// Register a callback invoked when a peer connection is removed.
    /// The signal manager uses this to prune subscriptions involving the
    /// lost peer. Runs on the peer connection's reader worker.
    pub fn set_peer_removed_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        let mut slot = self.peer_removed.lock().expect("router callback mutex");
        *slot = Some(Box::new(callback));
    }

    pub(crate) fn notify_peer_removed(&self, peer_name: &str) {
        let slot = self.peer_removed.lock().expect("router callback mutex");
        if let Some(callback) = slot.as_ref() {
            callback(peer_name);
        }
    }

    /// Register a local message handler. Fails with `IllegalState` when the
    /// address is already taken and with `InvalidArgument` when the address
    /// does not belong to this context.
    pub fn register_handler(
        &self,
        address: &Address,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), Error> {
        if address.context != self.context_name {
            return Err(Error::invalid_argument(format!(
                "handler address {} is not in context {}",
                address, self.context_name
            )));
        }
        let mut handlers = self.handlers.lock().expect("router handler table");
        if handlers.contains_key(&address.object) {
            return Err(Error::illegal_state(format!(
                "duplicate message handler address {}",
                address
            )));
        }
        handlers.insert(address.object.clone(), handler);
        Ok(())
    }

    /// Remove a handler. Returns `false` when no handler was registered at
    /// the address. Messages in flight to the address are answered with an
    /// `UnknownReceiver` error reply.
    pub fn unregister_handler(&self, address: &Address) -> bool {
        let mut handlers = self.handlers.lock().expect("router handler table");
        handlers.remove(&address.object).is_some()
    }

    /// Send a message to its destination.
    ///
    /// Local destinations are delivered synchronously into the handler's
    /// queue; remote destinations are enqueued onto the peer connection.
    /// Non-blocking in both cases. Fails with `UnknownPeer` when the
    /// destination context is neither local nor connected.
    pub fn send(&self, message: Message) -> Result<(), Error> {
        let destination = match message.destination() {
            Some(destination) => destination.clone(),
            None => {
                return Err(Error::invalid_argument(
                    "message without destination address",
                ))
            }
        };
        if destination.context == self.context_name {
            return self.deliver_local(message);
        }
        // Strictly point-to-point: never forward remote traffic onwards.
        if let Some(source) = message.source() {
            if source.context != self.context_name {
                return Err(Error::invalid_argument(format!(
                    "refusing to forward message from {} to {}",
                    source.context, destination.context
                )));
            }
        }
        self.peers.send_to_peer(message)
    }

    /// Send with on-demand peer connection: when the destination context is
    /// not yet connected, run discovery, connect, and retry once.
    pub async fn dispatch(&self, message: Message) -> Result<(), Error> {
        let destination_context = match message.destination() {
            Some(destination) => destination.context.clone(),
            None => {
                return Err(Error::invalid_argument(
                    "message without destination address",
                ))
            }
        };
        match self.send(message.clone()) {
            Err(err) if err.kind == ErrorKind::UnknownPeer => {
                debug!(
                    "no connection to {}, attempting on-demand connect",
                    destination_context
                );
                self.peers.connect(&destination_context, None).await?;
                self.send(message)
            }
            other => other,
        }
    }

    /// Deliver a message to a local handler.
    ///
    /// A reply whose transient reply handler is already gone is discarded
    /// (the pending call timed out or was cancelled); any other unknown
    /// destination is an `UnknownReceiver` error, which the caller converts
    /// to an error reply when the message was a request.
    pub fn deliver_local(&self, message: Message) -> Result<(), Error> {
        let destination = match message.destination() {
            Some(destination) => destination.clone(),
            None => {
                return Err(Error::invalid_argument(
                    "message without destination address",
                ))
            }
        };
        if destination.context != self.context_name {
            return Err(Error::invalid_argument(format!(
                "cannot deliver message addressed to {} locally",
                destination
            )));
        }
        let handler = {
            let handlers = self.handlers.lock().expect("router handler table");
            handlers.get(&destination.object).cloned()
        };
        match handler {
            Some(handler) => handler.handle_message(message),
            None => {
                if message.is_reply() && destination.object.starts_with(REQUEST_OBJECT_PREFIX) {
                    // Late reply after timeout or cancellation.
                    debug!(
                        "discarding late reply for released handler {}",
                        destination
                    );
                    Ok(())
                } else {
                    Err(Error::unknown_receiver(format!(
                        "no message handler at {}",
                        destination
                    )))
                }
            }
        }
    }

    /// Deliver a message that arrived over a peer connection, answering
    /// undeliverable requests with an error reply to the source.
    pub(crate) fn deliver_inbound(&self, message: Message) {
        let is_request = matches!(message, Message::Request { .. });
        match self.deliver_local(message.clone()) {
            Ok(()) => {}
            Err(err) => {
                if is_request {
                    if let Some(reply) = Message::error_reply_to(&message, &err) {
                        if let Err(reply_err) = self.send(reply) {
                            debug!("failed to send error reply: {}", reply_err);
                        }
                    }
                } else {
                    warn!("dropping undeliverable message: {}", err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{new_request_id, Message};
    use crate::value::{Args, Value};
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        messages: StdMutex<Vec<Message>>,
    }

    impl MessageHandler for Recorder {
        fn handle_message(&self, message: Message) -> Result<(), Error> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn test_router(name: &str) -> Arc<MessageRouter> {
        let peers = PeerRegistry::new(name, "default", Default::default());
        MessageRouter::new(name, peers)
    }

    fn request_to(router_name: &str, object: &str) -> Message {
        Message::Request {
            source: Address::request_handler(router_name, new_request_id()),
            destination: Address::new(router_name, object),
            request_id: new_request_id(),
            method: "noop".to_string(),
            args: Args::none(),
            lock_token: None,
        }
    }

    #[tokio::test]
    async fn local_delivery_reaches_registered_handler() {
        let router = test_router("local");
        let recorder = Arc::new(Recorder {
            messages: StdMutex::new(Vec::new()),
        });
        let address = Address::new("local", "svc");
        router.register_handler(&address, recorder.clone()).unwrap();
        router.send(request_to("local", "svc")).unwrap();
        assert_eq!(recorder.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let router = test_router("local");
        let recorder = Arc::new(Recorder {
            messages: StdMutex::new(Vec::new()),
        });
        let address = Address::new("local", "svc");
        router.register_handler(&address, recorder.clone()).unwrap();
        let err = router.register_handler(&address, recorder).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalState);
    }

    #[tokio::test]
    async fn unknown_local_object_is_unknown_receiver() {
        let router = test_router("local");
        let err = router.send(request_to("local", "nope")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownReceiver);
    }

    #[tokio::test]
    async fn unknown_remote_context_is_unknown_peer() {
        let router = test_router("local");
        let message = Message::Request {
            source: Address::request_handler("local", 1),
            destination: Address::new("elsewhere", "svc"),
            request_id: 1,
            method: "noop".to_string(),
            args: Args::none(),
            lock_token: None,
        };
        let err = router.send(message).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownPeer);
    }

    #[tokio::test]
    async fn late_reply_is_discarded_silently() {
        let router = test_router("local");
        let reply = Message::Reply {
            source: Address::new("local", "svc"),
            destination: Address::request_handler("local", 42),
            request_id: 42,
            result: Ok(Value::Null),
        };
        // No handler registered: must not be an error.
        router.send(reply).unwrap();
    }
}
