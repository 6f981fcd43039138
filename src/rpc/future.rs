use log::debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::address::Address;
use crate::error::{Error, ErrorKind};
use crate::message::Message;
use crate::router::{MessageHandler, MessageRouter};
use crate::value::Value;

/// Message handler that completes a pending call. Registered at the
/// future's transient reply address; accepts at most one reply.
pub(crate) struct ReplyHandler {
    sender: Mutex<Option<oneshot::Sender<Message>>>,
}

impl MessageHandler for ReplyHandler {
    fn handle_message(&self, message: Message) -> Result<(), Error> {
        let sender = {
            let mut slot = self.sender.lock().expect("reply handler slot");
            slot.take()
        };
        match sender {
            Some(sender) => {
                // A dropped receiver means the caller gave up; discard.
                let _ = sender.send(message);
                Ok(())
            }
            None => {
                debug!("discarding extra reply for completed call");
                Ok(())
            }
        }
    }
}

/// Client-side completion record for one pending remote call.
///
/// Created when a proxy emits a request; completes when the matching reply
/// arrives at the transient reply handler. Dropping the future detaches
/// the handler; a reply arriving afterwards is discarded by the router.
pub struct RpcFuture {
    request_id: u64,
    reply_address: Address,
    destination: Address,
    router: Arc<MessageRouter>,
    receiver: Option<oneshot::Receiver<Message>>,
}

impl RpcFuture {
    /// Allocate a request id and register the reply handler for it.
    pub(crate) fn register(
        router: Arc<MessageRouter>,
        destination: Address,
    ) -> Result<RpcFuture, Error> {
        let request_id = crate::message::new_request_id();
        let reply_address = Address::request_handler(router.context_name(), request_id);
        let (sender, receiver) = oneshot::channel();
        router.register_handler(
            &reply_address,
            Arc::new(ReplyHandler {
                sender: Mutex::new(Some(sender)),
            }),
        )?;
        Ok(RpcFuture {
            request_id,
            reply_address,
            destination,
            router,
            receiver: Some(receiver),
        })
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Address replies for this call must be sent to; used as the request's
    /// source address.
    pub fn reply_address(&self) -> &Address {
        &self.reply_address
    }

    fn detach(&mut self) {
        self.receiver = None;
        self.router.unregister_handler(&self.reply_address);
    }

    /// Wait for the reply, up to `timeout` (`None` waits indefinitely).
    ///
    /// A remote exception payload is translated back into a local error of
    /// the equivalent kind. On timeout the future is detached; a reply
    /// arriving later is discarded by the router at debug level.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<Value, Error> {
        let receiver = match self.receiver.take() {
            Some(receiver) => receiver,
            None => return Err(Error::illegal_state("call future already completed")),
        };
        let received = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, receiver).await {
                Ok(received) => received,
                Err(_) => {
                    self.detach();
                    return Err(Error::timeout(format!(
                        "no reply from {} within {:?}",
                        self.destination, timeout
                    )));
                }
            },
            None => receiver.await,
        };
        self.detach();
        let message = received.map_err(|_| {
            Error::illegal_state("reply handler released before completion")
        })?;
        match message {
            Message::Reply { result, .. } => result.map_err(Error::from),
            Message::ErrorReply { kind, message, .. } => {
                let parsed_kind = ErrorKind::parse(&kind).unwrap_or(ErrorKind::ApplicationError);
                Err(Error::new(parsed_kind, message))
            }
            other => Err(Error::application(format!(
                "unexpected message in reply slot: {:?}",
                other
            ))),
        }
    }

    /// Cancel the pending call. Local effect only: the in-flight remote
    /// work is not interrupted, and a late reply is discarded.
    pub fn cancel(mut self) {
        debug!(
            "cancelling pending call {:016x} to {}",
            self.request_id, self.destination
        );
        self.detach();
    }
}

impl Drop for RpcFuture {
    fn drop(&mut self) {
        if self.receiver.is_some() {
            self.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::peer::{PeerOptions, PeerRegistry};

    fn test_router() -> Arc<MessageRouter> {
        let peers = PeerRegistry::new("local", "default", PeerOptions::default());
        MessageRouter::new("local", peers)
    }

    fn complete(router: &Arc<MessageRouter>, future: &RpcFuture, value: Value) {
        let reply = Message::Reply {
            source: Address::new("local", "svc"),
            destination: future.reply_address().clone(),
            request_id: future.request_id(),
            result: Ok(value),
        };
        router.send(reply).unwrap();
    }

    #[tokio::test]
    async fn completes_with_reply_value() {
        let router = test_router();
        let future = RpcFuture::register(Arc::clone(&router), Address::new("local", "svc")).unwrap();
        complete(&router, &future, Value::Int(5));
        let value = future.wait(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(value, Value::Int(5));
    }

    #[tokio::test]
    async fn times_out_and_detaches() {
        let router = test_router();
        let future = RpcFuture::register(Arc::clone(&router), Address::new("local", "svc")).unwrap();
        let reply_address = future.reply_address().clone();
        let request_id = future.request_id();
        let err = future.wait(Some(Duration::from_millis(30))).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        // A late reply is now discarded silently by the router.
        let late = Message::Reply {
            source: Address::new("local", "svc"),
            destination: reply_address,
            request_id,
            result: Ok(Value::Null),
        };
        router.send(late).unwrap();
    }

    #[tokio::test]
    async fn error_reply_kind_round_trips() {
        let router = test_router();
        let future = RpcFuture::register(Arc::clone(&router), Address::new("local", "svc")).unwrap();
        let reply = Message::ErrorReply {
            source: Address::new("local", "svc"),
            destination: future.reply_address().clone(),
            request_id: future.request_id(),
            kind: "PeerLost".to_string(),
            message: "connection closed".to_string(),
        };
        router.send(reply).unwrap();
        let err = future.wait(Some(Duration::from_secs(1))).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PeerLost);
    }

    #[tokio::test]
    async fn cancelled_future_discards_reply() {
        let router = test_router();
        let future = RpcFuture::register(Arc::clone(&router), Address::new("local", "svc")).unwrap();
        let reply_address = future.reply_address().clone();
        let request_id = future.request_id();
        future.cancel();
        let reply = Message::Reply {
            source: Address::new("local", "svc"),
            destination: reply_address,
            request_id,
            result: Ok(Value::Int(1)),
        };
        // Discarded, not an error.
        router.send(reply).unwrap();
    }
}
