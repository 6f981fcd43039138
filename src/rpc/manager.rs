use futures::FutureExt;
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::address::{Address, LOCK_TOKEN_PREFIX};
use crate::error::Error;
use crate::message::{Message, RemoteError};
use crate::router::{MessageHandler, MessageRouter};
use crate::rpc::service::{RpcService, ServiceDescriptor};
use crate::value::Value;
use crate::worker::{StopToken, Worker};

/// Context-wide counter for default lock tokens (`$lock_N`).
static LOCK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Methods served by the manager itself, allowed regardless of lock state.
const LOCK_METHODS: &[&str] = &["lock", "unlock", "force_unlock", "is_locked"];
const INTROSPECTION_METHODS: &[&str] = &["get_name", "get_methods", "get_signals"];

/// Lock state of one managed service.
struct LockState {
    token: String,
    owner_context: String,
    is_default: bool,
}

/// Handler that enqueues inbound messages for the service worker.
struct QueueHandler {
    tx: mpsc::UnboundedSender<Message>,
}

impl MessageHandler for QueueHandler {
    fn handle_message(&self, message: Message) -> Result<(), Error> {
        self.tx
            .send(message)
            .map_err(|_| Error::unknown_receiver("service worker has stopped"))
    }
}

/// Owns one service instance and the worker that serialises invocations
/// against it.
///
/// Requests execute strictly in arrival order; the service instance is
/// mutated only from its own worker. Lock state lives inside the worker
/// routine and is queried and changed exclusively through lock requests.
pub struct RpcObjectManager {
    address: Address,
    descriptor: ServiceDescriptor,
    worker: Worker,
}

impl RpcObjectManager {
    /// Register the service's handler and start its worker.
    pub fn start(
        router: Arc<MessageRouter>,
        address: Address,
        service: Box<dyn RpcService>,
    ) -> Result<Arc<RpcObjectManager>, Error> {
        let descriptor = service.describe();
        let (tx, rx) = mpsc::unbounded_channel();
        router.register_handler(&address, Arc::new(QueueHandler { tx }))?;

        let worker = Worker::spawn(format!("rpc-{}", address.object), {
            let router = Arc::clone(&router);
            let address = address.clone();
            let descriptor = descriptor.clone();
            move |stop| service_loop(service, rx, router, address, descriptor, stop)
        });

        Ok(Arc::new(RpcObjectManager {
            address,
            descriptor,
            worker,
        }))
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Request cooperative stop of the service worker without waiting.
    pub fn request_stop(&self) {
        self.worker.request_stop();
    }

    /// Wait for the worker to finish draining. Requests still queued are
    /// answered with an error reply before the service is released.
    pub async fn join(&self, timeout: Option<Duration>) -> Result<(), Error> {
        self.worker.join(timeout).await
    }

    /// Stop the worker and wait for it to drain.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<(), Error> {
        self.worker.request_stop();
        self.worker.join(timeout).await
    }
}

/// The service worker routine: drains the request FIFO one message at a
/// time until stopped, then rejects leftovers and releases the service.
async fn service_loop(
    mut service: Box<dyn RpcService>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    router: Arc<MessageRouter>,
    address: Address,
    descriptor: ServiceDescriptor,
    stop: StopToken,
) -> anyhow::Result<()> {
    let mut lock: Option<LockState> = None;
    debug!("service worker {} started", address);
    loop {
        let message = tokio::select! {
            _ = stop.wait() => break,
            next = rx.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };
        let request = match message {
            request @ Message::Request { .. } => request,
            other => {
                warn!("service {} ignoring non-request message {:?}", address, other);
                continue;
            }
        };
        match handle_request(&mut *service, &descriptor, &address, &mut lock, &request).await {
            Outcome::Reply(reply) => {
                if let Err(err) = router.send(reply) {
                    error!("service {} failed to send reply: {}", address, err);
                }
            }
            Outcome::Fatal(panic_message) => {
                // Corrupted service state: answer the current request, then
                // unregister so that future requests get UnknownReceiver.
                error!(
                    "service {} terminated by fatal error: {}",
                    address, panic_message
                );
                let failure = Error::application(format!(
                    "service {} failed fatally: {}",
                    address.object, panic_message
                ));
                if let Some(reply) = Message::error_reply_to(&request, &failure) {
                    if let Err(err) = router.send(reply) {
                        debug!("failed to send fatal error reply: {}", err);
                    }
                }
                router.unregister_handler(&address);
                reject_remaining(&router, &address, &mut rx);
                return Err(anyhow::anyhow!("service {} panicked", address));
            }
        }
    }
    reject_remaining(&router, &address, &mut rx);
    service.released().await;
    debug!("service worker {} stopped", address);
    Ok(())
}

enum Outcome {
    Reply(Message),
    Fatal(String),
}

async fn handle_request(
    service: &mut dyn RpcService,
    descriptor: &ServiceDescriptor,
    address: &Address,
    lock: &mut Option<LockState>,
    request: &Message,
) -> Outcome {
    let (source, method, args, lock_token) = match request {
        Message::Request {
            source,
            method,
            args,
            lock_token,
            ..
        } => (source, method.as_str(), args, lock_token),
        _ => unreachable!("caller filters non-requests"),
    };

    // Lock management and introspection bypass the lock check.
    if LOCK_METHODS.contains(&method) {
        let result = handle_lock_request(address, lock, method, args, &source.context);
        return Outcome::Reply(
            Message::reply_to(request, result.map_err(RemoteError::from))
                .expect("request produces reply"),
        );
    }
    if INTROSPECTION_METHODS.contains(&method) {
        let value = match method {
            "get_name" => Value::Str(address.object.clone()),
            "get_methods" => Value::List(
                descriptor
                    .method_names()
                    .into_iter()
                    .map(Value::Str)
                    .collect(),
            ),
            _ => Value::List(
                descriptor
                    .signal_names()
                    .into_iter()
                    .map(Value::Str)
                    .collect(),
            ),
        };
        return Outcome::Reply(Message::reply_to(request, Ok(value)).expect("request produces reply"));
    }

    if let Some(state) = lock.as_ref() {
        if lock_token.as_deref() != Some(state.token.as_str()) {
            warn!(
                "service {} is locked, refusing {} from {}",
                address, method, source
            );
            let err = Error::locked(format!("service {} is locked", address.object));
            return Outcome::Reply(
                Message::error_reply_to(request, &err).expect("request produces reply"),
            );
        }
    }

    if !descriptor.has_method(method) {
        let err = Error::unknown_method(format!(
            "service {} has no method {:?}",
            address.object, method
        ));
        return Outcome::Reply(
            Message::error_reply_to(request, &err).expect("request produces reply"),
        );
    }

    // Invoke the service; a panic here is fatal for the whole worker.
    let invocation = AssertUnwindSafe(service.call(method, args)).catch_unwind();
    match invocation.await {
        Ok(result) => Outcome::Reply(
            Message::reply_to(request, result.map_err(RemoteError::from))
                .expect("request produces reply"),
        ),
        Err(panic) => Outcome::Fatal(panic_text(panic)),
    }
}

/// Lock/unlock/force-unlock/is-locked, serialised on the service worker
/// like every other request.
fn handle_lock_request(
    address: &Address,
    lock: &mut Option<LockState>,
    method: &str,
    args: &crate::value::Args,
    requester_context: &str,
) -> Result<Value, Error> {
    let requested_token = match args.keyword("token") {
        Some(Value::Str(token)) if !token.is_empty() => Some(token.clone()),
        Some(Value::Null) | None => None,
        Some(other) => {
            return Err(Error::invalid_argument(format!(
                "lock token must be a string, got {}",
                other.kind_name()
            )))
        }
    };
    match method {
        "lock" => {
            let (granted, token) = match lock.as_ref() {
                None => {
                    let (token, is_default) = match requested_token {
                        Some(token) => (token, false),
                        None => {
                            let n = LOCK_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
                            (format!("{}{}", LOCK_TOKEN_PREFIX, n), true)
                        }
                    };
                    info!("service {} locked with token {}", address, token);
                    *lock = Some(LockState {
                        token: token.clone(),
                        owner_context: requester_context.to_string(),
                        is_default,
                    });
                    (true, Some(token))
                }
                Some(state) if requested_token.as_deref() == Some(state.token.as_str()) => {
                    // Same token, already locked; nothing to do.
                    (true, Some(state.token.clone()))
                }
                Some(state) => {
                    warn!(
                        "lock request for {} denied, already locked by {}",
                        address, state.owner_context
                    );
                    (false, None)
                }
            };
            let mut fields = BTreeMap::new();
            fields.insert("granted".to_string(), Value::Bool(granted));
            fields.insert(
                "token".to_string(),
                token.map(Value::Str).unwrap_or(Value::Null),
            );
            Ok(Value::Map(fields))
        }
        "unlock" => match (lock.as_ref(), requested_token) {
            (Some(state), Some(token)) if state.token == token => {
                info!("service {} unlocked", address);
                *lock = None;
                Ok(Value::Bool(true))
            }
            (Some(_), _) => {
                warn!("unlock request for {} with wrong token", address);
                Ok(Value::Bool(false))
            }
            (None, _) => {
                warn!("unlock request for {} which is not locked", address);
                Ok(Value::Bool(false))
            }
        },
        "force_unlock" => {
            if let Some(state) = lock.take() {
                warn!(
                    "service {} forcefully unlocked (was locked by {} with a {} token)",
                    address,
                    state.owner_context,
                    if state.is_default { "default" } else { "custom" }
                );
            }
            Ok(Value::Null)
        }
        "is_locked" => Ok(Value::Bool(lock.is_some())),
        _ => unreachable!("caller filters lock methods"),
    }
}

/// Answer requests still queued when the worker stops.
fn reject_remaining(
    router: &Arc<MessageRouter>,
    address: &Address,
    rx: &mut mpsc::UnboundedReceiver<Message>,
) {
    let err = Error::unknown_receiver(format!("service {} is shutting down", address.object));
    while let Ok(message) = rx.try_recv() {
        if let Some(reply) = Message::error_reply_to(&message, &err) {
            if let Err(send_err) = router.send(reply) {
                debug!("failed to reject queued request: {}", send_err);
            }
        }
    }
}

fn panic_text(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
