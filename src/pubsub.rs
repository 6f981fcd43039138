// Publish/subscribe. Each context's signal manager is a message handler
// at the well-known `$signals` address. Subscription management is plain
// RPC against that address, so local and remote subscribers go through
// the same path; published payloads fan out as signal messages through
// the router, per-subscriber FIFO.

use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::address::{validate_name, Address};
use crate::error::Error;
use crate::message::Message;
use crate::router::{MessageHandler, MessageRouter};
use crate::rpc::proxy::Proxy;
use crate::value::{Args, Timestamp, Value};
use crate::worker::Worker;

/// One signal delivery as seen by a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedSignal {
    pub publisher: Address,
    pub name: String,
    pub seq: u64,
    pub timestamp: Timestamp,
    pub payload: Value,
}

/// A signal channel: the publishing service plus the signal name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SignalKey {
    service: Address,
    name: String,
}

/// Publisher-side record of one subscriber endpoint.
struct SubscriberEntry {
    address: Address,
    seq: u64,
}

struct ReceiverShared {
    queue: Mutex<VecDeque<ReceivedSignal>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl ReceiverShared {
    fn push(&self, signal: ReceivedSignal, receiver_id: &str) {
        {
            let mut queue = self.queue.lock().expect("receiver queue");
            if queue.len() >= self.capacity {
                // Never block the publisher: drop the oldest entry.
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!(
                        "signal receiver {} overflowed, {} signals dropped",
                        receiver_id, dropped
                    );
                }
            }
            queue.push_back(signal);
        }
        self.notify.notify_waiters();
    }
}

/// Bounded FIFO buffer for incoming signals.
///
/// A subscriber either polls the buffer (`pop`, `pop_timeout`) or hands it
/// to [`SignalReceiver::spawn_callback`] to have a worker invoke a callback
/// per signal. Dropping the receiver removes its local subscriptions.
pub struct SignalReceiver {
    id: String,
    shared: Arc<ReceiverShared>,
    manager: Arc<SignalManager>,
}

impl SignalReceiver {
    /// Number of signals waiting in the buffer.
    pub fn len(&self) -> usize {
        self.shared.queue.lock().expect("receiver queue").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_signal_ready(&self) -> bool {
        !self.is_empty()
    }

    /// Signals discarded due to buffer overflow.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Remove and return the oldest buffered signal, if any.
    pub fn pop(&self) -> Option<ReceivedSignal> {
        self.shared.queue.lock().expect("receiver queue").pop_front()
    }

    /// Wait up to `timeout` for a signal.
    pub async fn pop_timeout(&self, timeout: Duration) -> Result<ReceivedSignal, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.notify.notified();
            if let Some(signal) = self.pop() {
                return Ok(signal);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout("no signal within timeout"));
            }
            // Wake-ups are edge-triggered; re-check the queue either way.
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    /// Discard everything currently buffered.
    pub fn discard_all(&self) {
        self.shared.queue.lock().expect("receiver queue").clear();
    }

    /// Consume the receiver and run `callback` for each signal on a
    /// dedicated worker until the worker is stopped.
    pub fn spawn_callback(
        self,
        callback: impl Fn(ReceivedSignal) + Send + Sync + 'static,
    ) -> Worker {
        Worker::spawn(format!("signal-callback-{}", self.id), move |stop| async move {
            while !stop.stop_requested() {
                tokio::select! {
                    _ = stop.wait() => break,
                    received = self.pop_timeout(Duration::from_millis(200)) => {
                        if let Ok(signal) = received {
                            callback(signal);
                        }
                    }
                }
            }
            Ok(())
        })
    }
}

impl Drop for SignalReceiver {
    fn drop(&mut self) {
        self.manager.release_receiver(&self.id);
    }
}

struct ManagerState {
    /// Publisher side: subscribers per locally published signal.
    subscribers: HashMap<SignalKey, Vec<SubscriberEntry>>,
    /// Subscriber side: local receiver ids per subscribed signal.
    subscriptions: HashMap<SignalKey, Vec<String>>,
    /// Local receiver buffers by id.
    receivers: HashMap<String, Arc<ReceiverShared>>,
}

/// Tracks subscriber endpoints per signal and fans out published payloads.
///
/// One per context, registered as the message handler of the `$signals`
/// object. Handles three inbound flows: subscription requests (local or
/// remote), incoming signal messages for local receivers, and publishes
/// from local services.
pub struct SignalManager {
    context_name: String,
    router: Arc<MessageRouter>,
    default_capacity: usize,
    subscribe_timeout: Duration,
    state: Mutex<ManagerState>,
}

struct SignalManagerHandler {
    manager: Arc<SignalManager>,
}

impl MessageHandler for SignalManagerHandler {
    fn handle_message(&self, message: Message) -> Result<(), Error> {
        match message {
            request @ Message::Request { .. } => {
                self.manager.handle_subscription_request(&request);
                Ok(())
            }
            Message::Signal {
                source,
                name,
                seq,
                timestamp,
                payload,
                ..
            } => {
                self.manager.deliver_local(ReceivedSignal {
                    publisher: source,
                    name,
                    seq,
                    timestamp,
                    payload,
                });
                Ok(())
            }
            other => {
                debug!("signal manager ignoring message {:?}", other);
                Ok(())
            }
        }
    }
}

impl SignalManager {
    /// Create the manager and register it at the context's `$signals`
    /// address. Also hooks the router's peer-removed callback to prune
    /// subscriptions involving a lost peer.
    pub fn start(
        router: Arc<MessageRouter>,
        default_capacity: usize,
        subscribe_timeout: Duration,
    ) -> Result<Arc<SignalManager>, Error> {
        let manager = Arc::new(SignalManager {
            context_name: router.context_name().to_string(),
            router: Arc::clone(&router),
            default_capacity,
            subscribe_timeout,
            state: Mutex::new(ManagerState {
                subscribers: HashMap::new(),
                subscriptions: HashMap::new(),
                receivers: HashMap::new(),
            }),
        });
        router.register_handler(
            &Address::signal_manager(&manager.context_name),
            Arc::new(SignalManagerHandler {
                manager: Arc::clone(&manager),
            }),
        )?;
        router.set_peer_removed_callback({
            let manager = Arc::downgrade(&manager);
            move |peer| {
                if let Some(manager) = manager.upgrade() {
                    manager.prune_peer(peer);
                }
            }
        });
        Ok(manager)
    }

    /// Create a signal receiver with the default buffer capacity.
    pub fn receiver(self: &Arc<Self>) -> SignalReceiver {
        self.receiver_with_capacity(self.default_capacity)
    }

    pub fn receiver_with_capacity(self: &Arc<Self>, capacity: usize) -> SignalReceiver {
        let id = format!("recv-{}", Uuid::new_v4().simple());
        let shared = Arc::new(ReceiverShared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        });
        let mut state = self.state.lock().expect("signal manager state");
        state.receivers.insert(id.clone(), Arc::clone(&shared));
        SignalReceiver {
            id,
            shared,
            manager: Arc::clone(self),
        }
    }

    /// Subscribe a receiver to `(publisher, signal)`.
    ///
    /// For a local publisher the subscriber set is updated directly; for a
    /// remote publisher the first local receiver triggers a subscription
    /// request to the publisher context's signal manager and the call
    /// blocks until that request is answered.
    pub async fn subscribe(
        &self,
        publisher: &Address,
        signal: &str,
        receiver: &SignalReceiver,
    ) -> Result<(), Error> {
        validate_name(signal)?;
        let key = SignalKey {
            service: publisher.clone(),
            name: signal.to_string(),
        };
        let first = {
            let mut state = self.state.lock().expect("signal manager state");
            let ids = state.subscriptions.entry(key.clone()).or_default();
            let first = ids.is_empty();
            if !ids.iter().any(|id| id == &receiver.id) {
                ids.push(receiver.id.clone());
            }
            first
        };
        let local_manager = Address::signal_manager(&self.context_name);
        if publisher.context == self.context_name {
            self.add_subscriber(publisher, signal, &local_manager);
            return Ok(());
        }
        if first {
            let result = self
                .remote_subscription_request(publisher, signal, "subscribe")
                .await;
            if let Err(err) = result {
                // Roll back so a retry counts as "first" again.
                let mut state = self.state.lock().expect("signal manager state");
                if let Some(ids) = state.subscriptions.get_mut(&key) {
                    ids.retain(|id| id != &receiver.id);
                    if ids.is_empty() {
                        state.subscriptions.remove(&key);
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Unsubscribe a receiver from `(publisher, signal)`. Removing the
    /// last local receiver of a remote signal sends an unsubscribe request
    /// to the publisher context. Unsubscribing an absent pair does nothing.
    pub async fn unsubscribe(
        &self,
        publisher: &Address,
        signal: &str,
        receiver: &SignalReceiver,
    ) -> Result<(), Error> {
        let key = SignalKey {
            service: publisher.clone(),
            name: signal.to_string(),
        };
        let last = {
            let mut state = self.state.lock().expect("signal manager state");
            match state.subscriptions.get_mut(&key) {
                Some(ids) => {
                    ids.retain(|id| id != &receiver.id);
                    if ids.is_empty() {
                        state.subscriptions.remove(&key);
                        true
                    } else {
                        false
                    }
                }
                None => return Ok(()),
            }
        };
        if !last {
            return Ok(());
        }
        if publisher.context == self.context_name {
            let local_manager = Address::signal_manager(&self.context_name);
            self.remove_subscriber(publisher, signal, &local_manager);
            Ok(())
        } else {
            self.remote_subscription_request(publisher, signal, "unsubscribe")
                .await
        }
    }

    /// Publish a payload on `(service, signal)` to every subscriber.
    /// At-most-once per subscriber; the publisher never blocks.
    pub fn publish(&self, service: &str, signal: &str, payload: Value) {
        let key = SignalKey {
            service: Address::new(&self.context_name, service),
            name: signal.to_string(),
        };
        let timestamp = Timestamp::now();
        let deliveries: Vec<(Address, u64)> = {
            let mut state = self.state.lock().expect("signal manager state");
            match state.subscribers.get_mut(&key) {
                Some(entries) => entries
                    .iter_mut()
                    .map(|entry| {
                        entry.seq += 1;
                        (entry.address.clone(), entry.seq)
                    })
                    .collect(),
                None => return,
            }
        };
        for (subscriber, seq) in deliveries {
            let message = Message::Signal {
                source: key.service.clone(),
                destination: subscriber.clone(),
                name: signal.to_string(),
                seq,
                timestamp,
                payload: payload.clone(),
            };
            if let Err(err) = self.router.send(message) {
                warn!(
                    "failed to deliver signal {}.{} to {}: {}",
                    service, signal, subscriber, err
                );
            }
        }
    }

    /// Handle subscribe/unsubscribe requests arriving at `$signals`.
    fn handle_subscription_request(&self, request: &Message) {
        let (method, args) = match request {
            Message::Request { method, args, .. } => (method.as_str(), args),
            _ => return,
        };
        let result = self.apply_subscription_change(method, args);
        let reply = match result {
            Ok(value) => Message::reply_to(request, Ok(value)),
            Err(err) => Message::error_reply_to(request, &err),
        };
        if let Some(reply) = reply {
            if let Err(err) = self.router.send(reply) {
                debug!("failed to answer subscription request: {}", err);
            }
        }
    }

    fn apply_subscription_change(&self, method: &str, args: &Args) -> Result<Value, Error> {
        let service = args.require_str(0)?;
        let signal = args.require_str(1)?;
        let subscriber: Address = args.require_str(2)?.parse()?;
        let publisher = Address::new(&self.context_name, service);
        match method {
            "subscribe" => {
                self.add_subscriber(&publisher, signal, &subscriber);
                Ok(Value::Bool(true))
            }
            "unsubscribe" => {
                self.remove_subscriber(&publisher, signal, &subscriber);
                Ok(Value::Bool(true))
            }
            other => Err(Error::unknown_method(format!(
                "signal manager has no method {:?}",
                other
            ))),
        }
    }

    /// Idempotently add a subscriber endpoint on the publisher side.
    fn add_subscriber(&self, publisher: &Address, signal: &str, subscriber: &Address) {
        let key = SignalKey {
            service: publisher.clone(),
            name: signal.to_string(),
        };
        let mut state = self.state.lock().expect("signal manager state");
        let entries = state.subscribers.entry(key).or_default();
        if !entries.iter().any(|entry| &entry.address == subscriber) {
            debug!(
                "subscriber {} added to signal {}.{}",
                subscriber, publisher, signal
            );
            entries.push(SubscriberEntry {
                address: subscriber.clone(),
                seq: 0,
            });
        }
    }

    fn remove_subscriber(&self, publisher: &Address, signal: &str, subscriber: &Address) {
        let key = SignalKey {
            service: publisher.clone(),
            name: signal.to_string(),
        };
        let mut state = self.state.lock().expect("signal manager state");
        if let Some(entries) = state.subscribers.get_mut(&key) {
            entries.retain(|entry| &entry.address != subscriber);
            if entries.is_empty() {
                state.subscribers.remove(&key);
            }
        }
    }

    /// Send a subscribe/unsubscribe request to a remote publisher context
    /// and wait for the answer.
    async fn remote_subscription_request(
        &self,
        publisher: &Address,
        signal: &str,
        method: &str,
    ) -> Result<(), Error> {
        let proxy = Proxy::new(
            Arc::clone(&self.router),
            Address::signal_manager(&publisher.context),
        );
        let subscriber = Address::signal_manager(&self.context_name);
        let args = Args::positional(vec![
            Value::Str(publisher.object.clone()),
            Value::Str(signal.to_string()),
            Value::Str(subscriber.to_string()),
        ]);
        proxy
            .call_with_timeout(method, args, Some(self.subscribe_timeout))
            .await?;
        Ok(())
    }

    /// Fan an incoming signal out to the local receivers subscribed to it.
    fn deliver_local(&self, signal: ReceivedSignal) {
        let key = SignalKey {
            service: signal.publisher.clone(),
            name: signal.name.clone(),
        };
        let targets: Vec<(String, Arc<ReceiverShared>)> = {
            let state = self.state.lock().expect("signal manager state");
            match state.subscriptions.get(&key) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| {
                        state
                            .receivers
                            .get(id)
                            .map(|shared| (id.clone(), Arc::clone(shared)))
                    })
                    .collect(),
                None => {
                    debug!(
                        "signal {}.{} without local subscribers",
                        signal.publisher, signal.name
                    );
                    return;
                }
            }
        };
        for (id, shared) in targets {
            shared.push(signal.clone(), &id);
        }
    }

    /// Drop a receiver's buffer and local subscription entries.
    fn release_receiver(&self, receiver_id: &str) {
        let mut state = self.state.lock().expect("signal manager state");
        state.receivers.remove(receiver_id);
        state.subscriptions.retain(|_, ids| {
            ids.retain(|id| id != receiver_id);
            !ids.is_empty()
        });
    }

    /// Remove every subscription record involving a lost peer: its
    /// endpoints in publisher-side subscriber sets and the local records
    /// of subscriptions to its signals.
    fn prune_peer(&self, peer: &str) {
        let mut state = self.state.lock().expect("signal manager state");
        state.subscribers.retain(|_, entries| {
            entries.retain(|entry| entry.address.context != peer);
            !entries.is_empty()
        });
        state
            .subscriptions
            .retain(|key, _| key.service.context != peer);
    }
}

/// Publishing endpoint for one `(service, signal)` pair, handed to the
/// service or task that declares the signal.
#[derive(Clone)]
pub struct SignalPublisher {
    service: String,
    name: String,
    manager: Arc<SignalManager>,
}

impl SignalPublisher {
    pub(crate) fn new(service: &str, name: &str, manager: Arc<SignalManager>) -> SignalPublisher {
        SignalPublisher {
            service: service.to_string(),
            name: name.to_string(),
            manager,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a payload to all current subscribers. Never blocks.
    pub fn publish(&self, payload: Value) {
        self.manager.publish(&self.service, &self.name, payload);
    }
}
