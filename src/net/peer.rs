// Peer TCP connections. Each connection is a framed stream with one
// reader worker and one writer worker; the first frame in either
// direction is the handshake. The registry maps peer context names to
// live connections and fails pending requests with PeerLost when a
// connection goes away.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::address::Address;
use crate::error::{Error, ErrorKind};
use crate::message::{Message, PROTOCOL_VERSION};
use crate::net::discovery;
use crate::net::framing::{read_frame, write_frame};
use crate::router::MessageRouter;

/// Timeouts and discovery parameters used when opening connections.
#[derive(Debug, Clone)]
pub struct PeerOptions {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub discovery_port: u16,
    pub discovery_window: Duration,
}

impl Default for PeerOptions {
    fn default() -> PeerOptions {
        PeerOptions {
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(5),
            discovery_port: crate::config::DEFAULT_DISCOVERY_PORT,
            discovery_window: Duration::from_millis(500),
        }
    }
}

/// One live peer connection.
pub struct PeerHandle {
    pub context_name: String,
    pub endpoint: SocketAddr,
    outbound: mpsc::UnboundedSender<Message>,
    /// Outgoing requests awaiting replies over this connection, by request
    /// id. Used to fail the waiting futures when the connection is lost.
    pending: Arc<Mutex<HashMap<u64, (Address, Address)>>>,
    last_activity: Arc<Mutex<Instant>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl PeerHandle {
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().expect("peer activity mutex")
    }
}

/// Registry of live peer connections, keyed by peer context name.
///
/// A connection exists in the registry iff the handshake succeeded in both
/// directions. The registry is shared by the router (sends), the TCP
/// listener (incoming connections) and the context (connect/disconnect).
pub struct PeerRegistry {
    local_context: String,
    workgroup: String,
    options: PeerOptions,
    peers: RwLock<HashMap<String, Arc<PeerHandle>>>,
    router: Mutex<Weak<MessageRouter>>,
}

impl PeerRegistry {
    pub fn new(local_context: &str, workgroup: &str, options: PeerOptions) -> Arc<PeerRegistry> {
        Arc::new(PeerRegistry {
            local_context: local_context.to_string(),
            workgroup: workgroup.to_string(),
            options,
            peers: RwLock::new(HashMap::new()),
            router: Mutex::new(Weak::new()),
        })
    }

    /// Wire up the router after construction. The registry only keeps a
    /// weak reference; the context owns both components.
    pub(crate) fn attach_router(&self, router: &Arc<MessageRouter>) {
        let mut slot = self.router.lock().expect("peer registry router slot");
        *slot = Arc::downgrade(router);
    }

    fn router(&self) -> Result<Arc<MessageRouter>, Error> {
        self.router
            .lock()
            .expect("peer registry router slot")
            .upgrade()
            .ok_or_else(|| Error::illegal_state("message router is gone"))
    }

    pub fn peer_names(&self) -> Vec<String> {
        let peers = self.peers.read().expect("peer table");
        peers.keys().cloned().collect()
    }

    pub fn has_peer(&self, name: &str) -> bool {
        let peers = self.peers.read().expect("peer table");
        peers.contains_key(name)
    }

    /// Frame a message onto the connection of its destination context.
    /// Fails with `UnknownPeer` when no connection exists.
    pub fn send_to_peer(&self, message: Message) -> Result<(), Error> {
        let destination = message
            .destination()
            .ok_or_else(|| Error::invalid_argument("message without destination address"))?
            .clone();
        let handle = {
            let peers = self.peers.read().expect("peer table");
            peers.get(&destination.context).cloned()
        };
        let handle = handle.ok_or_else(|| {
            Error::unknown_peer(format!("no connection to context {}", destination.context))
        })?;
        // Track outgoing requests so the waiting future can be failed with
        // PeerLost if the connection goes away before the reply.
        if let Message::Request {
            source,
            destination,
            request_id,
            ..
        } = &message
        {
            let mut pending = handle.pending.lock().expect("peer pending table");
            if pending
                .insert(*request_id, (source.clone(), destination.clone()))
                .is_some()
            {
                warn!(
                    "duplicate request id {:016x} on connection to {}",
                    request_id, handle.context_name
                );
            }
        }
        handle.outbound.send(message).map_err(|_| {
            Error::peer_lost(format!(
                "connection to context {} is closing",
                destination.context
            ))
        })
    }

    /// Open a connection to the named peer context and exchange handshakes.
    /// Without an explicit endpoint the peer is located via discovery.
    pub async fn connect(
        self: &Arc<Self>,
        name: &str,
        endpoint: Option<SocketAddr>,
    ) -> Result<(), Error> {
        if name == self.local_context {
            return Err(Error::invalid_argument(
                "cannot open a peer connection to the local context",
            ));
        }
        if name.starts_with('$') {
            return Err(Error::invalid_argument(format!(
                "invalid peer context name {:?}",
                name
            )));
        }
        if self.has_peer(name) {
            return Err(Error::illegal_state(format!(
                "already connected to context {}",
                name
            )));
        }
        let endpoint = match endpoint {
            Some(endpoint) => endpoint,
            None => {
                discovery::locate_context(
                    name,
                    &self.workgroup,
                    self.options.discovery_port,
                    self.options.discovery_window,
                )
                .await?
            }
        };
        info!("connecting to peer context {} at {}", name, endpoint);

        let mut stream =
            match tokio::time::timeout(self.options.connect_timeout, TcpStream::connect(endpoint))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    return Err(Error::unknown_peer(format!(
                        "connect to {} failed: {}",
                        endpoint, err
                    )))
                }
                Err(_) => {
                    return Err(Error::timeout(format!(
                        "connect to {} timed out",
                        endpoint
                    )))
                }
            };
        stream.set_nodelay(true)?;

        // Client speaks first; then both sides have sent one handshake.
        write_frame(&mut stream, &self.local_handshake()).await?;
        let peer = self.expect_handshake(&mut stream).await?;
        if peer.context != name {
            return Err(Error::protocol_mismatch(format!(
                "got handshake from context {} while expecting {}",
                peer.context, name
            )));
        }
        self.install(stream, peer.context, endpoint)
    }

    /// Take ownership of an accepted connection: expect the client
    /// handshake, answer with ours, then register the peer.
    pub(crate) async fn adopt_incoming(self: &Arc<Self>, mut stream: TcpStream) -> Result<(), Error> {
        let endpoint = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let peer = self.expect_handshake(&mut stream).await?;
        write_frame(&mut stream, &self.local_handshake()).await?;
        debug!(
            "accepted connection from context {} at {}",
            peer.context, endpoint
        );
        self.install(stream, peer.context, endpoint)
    }

    fn local_handshake(&self) -> Message {
        Message::Handshake {
            context: self.local_context.clone(),
            workgroup: self.workgroup.clone(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Read and validate the peer's handshake within the handshake window.
    async fn expect_handshake(&self, stream: &mut TcpStream) -> Result<PeerIdentity, Error> {
        let frame =
            match tokio::time::timeout(self.options.handshake_timeout, read_frame(stream)).await {
                Ok(frame) => frame?,
                Err(_) => return Err(Error::timeout("timeout waiting for handshake")),
            };
        let (context, workgroup, protocol_version) = match frame {
            Message::Handshake {
                context,
                workgroup,
                protocol_version,
            } => (context, workgroup, protocol_version),
            // The peer refused our handshake and said why before closing.
            Message::ErrorReply { kind, message, .. }
                if kind == ErrorKind::ProtocolMismatch.as_str() =>
            {
                return Err(Error::protocol_mismatch(message))
            }
            other => {
                return Err(Error::protocol_mismatch(format!(
                    "expected handshake, got {:?}",
                    other
                )))
            }
        };
        if protocol_version != PROTOCOL_VERSION {
            let error = Error::protocol_mismatch(format!(
                "protocol version {} not supported (local version {})",
                protocol_version, PROTOCOL_VERSION
            ));
            self.refuse_handshake(stream, &context, &error).await;
            return Err(error);
        }
        if workgroup != self.workgroup {
            let error = Error::protocol_mismatch(format!(
                "handshake from workgroup {:?} does not match local workgroup {:?}",
                workgroup, self.workgroup
            ));
            self.refuse_handshake(stream, &context, &error).await;
            return Err(error);
        }
        if context == self.local_context {
            return Err(Error::protocol_mismatch(format!(
                "peer claims our own context name {:?}",
                context
            )));
        }
        Ok(PeerIdentity { context })
    }

    /// Best-effort: tell the peer why its handshake was refused before the
    /// socket is closed.
    async fn refuse_handshake(&self, stream: &mut TcpStream, peer_context: &str, error: &Error) {
        let reply = Message::ErrorReply {
            source: Address::context_object(&self.local_context),
            destination: Address::context_object(peer_context),
            request_id: 0,
            kind: ErrorKind::ProtocolMismatch.as_str().to_string(),
            message: error.message.clone(),
        };
        let _ = write_frame(stream, &reply).await;
    }

    /// Register a handshaken connection and start its reader and writer
    /// workers. A second connection to an already connected context is
    /// refused and closed.
    fn install(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_name: String,
        endpoint: SocketAddr,
    ) -> Result<(), Error> {
        let router = self.router()?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(PeerHandle {
            context_name: peer_name.clone(),
            endpoint,
            outbound: tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            last_activity: Arc::new(Mutex::new(Instant::now())),
            reader: Mutex::new(None),
        });
        {
            let mut peers = self.peers.write().expect("peer table");
            if peers.contains_key(&peer_name) {
                return Err(Error::illegal_state(format!(
                    "already connected to context {}",
                    peer_name
                )));
            }
            peers.insert(peer_name.clone(), Arc::clone(&handle));
        }

        tokio::spawn(writer_loop(write_half, rx, peer_name.clone()));
        let reader = tokio::spawn(reader_loop(
            read_half,
            Arc::clone(self),
            router,
            Arc::clone(&handle),
        ));
        {
            let mut slot = handle.reader.lock().expect("peer reader slot");
            *slot = Some(reader);
        }
        info!("peer connection to {} established", peer_name);
        Ok(())
    }

    /// Close the connection to the named peer. Pending requests on the
    /// connection are failed with `PeerLost`.
    pub fn disconnect(&self, name: &str) -> Result<(), Error> {
        let handle = {
            let mut peers = self.peers.write().expect("peer table");
            peers.remove(name)
        };
        let handle = handle
            .ok_or_else(|| Error::unknown_peer(format!("not connected to context {}", name)))?;
        self.teardown(&handle, true);
        Ok(())
    }

    /// Close every peer connection (context shutdown).
    pub fn disconnect_all(&self) {
        let handles: Vec<Arc<PeerHandle>> = {
            let mut peers = self.peers.write().expect("peer table");
            peers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            self.teardown(&handle, true);
        }
    }

    /// Called by the reader worker when its connection dies. Removes the
    /// registry entry unless a newer connection took the name.
    fn handle_connection_closed(&self, handle: &Arc<PeerHandle>) {
        let removed = {
            let mut peers = self.peers.write().expect("peer table");
            match peers.get(&handle.context_name) {
                Some(current) if Arc::ptr_eq(current, handle) => {
                    peers.remove(&handle.context_name);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.teardown(handle, false);
        }
    }

    /// Fail pending requests with `PeerLost` and notify the router's
    /// peer-removed callback. `abort_reader` stops the reader worker when
    /// the teardown was initiated locally.
    fn teardown(&self, handle: &Arc<PeerHandle>, abort_reader: bool) {
        info!("peer connection to {} removed", handle.context_name);
        if abort_reader {
            let mut slot = handle.reader.lock().expect("peer reader slot");
            if let Some(reader) = slot.take() {
                reader.abort();
            }
        }
        let pending: Vec<(u64, (Address, Address))> = {
            let mut pending = handle.pending.lock().expect("peer pending table");
            pending.drain().collect()
        };
        if let Ok(router) = self.router() {
            for (request_id, (source, destination)) in pending {
                let reply = Message::ErrorReply {
                    source: destination,
                    destination: source,
                    request_id,
                    kind: ErrorKind::PeerLost.as_str().to_string(),
                    message: format!(
                        "connection to {} closed while waiting for reply",
                        handle.context_name
                    ),
                };
                if let Err(err) = router.deliver_local(reply) {
                    debug!("failed to deliver peer-lost reply: {}", err);
                }
            }
            router.notify_peer_removed(&handle.context_name);
        }
    }
}

struct PeerIdentity {
    context: String,
}

/// Drain the outbound queue onto the socket; exits when the queue closes
/// or a write fails. Frames leave in exactly the order they were enqueued,
/// which realises the wire-order guarantee.
async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Message>,
    peer_name: String,
) {
    while let Some(message) = rx.recv().await {
        if let Err(err) = write_frame(&mut write_half, &message).await {
            warn!("write to peer {} failed: {}", peer_name, err);
            break;
        }
    }
    let _ = write_half.shutdown().await;
    debug!("writer for peer {} stopped", peer_name);
}

/// Parse frames from the peer and hand them to the router. Every exit path
/// ends in connection teardown.
async fn reader_loop(
    mut read_half: OwnedReadHalf,
    registry: Arc<PeerRegistry>,
    router: Arc<MessageRouter>,
    handle: Arc<PeerHandle>,
) {
    loop {
        let message = match read_frame(&mut read_half).await {
            Ok(message) => message,
            Err(err) => {
                debug!("connection to {} closed: {}", handle.context_name, err);
                break;
            }
        };
        {
            let mut last = handle.last_activity.lock().expect("peer activity mutex");
            *last = Instant::now();
        }
        if matches!(message, Message::Handshake { .. }) {
            warn!(
                "unexpected handshake from connected peer {}",
                handle.context_name
            );
            break;
        }
        let destination = match message.destination() {
            Some(destination) => destination.clone(),
            None => continue,
        };
        // Frames for another context are a caller-side defect, not a
        // reason to close the connection: answer and drop.
        if destination.context != router.context_name() {
            warn!(
                "message from {} addressed to foreign context {}",
                handle.context_name, destination.context
            );
            if let Some(reply) = Message::error_reply_to(
                &message,
                &Error::unknown_receiver(format!(
                    "context {} does not host {}",
                    router.context_name(),
                    destination
                )),
            ) {
                let _ = handle.outbound.send(reply);
            }
            continue;
        }
        if message.is_reply() {
            if let Some(request_id) = message.request_id() {
                let mut pending = handle.pending.lock().expect("peer pending table");
                if pending.remove(&request_id).is_none() {
                    debug!(
                        "reply for unknown request id {:016x} from {}",
                        request_id, handle.context_name
                    );
                }
            }
        }
        router.deliver_inbound(message);
    }
    registry.handle_connection_closed(&handle);
}
