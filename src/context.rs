// The context: process-wide composition root. Owns the router, the peer
// registry, the signal manager, the TCP server, the discovery responder
// and the registry of service managers; exposes proxy factories and peer
// operations.

use async_trait::async_trait;
use log::{info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::address::{validate_name, Address, CONTEXT_OBJECT};
use crate::config::ContextConfig;
use crate::error::Error;
use crate::net::discovery::{self, DiscoveredContext, DiscoveryResponder, ResponderIdentity};
use crate::net::listener::TcpServer;
use crate::net::peer::{PeerOptions, PeerRegistry};
use crate::pubsub::{SignalManager, SignalPublisher, SignalReceiver};
use crate::router::MessageRouter;
use crate::rpc::manager::RpcObjectManager;
use crate::rpc::proxy::Proxy;
use crate::rpc::service::{MethodDescriptor, RpcService, ServiceDescriptor, SignalDescriptor};
use crate::task::{LoopConfig, LoopDriver, LoopTask, Task, TaskContext, TaskRunner};
use crate::task::{SETTINGS_SIGNAL, STATUS_SIGNAL};
use crate::value::{Args, Value};
use crate::worker::StopToken;

/// The process-wide runtime instance hosting services, proxies and peer
/// connections.
///
/// Created by [`Context::start`]; destroyed by [`Context::stop`], which
/// drains the components in reverse construction order.
pub struct Context {
    config: ContextConfig,
    router: Arc<MessageRouter>,
    peers: Arc<PeerRegistry>,
    signals: Arc<SignalManager>,
    services: Mutex<HashMap<String, Arc<RpcObjectManager>>>,
    tcp_server: Mutex<Option<TcpServer>>,
    responder: Mutex<Option<DiscoveryResponder>>,
    tcp_port: u16,
    shutdown: StopToken,
    stopped: Mutex<bool>,
}

impl Context {
    /// Create and start a context: bind the TCP server, register the
    /// internal objects and (unless disabled) start the discovery
    /// responder.
    pub async fn start(config: ContextConfig) -> Result<Arc<Context>, Error> {
        validate_name(&config.name)?;
        info!(
            "starting context {} (workgroup {})",
            config.name, config.workgroup
        );
        let peers = PeerRegistry::new(
            &config.name,
            &config.workgroup,
            PeerOptions {
                connect_timeout: config.connect_timeout,
                handshake_timeout: config.handshake_timeout,
                discovery_port: config.discovery_port,
                discovery_window: config.discovery_window,
            },
        );
        let router = MessageRouter::new(&config.name, Arc::clone(&peers));
        let signals = SignalManager::start(
            Arc::clone(&router),
            config.signal_high_water_mark,
            config.internal_call_timeout,
        )?;
        let tcp_server =
            TcpServer::start(&config.bind_host, config.tcp_port, Arc::clone(&peers)).await?;
        let tcp_port = tcp_server.port();

        let context = Arc::new(Context {
            config: config.clone(),
            router: Arc::clone(&router),
            peers,
            signals,
            services: Mutex::new(HashMap::new()),
            tcp_server: Mutex::new(Some(tcp_server)),
            responder: Mutex::new(None),
            tcp_port,
            shutdown: StopToken::new(),
            stopped: Mutex::new(false),
        });

        // The context object is an ordinary service at a reserved address.
        let manager = RpcObjectManager::start(
            Arc::clone(&router),
            Address::context_object(&config.name),
            Box::new(ContextService {
                context: Arc::downgrade(&context),
            }),
        )?;
        context
            .services
            .lock()
            .expect("context service table")
            .insert(CONTEXT_OBJECT.to_string(), manager);

        if config.enable_discovery {
            let identity = ResponderIdentity {
                context: config.name.clone(),
                workgroup: config.workgroup.clone(),
                advertise_host: config.advertise_host.clone(),
                tcp_port,
            };
            let on_kill: Arc<dyn Fn() + Send + Sync> = {
                let context = Arc::downgrade(&context);
                Arc::new(move || {
                    if let Some(context) = context.upgrade() {
                        context.request_shutdown();
                    }
                })
            };
            let responder = DiscoveryResponder::start(
                identity,
                &config.bind_host,
                config.discovery_port,
                on_kill,
            )?;
            let mut slot = context.responder.lock().expect("context responder slot");
            *slot = Some(responder);
        }
        Ok(context)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn workgroup(&self) -> &str {
        &self.config.workgroup
    }

    /// Actual TCP server port (useful with an ephemeral port config).
    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Stop the context: discovery responder first, then the TCP server,
    /// then every service worker, finally all peer connections (failing
    /// their pending calls).
    pub async fn stop(&self) {
        {
            let mut stopped = self.stopped.lock().expect("context stop flag");
            if *stopped {
                return;
            }
            *stopped = true;
        }
        info!("stopping context {}", self.config.name);
        self.shutdown.request_stop();

        let responder = self.responder.lock().expect("context responder slot").take();
        if let Some(responder) = responder {
            if let Err(err) = responder.stop().await {
                warn!("discovery responder did not stop cleanly: {}", err);
            }
        }
        let tcp_server = self.tcp_server.lock().expect("context server slot").take();
        if let Some(tcp_server) = tcp_server {
            if let Err(err) = tcp_server.stop().await {
                warn!("tcp server did not stop cleanly: {}", err);
            }
        }
        let managers: Vec<(String, Arc<RpcObjectManager>)> = {
            let mut services = self.services.lock().expect("context service table");
            services.drain().collect()
        };
        // Unregister every handler first so that requests arriving during
        // the drain get UnknownReceiver instead of queueing up, and request
        // stop everywhere before waiting on anyone.
        for (_, manager) in &managers {
            self.router.unregister_handler(manager.address());
            manager.request_stop();
        }
        // Closing the peer connections fails their remaining futures with
        // PeerLost; this must not wait for slow in-flight invocations.
        self.peers.disconnect_all();
        for (name, manager) in managers {
            if let Err(err) = manager.join(Some(Duration::from_secs(2))).await {
                warn!("service {} did not stop cleanly: {}", name, err);
            }
        }
        info!("context {} stopped", self.config.name);
    }

    // ------------------------------------------------------------------
    // Service registry

    /// Register a service instance under `name` and return a proxy to it.
    pub fn make_rpc_object(
        self: &Arc<Self>,
        name: &str,
        service: Box<dyn RpcService>,
    ) -> Result<Proxy, Error> {
        validate_name(name)?;
        {
            let services = self.services.lock().expect("context service table");
            if services.contains_key(name) {
                return Err(Error::illegal_state(format!(
                    "duplicate service name {:?}",
                    name
                )));
            }
        }
        let address = Address::new(&self.config.name, name);
        let manager = RpcObjectManager::start(Arc::clone(&self.router), address.clone(), service)?;
        self.services
            .lock()
            .expect("context service table")
            .insert(name.to_string(), manager);
        Ok(Proxy::new(Arc::clone(&self.router), address))
    }

    /// Remove a service: unregister its address and drain its worker.
    pub async fn remove_rpc_object(&self, name: &str) -> Result<(), Error> {
        let manager = {
            let mut services = self.services.lock().expect("context service table");
            services.remove(name)
        };
        let manager = manager
            .ok_or_else(|| Error::unknown_receiver(format!("no service named {:?}", name)))?;
        self.router.unregister_handler(manager.address());
        manager.shutdown(Some(Duration::from_secs(5))).await
    }

    /// Names of the currently registered services (excluding the internal
    /// context object).
    pub fn list_services(&self) -> Vec<String> {
        let services = self.services.lock().expect("context service table");
        let mut names: Vec<String> = services
            .keys()
            .filter(|name| !name.starts_with('$'))
            .cloned()
            .collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Proxies

    /// Proxy for the service at a textual address: `"<context>.<object>"`
    /// for a service, `"<context>"` alone for a context object.
    pub fn proxy(&self, address: &str) -> Result<Proxy, Error> {
        let address = Address::from_str(address)?;
        Ok(Proxy::new(Arc::clone(&self.router), address))
    }

    /// Proxy for a service registered in this context. Fails when no such
    /// service exists.
    pub fn local_proxy(&self, name: &str) -> Result<Proxy, Error> {
        let services = self.services.lock().expect("context service table");
        if !services.contains_key(name) {
            return Err(Error::unknown_receiver(format!(
                "no service named {:?}",
                name
            )));
        }
        Ok(Proxy::new(
            Arc::clone(&self.router),
            Address::new(&self.config.name, name),
        ))
    }

    /// Proxy for the context object of a peer context.
    pub fn peer_context_proxy(&self, peer: &str) -> Proxy {
        Proxy::new(Arc::clone(&self.router), Address::context_object(peer))
    }

    // ------------------------------------------------------------------
    // Peers and discovery

    /// Connect to a peer context. Without an endpoint the peer is located
    /// via discovery first. Completes when handshakes were exchanged both
    /// ways.
    pub async fn connect_to_peer(
        &self,
        name: &str,
        endpoint: Option<SocketAddr>,
    ) -> Result<(), Error> {
        self.peers.connect(name, endpoint).await
    }

    /// Close the connection to a peer; pending calls awaiting replies from
    /// it fail with `PeerLost`.
    pub fn disconnect_from_peer(&self, name: &str) -> Result<(), Error> {
        self.peers.disconnect(name)
    }

    pub fn has_peer_context(&self, name: &str) -> bool {
        self.peers.has_peer(name)
    }

    /// Names of the currently connected peer contexts.
    pub fn list_peers(&self) -> Vec<String> {
        let mut names = self.peers.peer_names();
        names.sort();
        names
    }

    /// Broadcast a discovery request and return every context of the local
    /// workgroup that answered within the discovery window (including this
    /// one).
    pub async fn discover_peer_contexts(&self) -> Result<Vec<DiscoveredContext>, Error> {
        discovery::discover(
            &self.config.workgroup,
            self.config.discovery_port,
            self.config.discovery_window,
        )
        .await
    }

    // ------------------------------------------------------------------
    // Signals

    /// Create a signal receiver buffered at the configured high-water mark.
    pub fn signal_receiver(&self) -> SignalReceiver {
        self.signals.receiver()
    }

    pub fn signal_receiver_with_capacity(&self, capacity: usize) -> SignalReceiver {
        self.signals.receiver_with_capacity(capacity)
    }

    /// Publishing endpoint for a signal of a local service.
    pub fn signal_publisher(&self, service: &str, signal: &str) -> SignalPublisher {
        SignalPublisher::new(service, signal, Arc::clone(&self.signals))
    }

    /// Subscribe a receiver to `(publisher, signal)`, where `publisher` is
    /// a textual service address. Blocks until a remote subscription is
    /// established.
    pub async fn subscribe_signal(
        &self,
        publisher: &str,
        signal: &str,
        receiver: &SignalReceiver,
    ) -> Result<(), Error> {
        let publisher = Address::from_str(publisher)?;
        self.signals.subscribe(&publisher, signal, receiver).await
    }

    pub async fn unsubscribe_signal(
        &self,
        publisher: &str,
        signal: &str,
        receiver: &SignalReceiver,
    ) -> Result<(), Error> {
        let publisher = Address::from_str(publisher)?;
        self.signals.unsubscribe(&publisher, signal, receiver).await
    }

    // ------------------------------------------------------------------
    // Tasks

    /// Host a free-form task as a service. The task starts when `start()`
    /// is called through the returned proxy.
    pub fn make_task(
        self: &Arc<Self>,
        name: &str,
        task: impl Task,
        initial_settings: Value,
    ) -> Result<Proxy, Error> {
        self.register_task(name, Box::new(task), initial_settings, vec![])
    }

    /// Host a loop task with the given period and overrun policy.
    pub fn make_loop_task(
        self: &Arc<Self>,
        name: &str,
        task: impl LoopTask,
        config: LoopConfig,
        initial_settings: Value,
    ) -> Result<Proxy, Error> {
        self.register_task(
            name,
            Box::new(LoopDriver::new(task, config)),
            initial_settings,
            vec![],
        )
    }

    fn register_task(
        self: &Arc<Self>,
        name: &str,
        task: Box<dyn Task>,
        initial_settings: Value,
        extra_signals: Vec<SignalDescriptor>,
    ) -> Result<Proxy, Error> {
        validate_name(name)?;
        let shared = Arc::new(TaskContext::new(
            name,
            initial_settings,
            self.signal_publisher(name, SETTINGS_SIGNAL),
            self.signal_publisher(name, STATUS_SIGNAL),
        ));
        let runner = TaskRunner::new(shared, task, extra_signals);
        self.make_rpc_object(name, Box::new(runner))
    }

    // ------------------------------------------------------------------
    // Shutdown coordination

    /// Ask the context owner to shut down. The context keeps running until
    /// [`Context::stop`] is called; this merely wakes
    /// [`Context::wait_until_shutdown`].
    pub fn request_shutdown(&self) {
        info!("shutdown of context {} requested", self.config.name);
        self.shutdown.request_stop();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.stop_requested()
    }

    /// Wait until shutdown is requested, up to `timeout` (`None` waits
    /// indefinitely). Returns `true` when shutdown was requested.
    pub async fn wait_until_shutdown(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.shutdown.wait())
                .await
                .is_ok(),
            None => {
                self.shutdown.wait().await;
                true
            }
        }
    }
}

/// The `$context` RPC object: the introspection and shutdown surface that
/// process-management tooling talks to.
struct ContextService {
    context: Weak<Context>,
}

impl ContextService {
    fn context(&self) -> Result<Arc<Context>, Error> {
        self.context
            .upgrade()
            .ok_or_else(|| Error::illegal_state("context is gone"))
    }
}

#[async_trait]
impl RpcService for ContextService {
    fn describe(&self) -> ServiceDescriptor {
        ServiceDescriptor {
            methods: vec![
                MethodDescriptor::new("get_version", "()", "Runtime version string."),
                MethodDescriptor::new("get_pid", "()", "Process id of the hosting process."),
                MethodDescriptor::new("get_tcp_port", "()", ""),
                MethodDescriptor::new("list_services", "()", "Names of live services."),
                MethodDescriptor::new("list_peers", "()", "Names of connected peer contexts."),
                MethodDescriptor::new(
                    "shutdown_context",
                    "()",
                    "Request orderly shutdown of the context.",
                ),
            ],
            signals: vec![],
        }
    }

    async fn call(&mut self, method: &str, _args: &Args) -> Result<Value, Error> {
        let context = self.context()?;
        match method {
            "get_version" => Ok(Value::Str(env!("CARGO_PKG_VERSION").to_string())),
            "get_pid" => Ok(Value::Int(std::process::id() as i64)),
            "get_tcp_port" => Ok(Value::Int(context.tcp_port() as i64)),
            "list_services" => Ok(Value::List(
                context.list_services().into_iter().map(Value::Str).collect(),
            )),
            "list_peers" => Ok(Value::List(
                context.list_peers().into_iter().map(Value::Str).collect(),
            )),
            "shutdown_context" => {
                context.request_shutdown();
                Ok(Value::Null)
            }
            other => Err(Error::unknown_method(format!(
                "context object has no method {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::rpc::service::RpcService;

    struct Adder;

    #[async_trait]
    impl RpcService for Adder {
        fn describe(&self) -> ServiceDescriptor {
            ServiceDescriptor {
                methods: vec![MethodDescriptor::new("add", "(x, y)", "")],
                signals: vec![],
            }
        }

        async fn call(&mut self, method: &str, args: &Args) -> Result<Value, Error> {
            match method {
                "add" => Ok(Value::Int(args.require_i64(0)? + args.require_i64(1)?)),
                _ => Err(Error::unknown_method(method)),
            }
        }
    }

    fn test_config(name: &str) -> ContextConfig {
        ContextConfig::new(name)
            .with_tcp_port(0)
            .without_discovery()
    }

    #[tokio::test]
    async fn local_service_registration_and_call() {
        let context = Context::start(test_config("unit-ctx1")).await.unwrap();
        let proxy = context.make_rpc_object("adder", Box::new(Adder)).unwrap();
        let value = proxy
            .call("add", Args::positional(vec![Value::Int(2), Value::Int(3)]))
            .await
            .unwrap();
        assert_eq!(value, Value::Int(5));
        assert_eq!(context.list_services(), vec!["adder".to_string()]);
        context.stop().await;
    }

    #[tokio::test]
    async fn duplicate_service_names_rejected() {
        let context = Context::start(test_config("unit-ctx2")).await.unwrap();
        context.make_rpc_object("adder", Box::new(Adder)).unwrap();
        let err = context.make_rpc_object("adder", Box::new(Adder)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalState);
        context.stop().await;
    }

    #[tokio::test]
    async fn internal_names_rejected_for_services() {
        let context = Context::start(test_config("unit-ctx3")).await.unwrap();
        let err = context
            .make_rpc_object("$shadow", Box::new(Adder))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        context.stop().await;
    }

    #[tokio::test]
    async fn removed_service_stops_answering() {
        let context = Context::start(test_config("unit-ctx4")).await.unwrap();
        let proxy = context.make_rpc_object("adder", Box::new(Adder)).unwrap();
        context.remove_rpc_object("adder").await.unwrap();
        let err = proxy
            .call("add", Args::positional(vec![Value::Int(1), Value::Int(1)]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownReceiver);
        context.stop().await;
    }

    #[tokio::test]
    async fn context_object_serves_control_surface() {
        let context = Context::start(test_config("unit-ctx5")).await.unwrap();
        context.make_rpc_object("adder", Box::new(Adder)).unwrap();
        let proxy = context.proxy("unit-ctx5").unwrap();

        let services = proxy.call("list_services", Args::none()).await.unwrap();
        assert_eq!(
            services,
            Value::List(vec![Value::Str("adder".to_string())])
        );
        let pid = proxy.call("get_pid", Args::none()).await.unwrap();
        assert_eq!(pid, Value::Int(std::process::id() as i64));

        assert!(!context.shutdown_requested());
        proxy.call("shutdown_context", Args::none()).await.unwrap();
        assert!(context.wait_until_shutdown(Some(Duration::from_secs(1))).await);
        context.stop().await;
    }
}
