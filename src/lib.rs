// lattice: a process-local and network-transparent runtime for hosting
// long-lived services. A process hosting the runtime is a context;
// contexts discover each other over UDP broadcast, connect over framed
// TCP streams and exchange typed messages. Clients obtain a proxy by
// name; calls on the proxy dispatch to the owning context, local or
// remote. Services may publish signals that fan out to subscribers in
// any connected context.

pub mod address;
pub mod config;
pub mod context;
pub mod error;
pub mod message;
pub mod net;
pub mod pubsub;
pub mod router;
pub mod rpc;
pub mod task;
pub mod value;
pub mod worker;

// Re-export the everyday surface at the crate root.
pub use address::Address;
pub use config::ContextConfig;
pub use context::Context;
pub use error::{Error, ErrorKind};
pub use message::{Message, RemoteError, PROTOCOL_VERSION};
pub use net::discovery::DiscoveredContext;
pub use pubsub::{ReceivedSignal, SignalPublisher, SignalReceiver};
pub use router::{MessageHandler, MessageRouter};
pub use rpc::{MethodDescriptor, Proxy, RpcFuture, RpcService, ServiceDescriptor, SignalDescriptor};
pub use task::{LoopConfig, LoopTask, MissedLoopPolicy, Task, TaskContext};
pub use value::{Args, Timestamp, Value};
pub use worker::{StopToken, Worker};
