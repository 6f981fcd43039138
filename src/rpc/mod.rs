// The RPC runtime: the service trait and its catalogue descriptors, the
// per-service manager and worker, the pending-call future and the
// client-side proxy.

pub mod future;
pub mod manager;
pub mod proxy;
pub mod service;

pub use future::RpcFuture;
pub use manager::RpcObjectManager;
pub use proxy::Proxy;
pub use service::{MethodDescriptor, RpcService, ServiceDescriptor, SignalDescriptor};
