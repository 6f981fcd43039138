// Remote RPC across two contexts connected over TCP: transparent calls,
// wire-order delivery and error kind fidelity across the wire.

use async_trait::async_trait;
use lattice::rpc::service::MethodDescriptor;
use lattice::{Args, Context, ContextConfig, Error, RpcService, ServiceDescriptor, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

struct Calculator {
    seen: Vec<i64>,
}

#[async_trait]
impl RpcService for Calculator {
    fn describe(&self) -> ServiceDescriptor {
        ServiceDescriptor {
            methods: vec![
                MethodDescriptor::new("add", "(x, y)", ""),
                MethodDescriptor::new("note", "(x)", ""),
                MethodDescriptor::new("history", "()", ""),
                MethodDescriptor::new("fail", "()", ""),
            ],
            signals: vec![],
        }
    }

    async fn call(&mut self, method: &str, args: &Args) -> Result<Value, Error> {
        match method {
            "add" => Ok(Value::Int(args.require_i64(0)? + args.require_i64(1)?)),
            "note" => {
                self.seen.push(args.require_i64(0)?);
                Ok(Value::Null)
            }
            "history" => Ok(Value::List(
                self.seen.iter().copied().map(Value::Int).collect(),
            )),
            "fail" => Err(Error::invalid_argument("deliberate failure")),
            _ => Err(Error::unknown_method(method)),
        }
    }
}

fn config(name: &str) -> ContextConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    ContextConfig::new(name).with_tcp_port(0).without_discovery()
}

fn endpoint_of(context: &Arc<Context>) -> SocketAddr {
    format!("127.0.0.1:{}", context.tcp_port()).parse().unwrap()
}

#[tokio::test]
async fn remote_call_round_trips() {
    let a = Context::start(config("remote-a")).await.unwrap();
    let b = Context::start(config("remote-b")).await.unwrap();
    a.make_rpc_object("svc", Box::new(Calculator { seen: vec![] }))
        .unwrap();

    b.connect_to_peer("remote-a", Some(endpoint_of(&a))).await.unwrap();
    assert!(b.has_peer_context("remote-a"));
    assert!(a.has_peer_context("remote-b"));

    let proxy = b.proxy("remote-a.svc").unwrap();
    let value = proxy
        .call("add", Args::positional(vec![Value::Int(10), Value::Int(4)]))
        .await
        .unwrap();
    assert_eq!(value, Value::Int(14));

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn remote_requests_arrive_in_wire_order() {
    let a = Context::start(config("order-a")).await.unwrap();
    let b = Context::start(config("order-b")).await.unwrap();
    a.make_rpc_object("svc", Box::new(Calculator { seen: vec![] }))
        .unwrap();
    b.connect_to_peer("order-a", Some(endpoint_of(&a))).await.unwrap();

    let proxy = b.proxy("order-a.svc").unwrap();
    let mut futures = Vec::new();
    for n in 1..=15i64 {
        futures.push(
            proxy
                .call_nonblocking("note", Args::positional(vec![Value::Int(n)]))
                .await
                .unwrap(),
        );
    }
    for future in futures {
        future.wait(Some(Duration::from_secs(2))).await.unwrap();
    }
    let history = proxy.call("history", Args::none()).await.unwrap();
    let expected: Vec<Value> = (1..=15).map(Value::Int).collect();
    assert_eq!(history, Value::List(expected));

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn error_kinds_round_trip_the_wire() {
    let a = Context::start(config("err-a")).await.unwrap();
    let b = Context::start(config("err-b")).await.unwrap();
    a.make_rpc_object("svc", Box::new(Calculator { seen: vec![] }))
        .unwrap();
    b.connect_to_peer("err-a", Some(endpoint_of(&a))).await.unwrap();

    let proxy = b.proxy("err-a.svc").unwrap();
    let err = proxy.call("fail", Args::none()).await.unwrap_err();
    assert_eq!(err.kind, lattice::ErrorKind::InvalidArgument);
    assert!(err.message.contains("deliberate failure"));

    let err = proxy.call("missing", Args::none()).await.unwrap_err();
    assert_eq!(err.kind, lattice::ErrorKind::UnknownMethod);

    // Unregistered object on a reachable peer.
    let err = b
        .proxy("err-a.ghost")
        .unwrap()
        .call("anything", Args::none())
        .await
        .unwrap_err();
    assert_eq!(err.kind, lattice::ErrorKind::UnknownReceiver);

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn peer_context_object_is_reachable() {
    let a = Context::start(config("intro-a")).await.unwrap();
    let b = Context::start(config("intro-b")).await.unwrap();
    a.make_rpc_object("svc", Box::new(Calculator { seen: vec![] }))
        .unwrap();
    b.connect_to_peer("intro-a", Some(endpoint_of(&a))).await.unwrap();

    let proxy = b.peer_context_proxy("intro-a");
    let services = proxy.call("list_services", Args::none()).await.unwrap();
    assert_eq!(services, Value::List(vec![Value::Str("svc".to_string())]));
    let peers = proxy.call("list_peers", Args::none()).await.unwrap();
    assert_eq!(peers, Value::List(vec![Value::Str("intro-b".to_string())]));

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn unknown_peer_without_discovery_fails_fast() {
    let b = Context::start(config("lonely-b")).await.unwrap();
    let proxy = b.proxy("nonexistent.svc").unwrap();
    let err = proxy
        .call_with_timeout("anything", Args::none(), Some(Duration::from_secs(3)))
        .await
        .unwrap_err();
    // Discovery finds nothing, so the on-demand connect fails.
    assert_eq!(err.kind, lattice::ErrorKind::UnknownPeer);
    b.stop().await;
}

#[tokio::test]
async fn mismatched_workgroup_is_refused() {
    let a = Context::start(config("wg-a").with_workgroup("alpha")).await.unwrap();
    let b = Context::start(config("wg-b").with_workgroup("beta")).await.unwrap();

    let err = b
        .connect_to_peer("wg-a", Some(endpoint_of(&a)))
        .await
        .unwrap_err();
    assert_eq!(err.kind, lattice::ErrorKind::ProtocolMismatch);
    assert!(!b.has_peer_context("wg-a"));

    b.stop().await;
    a.stop().await;
}
