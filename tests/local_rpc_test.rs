// Local RPC: calls on a proxy in the hosting context, in-order execution
// per service and independent progress between services.

use async_trait::async_trait;
use lattice::rpc::service::MethodDescriptor;
use lattice::{Args, Context, ContextConfig, Error, RpcService, ServiceDescriptor, Value};
use std::time::{Duration, Instant};

struct Calculator {
    /// History of observed operands, for ordering assertions.
    seen: Vec<i64>,
}

#[async_trait]
impl RpcService for Calculator {
    fn describe(&self) -> ServiceDescriptor {
        ServiceDescriptor {
            methods: vec![
                MethodDescriptor::new("add", "(x, y)", "Add two integers."),
                MethodDescriptor::new("note", "(x)", "Record an operand."),
                MethodDescriptor::new("history", "()", ""),
                MethodDescriptor::new("nap", "(millis)", "Sleep inside the worker."),
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
            "nap" => {
                tokio::time::sleep(Duration::from_millis(args.require_i64(0)? as u64)).await;
                Ok(Value::Null)
            }
            _ => Err(Error::unknown_method(method)),
        }
    }
}

fn config(name: &str) -> ContextConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    ContextConfig::new(name).with_tcp_port(0).without_discovery()
}

#[tokio::test]
async fn local_call_returns_promptly() {
    let context = Context::start(config("local-a")).await.unwrap();
    let proxy = context
        .make_rpc_object("svc", Box::new(Calculator { seen: vec![] }))
        .unwrap();

    let started = Instant::now();
    let value = proxy
        .call("add", Args::positional(vec![Value::Int(2), Value::Int(3)]))
        .await
        .unwrap();
    assert_eq!(value, Value::Int(5));
    assert!(started.elapsed() < Duration::from_millis(100));

    context.stop().await;
}

#[tokio::test]
async fn requests_from_one_proxy_execute_in_order() {
    let context = Context::start(config("local-b")).await.unwrap();
    let proxy = context
        .make_rpc_object("svc", Box::new(Calculator { seen: vec![] }))
        .unwrap();

    // Fire a burst of non-blocking requests, then collect the replies.
    let mut futures = Vec::new();
    for n in 1..=20i64 {
        let future = proxy
            .call_nonblocking("note", Args::positional(vec![Value::Int(n)]))
            .await
            .unwrap();
        futures.push(future);
    }
    for future in futures {
        future.wait(Some(Duration::from_secs(2))).await.unwrap();
    }

    let history = proxy.call("history", Args::none()).await.unwrap();
    let expected: Vec<Value> = (1..=20).map(Value::Int).collect();
    assert_eq!(history, Value::List(expected));

    context.stop().await;
}

#[tokio::test]
async fn services_make_independent_progress() {
    let context = Context::start(config("local-c")).await.unwrap();
    let slow = context
        .make_rpc_object("slow", Box::new(Calculator { seen: vec![] }))
        .unwrap();
    let fast = context
        .make_rpc_object("fast", Box::new(Calculator { seen: vec![] }))
        .unwrap();

    // Block the slow service's worker, then verify the fast service
    // still answers immediately.
    let blocked = slow
        .call_nonblocking("nap", Args::positional(vec![Value::Int(1500)]))
        .await
        .unwrap();

    let started = Instant::now();
    let value = fast
        .call("add", Args::positional(vec![Value::Int(1), Value::Int(1)]))
        .await
        .unwrap();
    assert_eq!(value, Value::Int(2));
    assert!(started.elapsed() < Duration::from_millis(300));

    blocked.wait(Some(Duration::from_secs(5))).await.unwrap();
    context.stop().await;
}

#[tokio::test]
async fn application_error_kinds_survive_the_call() {
    let context = Context::start(config("local-d")).await.unwrap();
    let proxy = context
        .make_rpc_object("svc", Box::new(Calculator { seen: vec![] }))
        .unwrap();

    // Missing argument is validated service-side.
    let err = proxy
        .call("add", Args::positional(vec![Value::Int(1)]))
        .await
        .unwrap_err();
    assert_eq!(err.kind, lattice::ErrorKind::InvalidArgument);

    let err = proxy.call("does_not_exist", Args::none()).await.unwrap_err();
    assert_eq!(err.kind, lattice::ErrorKind::UnknownMethod);

    context.stop().await;
}
