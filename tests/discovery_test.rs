// UDP discovery: workgroup-scoped answers, connecting by name through
// discovery, and the kill datagram on the responder surface.

use lattice::net::discovery::{self, DiscoveryPacket};
use lattice::{Args, Context, ContextConfig, Value};
use std::time::Duration;

fn config(name: &str, workgroup: &str, discovery_port: u16) -> ContextConfig {
    ContextConfig::new(name)
        .with_workgroup(workgroup)
        .with_tcp_port(0)
        .with_discovery_port(discovery_port)
}

#[tokio::test]
async fn discovery_returns_exactly_the_matching_workgroup() {
    // A dedicated port keeps this test isolated from the other tests'
    // responders on the same host.
    let port = 46021;
    let x1 = Context::start(config("disc-x1", "group-x", port)).await.unwrap();
    let x2 = Context::start(config("disc-x2", "group-x", port)).await.unwrap();
    let x3 = Context::start(config("disc-x3", "group-x", port)).await.unwrap();
    let y1 = Context::start(config("disc-y1", "group-y", port)).await.unwrap();

    let found = x1.discover_peer_contexts().await.unwrap();
    let mut names: Vec<&str> = found.iter().map(|peer| peer.context.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["disc-x1", "disc-x2", "disc-x3"]);
    for peer in &found {
        assert_eq!(peer.protocol_version, lattice::PROTOCOL_VERSION);
        assert_ne!(peer.port, 0);
    }

    y1.stop().await;
    x3.stop().await;
    x2.stop().await;
    x1.stop().await;
}

#[tokio::test]
async fn connect_by_name_uses_discovery() {
    let port = 46031;
    let a = Context::start(config("find-a", "group-find", port)).await.unwrap();
    let b = Context::start(config("find-b", "group-find", port)).await.unwrap();

    struct Echo;
    #[async_trait::async_trait]
    impl lattice::RpcService for Echo {
        fn describe(&self) -> lattice::ServiceDescriptor {
            lattice::ServiceDescriptor {
                methods: vec![lattice::MethodDescriptor::new("echo", "(v)", "")],
                signals: vec![],
            }
        }
        async fn call(
            &mut self,
            method: &str,
            args: &Args,
        ) -> Result<Value, lattice::Error> {
            match method {
                "echo" => Ok(args.require(0)?.clone()),
                _ => Err(lattice::Error::unknown_method(method)),
            }
        }
    }
    a.make_rpc_object("echo", Box::new(Echo)).unwrap();

    // No endpoint given: the peer is located via discovery.
    b.connect_to_peer("find-a", None).await.unwrap();
    let value = b
        .proxy("find-a.echo")
        .unwrap()
        .call("echo", Args::positional(vec![Value::Int(11)]))
        .await
        .unwrap();
    assert_eq!(value, Value::Int(11));

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn kill_datagram_requests_shutdown() {
    let port = 46041;
    let context = Context::start(config("kill-me", "group-kill", port)).await.unwrap();
    assert!(!context.shutdown_requested());

    // Send a targeted kill request the way the process manager would.
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let packet = serde_json::to_vec(&DiscoveryPacket::Kill {
        context: Some("kill-me".to_string()),
    })
    .unwrap();
    socket
        .send_to(&packet, ("127.0.0.1", port))
        .await
        .unwrap();

    assert!(context.wait_until_shutdown(Some(Duration::from_secs(2))).await);
    context.stop().await;
}

#[tokio::test]
async fn discovery_times_out_empty_on_silent_workgroup() {
    let found = discovery::discover("group-nobody", 46051, Duration::from_millis(300))
        .await
        .unwrap();
    assert!(found.is_empty());
}
