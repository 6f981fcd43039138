// Loop tasks driven through the context: grid alignment under SKIP,
// Overrun failure under TERMINATE, and the settings channel over RPC.

use async_trait::async_trait;
use lattice::task::{LoopConfig, LoopTask, MissedLoopPolicy, TaskContext};
use lattice::{Args, Context, ContextConfig, Error, ErrorKind, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

fn config(name: &str) -> ContextConfig {
    ContextConfig::new(name).with_tcp_port(0).without_discovery()
}

struct TimedLoop {
    origin: Instant,
    starts: Arc<Mutex<Vec<Duration>>>,
    work: Duration,
    limit: usize,
}

#[async_trait]
impl LoopTask for TimedLoop {
    async fn iterate(&mut self, ctx: &TaskContext) -> Result<(), Error> {
        let done = {
            let mut starts = self.starts.lock().unwrap();
            starts.push(self.origin.elapsed());
            starts.len() >= self.limit
        };
        tokio::time::sleep(self.work).await;
        if done {
            // Cooperative self-stop once enough samples are collected.
            ctx.set_status(Value::Str("done".to_string()));
            return Err(Error::application("sample limit reached"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn skip_policy_aligns_iterations_to_the_grid() {
    let context = Context::start(config("grid-ctx")).await.unwrap();
    let starts = Arc::new(Mutex::new(Vec::new()));
    let proxy = context
        .make_loop_task(
            "grid",
            TimedLoop {
                origin: Instant::now(),
                starts: Arc::clone(&starts),
                work: Duration::from_millis(120),
                limit: 4,
            },
            LoopConfig {
                period: Duration::from_millis(50),
                policy: MissedLoopPolicy::Skip,
            },
            Value::Null,
        )
        .unwrap();

    proxy.call("start", Args::none()).await.unwrap();
    let err = proxy
        .call("join", Args::positional(vec![Value::Float(5.0)]))
        .await
        .unwrap_err();
    assert!(err.message.contains("sample limit reached"));

    // Iterations take 120 ms against a 50 ms period; SKIP aligns each
    // start to the next 50 ms grid tick: 0, 150, 300, 450.
    let starts = starts.lock().unwrap();
    assert_eq!(starts.len(), 4);
    for (start, expected_ms) in starts.iter().zip([0i64, 150, 300, 450]) {
        let diff = start.as_millis() as i64 - expected_ms;
        assert!(
            diff.abs() < 40,
            "iteration at {:?}, expected ~{} ms",
            start,
            expected_ms
        );
    }

    context.stop().await;
}

#[tokio::test]
async fn terminate_policy_surfaces_overrun_via_join() {
    let context = Context::start(config("overrun-ctx")).await.unwrap();
    struct Slow;
    #[async_trait]
    impl LoopTask for Slow {
        async fn iterate(&mut self, _ctx: &TaskContext) -> Result<(), Error> {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok(())
        }
    }
    let proxy = context
        .make_loop_task(
            "hasty",
            Slow,
            LoopConfig {
                period: Duration::from_millis(20),
                policy: MissedLoopPolicy::Terminate,
            },
            Value::Null,
        )
        .unwrap();

    proxy.call("start", Args::none()).await.unwrap();
    let err = proxy
        .call("join", Args::positional(vec![Value::Float(5.0)]))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Overrun);

    context.stop().await;
}

#[tokio::test]
async fn settings_reach_a_running_task_without_locking() {
    let context = Context::start(config("settings-ctx")).await.unwrap();

    /// Echoes its current settings into its status each iteration.
    struct Mirror;
    #[async_trait]
    impl LoopTask for Mirror {
        async fn iterate(&mut self, ctx: &TaskContext) -> Result<(), Error> {
            ctx.set_status(ctx.settings());
            Ok(())
        }
    }
    let proxy = context
        .make_loop_task(
            "mirror",
            Mirror,
            LoopConfig {
                period: Duration::from_millis(20),
                policy: MissedLoopPolicy::Immediate,
            },
            Value::Int(0),
        )
        .unwrap();
    proxy.call("start", Args::none()).await.unwrap();

    proxy
        .call("update_settings", Args::positional(vec![Value::Int(99)]))
        .await
        .unwrap();

    // The loop adopts the new settings at its next synchronisation point.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let status = proxy.call("get_status", Args::none()).await.unwrap();
        if status == Value::Int(99) {
            break;
        }
        assert!(Instant::now() < deadline, "settings never took effect");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    proxy.call("stop", Args::none()).await.unwrap();
    proxy.call("join", Args::none()).await.unwrap();
    context.stop().await;
}

#[tokio::test]
async fn built_in_signals_are_in_the_catalogue() {
    let context = Context::start(config("cat-ctx")).await.unwrap();
    struct Idle;
    #[async_trait]
    impl LoopTask for Idle {
        async fn iterate(&mut self, _ctx: &TaskContext) -> Result<(), Error> {
            Ok(())
        }
    }
    let proxy = context
        .make_loop_task(
            "idle",
            Idle,
            LoopConfig {
                period: Duration::from_millis(50),
                policy: MissedLoopPolicy::Immediate,
            },
            Value::Null,
        )
        .unwrap();

    let signals = proxy.call("get_signals", Args::none()).await.unwrap();
    let names: Vec<&str> = signals
        .as_list()
        .unwrap()
        .iter()
        .filter_map(|value| value.as_str())
        .collect();
    assert!(names.contains(&"settings"));
    assert!(names.contains(&"status"));

    context.stop().await;
}
