// Cooperative tasks: long-running routines hosted behind an RPC service
// so they can be controlled (start/stop/settings) over the messaging
// fabric. Two flavours: free-form tasks own their whole run loop; loop
// tasks get a driven prepare/iterate/finalize cycle with a configurable
// period and overrun policy.

use async_trait::async_trait;
use log::{info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::Error;
use crate::pubsub::SignalPublisher;
use crate::rpc::service::{MethodDescriptor, RpcService, ServiceDescriptor, SignalDescriptor};
use crate::value::{Args, Value};
use crate::worker::{StopToken, Worker};

/// Signal published whenever the task's settings change.
pub const SETTINGS_SIGNAL: &str = "settings";
/// Signal published when the task updates its status.
pub const STATUS_SIGNAL: &str = "status";

/// Policy for a loop task that misses its period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissedLoopPolicy {
    /// Start the next iteration without delay.
    Immediate,
    /// Skip the missed periods and align to the next grid tick.
    Skip,
    /// Stop the task with an `Overrun` error.
    Terminate,
}

/// Loop period and overrun policy of a loop task.
#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    pub period: Duration,
    pub policy: MissedLoopPolicy,
}

/// Handle given to a task routine: cooperative stop, the settings channel
/// and status publishing.
///
/// Settings sent by remote callers are buffered; the routine observes them
/// at its own synchronisation points by calling [`TaskContext::sync_settings`].
pub struct TaskContext {
    name: String,
    stop: StopToken,
    settings: Mutex<Value>,
    pending_settings: Mutex<Option<Value>>,
    status: Mutex<Value>,
    settings_signal: SignalPublisher,
    status_signal: SignalPublisher,
}

impl TaskContext {
    pub(crate) fn new(
        name: &str,
        initial_settings: Value,
        settings_signal: SignalPublisher,
        status_signal: SignalPublisher,
    ) -> TaskContext {
        TaskContext {
            name: name.to_string(),
            stop: StopToken::new(),
            settings: Mutex::new(initial_settings),
            pending_settings: Mutex::new(None),
            status: Mutex::new(Value::Null),
            settings_signal,
            status_signal,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking query of the stop flag.
    pub fn stop_requested(&self) -> bool {
        self.stop.stop_requested()
    }

    /// Cooperative sleep; returns `false` when interrupted by a stop
    /// request.
    pub async fn sleep(&self, duration: Duration) -> bool {
        self.stop.sleep(duration).await
    }

    /// Adopt the most recent pending settings, if any. Returns `true` when
    /// the settings changed. This is the routine's synchronisation point
    /// for the settings channel.
    pub fn sync_settings(&self) -> bool {
        let pending = {
            let mut slot = self.pending_settings.lock().expect("pending settings");
            slot.take()
        };
        match pending {
            Some(new_settings) => {
                let mut current = self.settings.lock().expect("task settings");
                *current = new_settings;
                true
            }
            None => false,
        }
    }

    /// Snapshot of the settings currently in effect.
    pub fn settings(&self) -> Value {
        self.settings.lock().expect("task settings").clone()
    }

    /// Store a new status value and publish it on the `status` signal.
    pub fn set_status(&self, status: Value) {
        {
            let mut slot = self.status.lock().expect("task status");
            *slot = status.clone();
        }
        self.status_signal.publish(status);
    }

    /// Current status snapshot.
    pub fn status(&self) -> Value {
        self.status.lock().expect("task status").clone()
    }

    fn publish_status(&self) {
        self.status_signal.publish(self.status());
    }

    /// Called from the runner when a caller sends new settings. The value
    /// becomes visible to the routine at its next `sync_settings` call;
    /// the `settings` signal is published immediately.
    fn submit_settings(&self, new_settings: Value) {
        {
            let mut slot = self.pending_settings.lock().expect("pending settings");
            *slot = Some(new_settings.clone());
        }
        self.settings_signal.publish(new_settings);
    }

    fn pending_settings(&self) -> Option<Value> {
        self.pending_settings
            .lock()
            .expect("pending settings")
            .clone()
    }

    fn request_stop(&self) {
        self.stop.request_stop();
    }
}

/// A free-form background task. The routine owns its whole run loop and is
/// responsible for checking the stop flag periodically.
#[async_trait]
pub trait Task: Send + 'static {
    async fn run(&mut self, ctx: &TaskContext) -> Result<(), Error>;
}

/// A periodic background task driven by the runtime.
#[async_trait]
pub trait LoopTask: Send + 'static {
    async fn prepare(&mut self, _ctx: &TaskContext) -> Result<(), Error> {
        Ok(())
    }

    async fn iterate(&mut self, ctx: &TaskContext) -> Result<(), Error>;

    async fn finalize(&mut self, _ctx: &TaskContext) -> Result<(), Error> {
        Ok(())
    }
}

/// Adapter that drives a [`LoopTask`] on the loop grid, honouring the
/// missed-loop policy.
pub struct LoopDriver<T: LoopTask> {
    task: T,
    config: LoopConfig,
}

impl<T: LoopTask> LoopDriver<T> {
    pub fn new(task: T, config: LoopConfig) -> LoopDriver<T> {
        LoopDriver { task, config }
    }

    async fn drive(&mut self, ctx: &TaskContext) -> Result<(), Error> {
        let period = self.config.period;
        // The first iteration runs immediately; later ones on the grid.
        let mut scheduled = Instant::now();
        while !ctx.stop_requested() {
            let now = Instant::now();
            if scheduled > now && !ctx.sleep(scheduled - now).await {
                break;
            }
            if ctx.stop_requested() {
                break;
            }
            ctx.sync_settings();
            self.task.iterate(ctx).await?;
            ctx.publish_status();

            let now = Instant::now();
            let next = scheduled + period;
            if now <= next {
                scheduled = next;
                continue;
            }
            let late = now - next;
            warn!(
                "task {} missed its loop period by {:?}",
                ctx.name(),
                late
            );
            match self.config.policy {
                MissedLoopPolicy::Immediate => {
                    scheduled = now;
                }
                MissedLoopPolicy::Skip => {
                    // Smallest grid tick at or after now.
                    let elapsed = now - scheduled;
                    let periods =
                        (elapsed.as_nanos() + period.as_nanos() - 1) / period.as_nanos();
                    scheduled += period * periods as u32;
                }
                MissedLoopPolicy::Terminate => {
                    return Err(Error::overrun(format!(
                        "task {} missed its loop period of {:?} by {:?}",
                        ctx.name(),
                        period,
                        late
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T: LoopTask> Task for LoopDriver<T> {
    async fn run(&mut self, ctx: &TaskContext) -> Result<(), Error> {
        self.task.prepare(ctx).await?;
        let result = self.drive(ctx).await;
        let finalized = self.task.finalize(ctx).await;
        result.and(finalized)
    }
}

/// RPC service that hosts one task: exposes start/stop/join, the settings
/// channel and status over the messaging fabric.
///
/// Every task carries the built-in `settings` and `status` signals in its
/// catalogue, next to any signals the task itself declares.
pub struct TaskRunner {
    shared: Arc<TaskContext>,
    task: Option<Box<dyn Task>>,
    worker: Option<Worker>,
    failure: Arc<Mutex<Option<Error>>>,
    finished: Arc<Mutex<bool>>,
    extra_signals: Vec<SignalDescriptor>,
}

impl TaskRunner {
    pub(crate) fn new(
        shared: Arc<TaskContext>,
        task: Box<dyn Task>,
        extra_signals: Vec<SignalDescriptor>,
    ) -> TaskRunner {
        TaskRunner {
            shared,
            task: Some(task),
            worker: None,
            failure: Arc::new(Mutex::new(None)),
            finished: Arc::new(Mutex::new(false)),
            extra_signals,
        }
    }

    fn start_task(&mut self) -> Result<Value, Error> {
        let mut task = match self.task.take() {
            Some(task) => task,
            None => {
                return Err(Error::illegal_state(format!(
                    "task {} already started",
                    self.shared.name()
                )))
            }
        };
        let shared = Arc::clone(&self.shared);
        let failure = Arc::clone(&self.failure);
        let finished = Arc::clone(&self.finished);
        info!("starting task {}", shared.name());
        let worker = Worker::spawn(format!("task-{}", shared.name()), move |_stop| async move {
            let result = task.run(&shared).await;
            if let Err(err) = &result {
                warn!("task {} failed: {}", shared.name(), err);
                let mut slot = failure.lock().expect("task failure slot");
                *slot = Some(err.clone());
            }
            let mut done = finished.lock().expect("task finished slot");
            *done = true;
            Ok(())
        });
        self.worker = Some(worker);
        Ok(Value::Null)
    }

    fn stop_task(&mut self) -> Value {
        self.shared.request_stop();
        if let Some(worker) = &self.worker {
            worker.request_stop();
        }
        Value::Null
    }

    async fn join_task(&mut self, timeout: Option<Duration>) -> Result<Value, Error> {
        let worker = match &self.worker {
            Some(worker) => worker,
            None => {
                return Err(Error::illegal_state(format!(
                    "task {} was not started",
                    self.shared.name()
                )))
            }
        };
        worker.join(timeout).await?;
        let failure = {
            let mut slot = self.failure.lock().expect("task failure slot");
            slot.take()
        };
        match failure {
            Some(err) => Err(err),
            None => Ok(Value::Null),
        }
    }

    fn is_running(&self) -> bool {
        self.worker.is_some() && !*self.finished.lock().expect("task finished slot")
    }
}

#[async_trait]
impl RpcService for TaskRunner {
    fn describe(&self) -> ServiceDescriptor {
        let mut signals = vec![
            SignalDescriptor::new(SETTINGS_SIGNAL, "Published when the task settings change."),
            SignalDescriptor::new(STATUS_SIGNAL, "Published when the task status updates."),
        ];
        signals.extend(self.extra_signals.iter().cloned());
        ServiceDescriptor {
            methods: vec![
                MethodDescriptor::new("start", "()", "Start the task routine."),
                MethodDescriptor::new("stop", "()", "Request cooperative stop."),
                MethodDescriptor::new(
                    "join",
                    "(timeout?)",
                    "Wait for completion; raises the task failure, if any.",
                ),
                MethodDescriptor::new("is_running", "()", ""),
                MethodDescriptor::new("update_settings", "(settings)", ""),
                MethodDescriptor::new("get_settings", "()", ""),
                MethodDescriptor::new("get_pending_settings", "()", ""),
                MethodDescriptor::new("get_status", "()", ""),
            ],
            signals,
        }
    }

    async fn call(&mut self, method: &str, args: &Args) -> Result<Value, Error> {
        match method {
            "start" => self.start_task(),
            "stop" => Ok(self.stop_task()),
            "join" => {
                let timeout = match args.positional.first() {
                    Some(Value::Float(secs)) => Some(Duration::from_secs_f64(*secs)),
                    Some(Value::Int(secs)) => Some(Duration::from_secs(*secs as u64)),
                    Some(Value::Null) | None => None,
                    Some(other) => {
                        return Err(Error::invalid_argument(format!(
                            "join timeout must be a number, got {}",
                            other.kind_name()
                        )))
                    }
                };
                self.join_task(timeout).await
            }
            "is_running" => Ok(Value::Bool(self.is_running())),
            "update_settings" => {
                let new_settings = args.require(0)?.clone();
                self.shared.submit_settings(new_settings);
                Ok(Value::Null)
            }
            "get_settings" => Ok(self.shared.settings()),
            "get_pending_settings" => Ok(self.shared.pending_settings().unwrap_or(Value::Null)),
            "get_status" => Ok(self.shared.status()),
            other => Err(Error::unknown_method(format!(
                "task runner has no method {:?}",
                other
            ))),
        }
    }

    async fn released(&mut self) {
        // Make sure the routine is not left running without its service.
        self.shared.request_stop();
        if let Some(worker) = &self.worker {
            worker.request_stop();
            if let Err(err) = worker.join(Some(Duration::from_secs(5))).await {
                warn!("task {} did not stop in time: {}", self.shared.name(), err);
            }
        }
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.shared.request_stop();
    }
}
