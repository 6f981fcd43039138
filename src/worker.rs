use futures::future::BoxFuture;
use log::{debug, error};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::Error;

/// Shared cooperative stop flag handed to a worker routine.
///
/// The routine checks the flag at every suspension point and on each
/// iteration of long loops; `request_stop` on the owning [`Worker`] sets
/// the flag and wakes any wait inside the routine.
#[derive(Clone)]
pub struct StopToken {
    inner: Arc<StopInner>,
}

struct StopInner {
    flag: AtomicBool,
    notify: Notify,
}

impl StopToken {
    pub fn new() -> StopToken {
        StopToken {
            inner: Arc::new(StopInner {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Non-blocking query of the stop flag.
    pub fn stop_requested(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Set the flag and wake every pending wait.
    pub fn request_stop(&self) {
        self.inner.flag.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Wait until stop is requested.
    pub async fn wait(&self) {
        // Register interest before re-checking the flag, otherwise a stop
        // request between the check and the await would be missed.
        loop {
            let notified = self.inner.notify.notified();
            if self.stop_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration`, returning early when stop is requested.
    /// Returns `false` if the sleep was interrupted by a stop request.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.stop_requested() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.wait() => false,
        }
    }
}

impl Default for StopToken {
    fn default() -> StopToken {
        StopToken::new()
    }
}

type Routine = Box<dyn FnOnce(StopToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// A long-running unit of execution with a uniform start/stop/join
/// lifecycle and a cooperative stop flag.
///
/// The routine runs as an independent tokio task. A fatal error escaping
/// the routine is logged and retained for the owning component to inspect
/// via [`Worker::take_failure`].
pub struct Worker {
    name: String,
    stop: StopToken,
    routine: Mutex<Option<Routine>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    failure: Arc<Mutex<Option<Error>>>,
}

impl Worker {
    /// Create a worker that will run `routine` once started.
    pub fn new<F, Fut>(name: impl Into<String>, routine: F) -> Worker
    where
        F: FnOnce(StopToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Worker {
            name: name.into(),
            stop: StopToken::new(),
            routine: Mutex::new(Some(Box::new(move |token| Box::pin(routine(token))))),
            handle: Mutex::new(None),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience constructor that also starts the worker.
    pub fn spawn<F, Fut>(name: impl Into<String>, routine: F) -> Worker
    where
        F: FnOnce(StopToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let worker = Worker::new(name, routine);
        // A freshly created worker always starts exactly once.
        worker
            .start()
            .unwrap_or_else(|_| unreachable!("fresh worker already started"));
        worker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the execution unit. Fails with `IllegalState` when the worker
    /// was already started.
    pub fn start(&self) -> Result<(), Error> {
        let routine = match self.routine.lock().expect("worker routine mutex").take() {
            Some(routine) => routine,
            None => {
                return Err(Error::illegal_state(format!(
                    "worker {} already started",
                    self.name
                )))
            }
        };
        let name = self.name.clone();
        let stop = self.stop.clone();
        let failure = Arc::clone(&self.failure);
        let handle = tokio::spawn(async move {
            debug!("worker {} started", name);
            match routine(stop).await {
                Ok(()) => debug!("worker {} finished", name),
                Err(err) => {
                    error!("worker {} failed: {:#}", name, err);
                    let mut slot = failure.lock().expect("worker failure mutex");
                    *slot = Some(Error::application(format!("worker {} failed: {:#}", name, err)));
                }
            }
        });
        let mut slot = self.handle.lock().expect("worker handle mutex");
        *slot = Some(handle);
        Ok(())
    }

    /// Stop token shared with the routine.
    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Non-blocking query of the stop flag.
    pub fn stop_requested(&self) -> bool {
        self.stop.stop_requested()
    }

    /// Request cooperative termination and wake blocking waits inside the
    /// routine. Does not wait for completion.
    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    /// Wait up to `timeout` for the routine to complete. `None` waits
    /// indefinitely. Fails with `Timeout` when the routine is still running
    /// at the deadline and with `IllegalState` when the worker was never
    /// started.
    pub async fn join(&self, timeout: Option<Duration>) -> Result<(), Error> {
        let handle = {
            let mut slot = self.handle.lock().expect("worker handle mutex");
            slot.take()
        };
        let handle = match handle {
            Some(handle) => handle,
            None => {
                return Err(Error::illegal_state(format!(
                    "worker {} not running",
                    self.name
                )))
            }
        };
        let result = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, handle).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(Error::timeout(format!(
                        "worker {} did not finish within {:?}",
                        self.name, timeout
                    )))
                }
            },
            None => handle.await,
        };
        if let Err(err) = result {
            error!("worker {} aborted: {}", self.name, err);
        }
        Ok(())
    }

    /// Stop and join in one call.
    pub async fn stop_and_join(&self, timeout: Option<Duration>) -> Result<(), Error> {
        self.request_stop();
        self.join(timeout).await
    }

    /// Fatal error recorded by the routine, if any. The owning component
    /// reads this after join to decide whether to tear down.
    pub fn take_failure(&self) -> Option<Error> {
        self.failure.lock().expect("worker failure mutex").take()
    }
}
