use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::address::Address;
use crate::error::Error;
use crate::message::Message;
use crate::router::MessageRouter;
use crate::rpc::future::RpcFuture;
use crate::value::{Args, Value};

/// Interval between lock attempts while waiting for a contended lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Client-side handle for a (possibly remote) service.
///
/// Method calls are translated into request messages and replies awaited
/// on a pending-call future. A proxy that successfully locks its service
/// stores the token as its lock session and attaches it to every
/// subsequent request.
pub struct Proxy {
    destination: Address,
    router: Arc<MessageRouter>,
    lock_session: Mutex<Option<String>>,
    call_timeout: Mutex<Option<Duration>>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("destination", &self.destination)
            .field("lock_session", &self.lock_session)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl Proxy {
    pub(crate) fn new(router: Arc<MessageRouter>, destination: Address) -> Proxy {
        Proxy {
            destination,
            router,
            lock_session: Mutex::new(None),
            call_timeout: Mutex::new(None),
        }
    }

    /// Address of the service this proxy points at.
    pub fn address(&self) -> &Address {
        &self.destination
    }

    /// Set the default timeout applied by [`Proxy::call`]. `None` (the
    /// default) waits indefinitely.
    pub fn set_call_timeout(&self, timeout: Option<Duration>) {
        let mut slot = self.call_timeout.lock().expect("proxy timeout slot");
        *slot = timeout;
    }

    /// The token bound to this proxy by a successful `lock`, if any.
    pub fn lock_session(&self) -> Option<String> {
        self.lock_session.lock().expect("proxy session slot").clone()
    }

    /// Emit a request and return the pending-call future immediately.
    pub async fn call_nonblocking(&self, method: &str, args: Args) -> Result<RpcFuture, Error> {
        let future = RpcFuture::register(Arc::clone(&self.router), self.destination.clone())?;
        let request = Message::Request {
            source: future.reply_address().clone(),
            destination: self.destination.clone(),
            request_id: future.request_id(),
            method: method.to_string(),
            args,
            lock_token: self.lock_session(),
        };
        self.router.dispatch(request).await?;
        Ok(future)
    }

    /// Blocking call: emit the request and wait for the reply, up to the
    /// proxy's call timeout.
    pub async fn call(&self, method: &str, args: Args) -> Result<Value, Error> {
        let timeout = *self.call_timeout.lock().expect("proxy timeout slot");
        self.call_with_timeout(method, args, timeout).await
    }

    /// Blocking call with an explicit per-call timeout.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Args,
        timeout: Option<Duration>,
    ) -> Result<Value, Error> {
        let future = self.call_nonblocking(method, args).await?;
        future.wait(timeout).await
    }

    /// Try to lock the service once. On success the token becomes this
    /// proxy's lock session. Returns whether the lock was granted.
    pub async fn lock(&self) -> Result<bool, Error> {
        self.lock_with(None, None).await
    }

    /// Lock with an optional wait budget and an optional custom token.
    /// While the lock is held elsewhere, the request is repeated every
    /// 100 ms until `wait` is exhausted.
    pub async fn lock_with(
        &self,
        wait: Option<Duration>,
        token: Option<String>,
    ) -> Result<bool, Error> {
        let deadline = wait.map(|wait| Instant::now() + wait);
        loop {
            let mut args = Args::none();
            if let Some(token) = &token {
                args = args.with_keyword("token", Value::Str(token.clone()));
            }
            let reply = self.call("lock", args).await?;
            let fields = reply
                .as_map()
                .ok_or_else(|| Error::application("malformed lock reply"))?;
            let granted = fields
                .get("granted")
                .and_then(|value| value.as_bool())
                .unwrap_or(false);
            if granted {
                let granted_token = fields
                    .get("token")
                    .and_then(|value| value.as_str())
                    .ok_or_else(|| Error::application("lock reply without token"))?;
                let mut session = self.lock_session.lock().expect("proxy session slot");
                *session = Some(granted_token.to_string());
                return Ok(true);
            }
            match deadline {
                Some(deadline) if Instant::now() + LOCK_RETRY_INTERVAL <= deadline => {
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                _ => return Ok(false),
            }
        }
    }

    /// Unlock using this proxy's lock session.
    pub async fn unlock(&self) -> Result<bool, Error> {
        self.unlock_with(None).await
    }

    /// Unlock with an explicit token (e.g. to release a lock held by a
    /// proxy in another context). Falls back to the lock session when no
    /// token is supplied.
    pub async fn unlock_with(&self, token: Option<String>) -> Result<bool, Error> {
        let token = match token.or_else(|| self.lock_session()) {
            Some(token) => token,
            None => {
                warn!(
                    "unlock of {} without token or lock session",
                    self.destination
                );
                return Ok(false);
            }
        };
        let args = Args::none().with_keyword("token", Value::Str(token.clone()));
        let reply = self.call("unlock", args).await?;
        let released = reply.as_bool().unwrap_or(false);
        if released {
            let mut session = self.lock_session.lock().expect("proxy session slot");
            if session.as_deref() == Some(token.as_str()) {
                *session = None;
            }
        } else {
            debug!("unlock of {} was refused", self.destination);
        }
        Ok(released)
    }

    /// Clear the service lock regardless of who holds it.
    pub async fn force_unlock(&self) -> Result<(), Error> {
        self.call("force_unlock", Args::none()).await?;
        let mut session = self.lock_session.lock().expect("proxy session slot");
        *session = None;
        Ok(())
    }

    /// Snapshot query of the service's lock state.
    pub async fn is_locked(&self) -> Result<bool, Error> {
        let reply = self.call("is_locked", Args::none()).await?;
        reply
            .as_bool()
            .ok_or_else(|| Error::application("malformed is_locked reply"))
    }
}
