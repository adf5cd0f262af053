//! Server actors: one task per server draining a bounded mailbox.
//!
//! Sequential processing inside the loop is the sole reason receiver code
//! can touch `state` without coordination. Everything else in the process
//! talks to a server through its mailbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{Notify, mpsc, oneshot};

use crate::error::{EvalError, Result};
use crate::eval::Runtime;
use crate::metrics_defs;
use crate::registry::MethodInfo;
use crate::value::{FunctionValue, Value};

tokio::task_local! {
    /// Name of the server whose receiver is running on this task, used to
    /// detect synchronous self-sends before they deadlock.
    pub(crate) static CURRENT_SERVER: String;
}

pub(crate) fn current_server() -> Option<String> {
    CURRENT_SERVER.try_with(|name| name.clone()).ok()
}

/// One unit of work for a server. `reply` is absent for fire-and-forget
/// sends.
pub struct Message {
    pub method: String,
    pub args: Vec<Value>,
    pub reply: Option<oneshot::Sender<Value>>,
}

/// Shared handle to a live server's state map. Bound as `state` inside
/// receivers; `set` mutates the live map in place.
#[derive(Clone, Default)]
pub struct StateHandle {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl StateHandle {
    pub fn new(initial: HashMap<String, Value>) -> StateHandle {
        StateHandle {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn get(&self, key: &str) -> Value {
        self.inner.read().get(key).cloned().unwrap_or(Value::Nil)
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.write().insert(key.into(), value);
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.inner.read().clone()
    }

    pub fn same_map(&self, other: &StateHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

struct ServerInner {
    name: String,
    state: StateHandle,
    receivers: HashMap<String, Arc<FunctionValue>>,
    tx: mpsc::Sender<Message>,
    running: AtomicBool,
    shutdown: Notify,
    /// Unix seconds of the last handled message (spawn time initially).
    last_seen: AtomicU64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<ServerInner>,
}

impl ServerHandle {
    /// Instantiates the server and starts its mailbox loop immediately.
    pub(crate) fn spawn(
        runtime: Runtime,
        name: String,
        initial_state: HashMap<String, Value>,
        receivers: HashMap<String, Arc<FunctionValue>>,
        capacity: usize,
    ) -> ServerHandle {
        let (tx, mut rx) = mpsc::channel(capacity);
        let inner = Arc::new(ServerInner {
            name: name.clone(),
            state: StateHandle::new(initial_state),
            receivers,
            tx,
            running: AtomicBool::new(true),
            shutdown: Notify::new(),
            last_seen: AtomicU64::new(unix_now()),
        });

        let loop_inner = inner.clone();
        tokio::spawn(CURRENT_SERVER.scope(name.clone(), async move {
            tracing::debug!(server = %loop_inner.name, "server started");
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(message) => loop_inner.handle(&runtime, message).await,
                        None => break,
                    },
                    _ = loop_inner.shutdown.notified() => break,
                }
            }
            loop_inner.running.store(false, Ordering::SeqCst);
            tracing::debug!(server = %loop_inner.name, "mailbox closed, server stopped");
        }));

        ServerHandle { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn last_seen(&self) -> u64 {
        self.inner.last_seen.load(Ordering::Relaxed)
    }

    pub fn same_instance(&self, other: &ServerHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> StateHandle {
        self.inner.state.clone()
    }

    /// Declared receivers, sorted by method name.
    pub fn methods(&self) -> Vec<MethodInfo> {
        let mut methods: Vec<MethodInfo> = self
            .inner
            .receivers
            .iter()
            .map(|(name, func)| MethodInfo {
                name: name.clone(),
                params: func.params.clone(),
            })
            .collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        methods
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.inner.receivers.contains_key(method)
    }

    /// Closes the mailbox. Queued messages that were not yet processed are
    /// dropped; their callers observe `ServerGone`.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            self.inner.shutdown.notify_one();
        }
    }

    /// Enqueues a message, optionally waiting for the reply.
    ///
    /// Enqueueing is bounded by `enqueue_timeout` (`Backpressure` on
    /// expiry); the reply wait is bounded by `reply_timeout` (`Timeout` on
    /// expiry).
    pub async fn send_message(
        &self,
        method: &str,
        args: Vec<Value>,
        wait_for_reply: bool,
        reply_timeout: Duration,
        enqueue_timeout: Duration,
    ) -> Result<Value> {
        if !self.is_running() {
            return Err(EvalError::ServerGone(self.inner.name.clone()));
        }

        let (reply_tx, reply_rx) = if wait_for_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let message = Message {
            method: method.to_string(),
            args,
            reply: reply_tx,
        };

        self.inner
            .tx
            .send_timeout(message, enqueue_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => {
                    metrics::counter!(metrics_defs::MAILBOX_BACKPRESSURE).increment(1);
                    EvalError::Backpressure(self.inner.name.clone())
                }
                SendTimeoutError::Closed(_) => EvalError::ServerGone(self.inner.name.clone()),
            })?;

        let Some(rx) = reply_rx else {
            return Ok(Value::Nil);
        };

        match tokio::time::timeout(reply_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            // The loop dropped the reply sender without fulfilling it.
            Ok(Err(_)) => Err(EvalError::ServerGone(self.inner.name.clone())),
            Err(_) => Err(EvalError::Timeout(format!(
                "reply from {}.{}",
                self.inner.name, method
            ))),
        }
    }
}

impl ServerInner {
    async fn handle(&self, runtime: &Runtime, message: Message) {
        self.last_seen.store(unix_now(), Ordering::Relaxed);
        metrics::counter!(metrics_defs::MESSAGES_PROCESSED).increment(1);

        let result = match self.receivers.get(&message.method) {
            Some(receiver) => {
                runtime
                    .invoke_receiver(receiver, &self.state, message.args)
                    .await
            }
            None => {
                tracing::debug!(
                    server = %self.name,
                    method = %message.method,
                    "message for unknown method"
                );
                Ok(Value::Nil)
            }
        };

        let value = match result {
            Ok(value) => value,
            Err(error) => {
                metrics::counter!(metrics_defs::RECEIVER_FAILURES).increment(1);
                tracing::warn!(
                    server = %self.name,
                    method = %message.method,
                    error = %error,
                    "receiver failed, replying nil"
                );
                Value::Nil
            }
        };

        if let Some(reply) = message.reply {
            // A caller that timed out already dropped its receiver.
            let _ = reply.send(value);
        }
    }
}
