//! Worker-side runtime.
//!
//! Runs inside each spawned endpoint: receives requests, invokes registered
//! methods, streams events, and speaks the cleanup/terminate protocol. For
//! process workers the host binary hands control over at startup:
//!
//! ```no_run
//! fn methods() -> offload::Registry {
//!     let mut registry = offload::Registry::new();
//!     registry.register_sync("add", |params| {
//!         let a = params[0].as_i64().unwrap_or(0);
//!         let b = params[1].as_i64().unwrap_or(0);
//!         Ok(serde_json::json!(a + b))
//!     });
//!     registry
//! }
//!
//! fn main() {
//!     // Diverges when this process was spawned as a worker child.
//!     offload::worker::run_if_worker(methods);
//!     // ... normal host logic ...
//! }
//! ```
//!
//! Thread workers run the same loop over in-memory channels with the
//! registry supplied to the pool.

mod runtime;

pub(crate) use runtime::{Outgoing, WorkerInput, serve_channels};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use nix::sys::signal::{SigHandler, Signal};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::environment;
use crate::protocol::{RemoteError, Reply, Transfer, WorkerMessage};

/// Default bound on the total time allowed for abort listeners.
pub const DEFAULT_ABORT_LISTENER_TIMEOUT: Duration = Duration::from_millis(1000);

type MethodFn = Arc<
    dyn Fn(Vec<Value>, TaskContext) -> BoxFuture<'static, Result<Reply, RemoteError>>
        + Send
        + Sync,
>;

type TerminateFn = Arc<dyn Fn(i32) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) type ListenerFn =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<(), RemoteError>> + Send>;

/// Table of methods a worker executes, plus its termination handler and
/// abort-listener bound.
#[derive(Default)]
pub struct Registry {
    methods: HashMap<String, MethodFn>,
    on_terminate: Option<TerminateFn>,
    abort_listener_timeout: Option<Duration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async method. The callable receives the request params
    /// and a [`TaskContext`] for emitting events and adding abort listeners.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, method: F)
    where
        F: Fn(Vec<Value>, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, RemoteError>> + Send + 'static,
    {
        self.methods.insert(
            name.into(),
            Arc::new(
                move |params, cx| -> BoxFuture<'static, Result<Reply, RemoteError>> {
                    Box::pin(method(params, cx))
                },
            ),
        );
    }

    /// Register a plain synchronous method.
    pub fn register_sync<F>(&mut self, name: impl Into<String>, method: F)
    where
        F: Fn(Vec<Value>) -> Result<Value, RemoteError> + Send + Sync + 'static,
    {
        self.register(name, move |params, _cx| {
            let out = method(params);
            async move { out.map(Reply::from) }
        });
    }

    /// Handler run (and awaited, outcome ignored) before the worker exits
    /// on a terminate signal.
    pub fn with_terminate_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(i32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_terminate = Some(Arc::new(move |code| -> BoxFuture<'static, ()> {
            Box::pin(handler(code))
        }));
        self
    }

    /// Bound on the total time allowed for abort listeners. Defaults to
    /// 1000 ms.
    pub fn with_abort_listener_timeout(mut self, timeout: Duration) -> Self {
        self.abort_listener_timeout = Some(timeout);
        self
    }

    /// Names of all registered methods.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn get(&self, name: &str) -> Option<MethodFn> {
        self.methods.get(name).cloned()
    }

    pub(crate) fn terminate_handler(&self) -> Option<TerminateFn> {
        self.on_terminate.clone()
    }

    pub(crate) fn abort_timeout(&self) -> Duration {
        self.abort_listener_timeout
            .unwrap_or(DEFAULT_ABORT_LISTENER_TIMEOUT)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("methods", &self.method_names())
            .field("abort_listener_timeout", &self.abort_timeout())
            .finish()
    }
}

/// Capability object handed to each method invocation.
#[derive(Clone)]
pub struct TaskContext {
    request_id: u32,
    out: mpsc::UnboundedSender<Outgoing>,
    listeners: Arc<Mutex<Vec<ListenerFn>>>,
}

impl TaskContext {
    pub(crate) fn new(
        request_id: u32,
        out: mpsc::UnboundedSender<Outgoing>,
        listeners: Arc<Mutex<Vec<ListenerFn>>>,
    ) -> Self {
        Self {
            request_id,
            out,
            listeners,
        }
    }

    /// Id of the request this context belongs to.
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Send a fire-and-forget event envelope for the current request.
    pub fn emit(&self, payload: Value) {
        let msg = WorkerMessage::Event {
            id: self.request_id,
            payload,
            transfer: None,
        };
        let _ = self.out.send(Outgoing::Message(msg.to_value()));
    }

    /// Send an event with transferable handles attached.
    pub fn emit_transfer(&self, t: Transfer) {
        let msg = WorkerMessage::Event {
            id: self.request_id,
            payload: t.message,
            transfer: Some(t.transfer),
        };
        let _ = self.out.send(Outgoing::Message(msg.to_value()));
    }

    /// Register a listener run when the controller requests cleanup for a
    /// cancelled or timed-out task. Listeners that finish in time keep the
    /// worker alive.
    pub fn add_abort_listener<F, Fut>(&self, listener: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), RemoteError>> + Send + 'static,
    {
        let mut listeners = self.listeners.lock().expect("abort listener list poisoned");
        listeners.push(Box::new(
            move || -> BoxFuture<'static, Result<(), RemoteError>> { Box::pin(listener()) },
        ));
    }
}

/// Enter the worker loop if this process was spawned as a worker child;
/// return immediately otherwise. Call first thing in `main` of any binary
/// that serves as a process worker via current-exe re-execution.
pub fn run_if_worker<F>(build: F)
where
    F: FnOnce() -> Registry,
{
    if environment::is_worker_process() {
        run_worker(build());
    }
}

/// Serve the given registry over stdio. Never returns; the process exits
/// when the controller terminates it or the stream closes.
pub fn run_worker(registry: Registry) -> ! {
    // Pipe errors must surface as io::Error, not kill the process.
    unsafe {
        let _ = nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build worker runtime");
    let code = rt.block_on(runtime::serve_stdio(Arc::new(registry)));
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_names_sorted() {
        let mut registry = Registry::new();
        registry.register_sync("zeta", |_| Ok(Value::Null));
        registry.register_sync("alpha", |_| Ok(Value::Null));
        assert_eq!(registry.method_names(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_abort_timeout_default() {
        let registry = Registry::new();
        assert_eq!(registry.abort_timeout(), DEFAULT_ABORT_LISTENER_TIMEOUT);
        let registry = Registry::new().with_abort_listener_timeout(Duration::from_millis(50));
        assert_eq!(registry.abort_timeout(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_context_emit_shapes_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cx = TaskContext::new(5, tx, Arc::new(Mutex::new(Vec::new())));
        cx.emit(json!({"step": 1}));
        match rx.recv().await {
            Some(Outgoing::Message(v)) => {
                assert_eq!(v["id"], json!(5));
                assert_eq!(v["isEvent"], json!(true));
                assert_eq!(v["payload"]["step"], json!(1));
            }
            other => panic!("expected event message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_context_collects_listeners() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let listeners = Arc::new(Mutex::new(Vec::new()));
        let cx = TaskContext::new(1, tx, listeners.clone());
        cx.add_abort_listener(|| async { Ok(()) });
        cx.add_abort_listener(|| async { Ok(()) });
        assert_eq!(listeners.lock().unwrap().len(), 2);
    }
}
