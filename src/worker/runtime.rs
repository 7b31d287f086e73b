//! Worker message loop.
//!
//! One loop serves both endpoint kinds: process workers bridge it to
//! stdin/stdout JSON lines, thread workers to in-memory channels. The loop
//! executes one user method at a time, stays responsive to cleanup and
//! terminate messages while a method runs, and serializes every outcome
//! (including panics) into a response envelope.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};

use crate::future::NativeCall;
use crate::protocol::{CLEANUP_METHOD_ID, ControllerMessage, RemoteError, Reply, Request,
    WorkerMessage};

use super::{ListenerFn, Registry, TaskContext};

/// Inbound work for the loop, already classified by the transport.
pub(crate) enum WorkerInput {
    /// A request envelope, optionally carrying a native callable shipped
    /// through an in-memory channel.
    Request(Request, Option<NativeCall>),
    /// The bare terminate signal (or end of the inbound stream).
    Terminate,
}

/// Outbound traffic from the loop to the transport.
pub(crate) enum Outgoing {
    Message(Value),
    /// Barrier: acknowledged once every prior message has been written.
    Flush(oneshot::Sender<()>),
}

impl std::fmt::Debug for Outgoing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(v) => f.debug_tuple("Message").field(v).finish(),
            Self::Flush(_) => f.debug_tuple("Flush").finish(),
        }
    }
}

struct CurrentTask {
    id: u32,
    join: tokio::task::JoinHandle<()>,
}

/// Serve the registry over stdio. Returns the process exit code.
pub(crate) async fn serve_stdio(registry: Arc<Registry>) -> i32 {
    let (in_tx, in_rx) = mpsc::unbounded_channel::<WorkerInput>();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "worker received malformed line");
                    continue;
                }
            };
            let input = match ControllerMessage::from_value(value) {
                Some(ControllerMessage::Terminate) => WorkerInput::Terminate,
                Some(ControllerMessage::Request(req)) => WorkerInput::Request(req, None),
                None => {
                    tracing::warn!("worker received unclassifiable message");
                    continue;
                }
            };
            if in_tx.send(input).is_err() {
                return;
            }
        }
        // EOF: the controller closed our stdin. Shut down cleanly.
        let _ = in_tx.send(WorkerInput::Terminate);
    });

    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(out) = out_rx.recv().await {
            match out {
                Outgoing::Message(value) => {
                    let mut line = value.to_string();
                    line.push('\n');
                    if stdout.write_all(line.as_bytes()).await.is_err() {
                        return;
                    }
                    if stdout.flush().await.is_err() {
                        return;
                    }
                }
                Outgoing::Flush(ack) => {
                    let _ = stdout.flush().await;
                    let _ = ack.send(());
                }
            }
        }
    });

    serve(registry, in_rx, out_tx).await
}

/// Serve the registry over in-memory channels (thread workers).
pub(crate) async fn serve_channels(
    registry: Arc<Registry>,
    input: mpsc::UnboundedReceiver<WorkerInput>,
    out: mpsc::UnboundedSender<Outgoing>,
) {
    serve(registry, input, out).await;
}

async fn serve(
    registry: Arc<Registry>,
    mut input: mpsc::UnboundedReceiver<WorkerInput>,
    out: mpsc::UnboundedSender<Outgoing>,
) -> i32 {
    // Registration is complete by the time the loop starts.
    let _ = out.send(Outgoing::Message(WorkerMessage::Ready.to_value()));

    let listeners: Arc<Mutex<Vec<ListenerFn>>> = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<u32>();
    let mut current: Option<CurrentTask> = None;
    let mut backlog: VecDeque<(Request, Option<NativeCall>)> = VecDeque::new();

    loop {
        tokio::select! {
            msg = input.recv() => match msg {
                None => {
                    flush(&out).await;
                    return 0;
                }
                Some(WorkerInput::Terminate) => {
                    if let Some(handler) = registry.terminate_handler() {
                        handler(0).await;
                    }
                    flush(&out).await;
                    return 0;
                }
                Some(WorkerInput::Request(req, native)) => {
                    if req.method == CLEANUP_METHOD_ID {
                        if let Some(code) =
                            handle_cleanup(&registry, &listeners, req.id, &out, &mut current).await
                        {
                            flush(&out).await;
                            return code;
                        }
                    } else if current.is_some() {
                        backlog.push_back((req, native));
                    } else {
                        current = Some(start_task(
                            &registry, req, native, &out, &listeners, &done_tx,
                        ));
                    }
                }
            },
            finished = done_rx.recv() => {
                if let Some(id) = finished {
                    if current.as_ref().map(|c| c.id) == Some(id) {
                        current = None;
                    }
                    listeners
                        .lock()
                        .expect("abort listener list poisoned")
                        .clear();
                    if current.is_none()
                        && let Some((req, native)) = backlog.pop_front()
                    {
                        current = Some(start_task(
                            &registry, req, native, &out, &listeners, &done_tx,
                        ));
                    }
                }
            }
        }
    }
}

/// Start executing a request. The method runs as its own task so the loop
/// can keep serving cleanup and terminate messages.
fn start_task(
    registry: &Arc<Registry>,
    req: Request,
    native: Option<NativeCall>,
    out: &mpsc::UnboundedSender<Outgoing>,
    listeners: &Arc<Mutex<Vec<ListenerFn>>>,
    done: &mpsc::UnboundedSender<u32>,
) -> CurrentTask {
    let id = req.id;
    let cx = TaskContext::new(id, out.clone(), listeners.clone());
    let fut = resolve_method(registry, req, native, cx);

    let out = out.clone();
    let done = done.clone();
    let join = tokio::spawn(async move {
        let outcome = std::panic::AssertUnwindSafe(fut).catch_unwind().await;
        let msg = match outcome {
            Ok(Ok(reply)) => {
                let (result, transfer) = reply.into_parts();
                WorkerMessage::Result {
                    id,
                    result,
                    transfer,
                }
            }
            Ok(Err(error)) => WorkerMessage::Failure { id, error },
            Err(panic) => WorkerMessage::Failure {
                id,
                error: RemoteError::from_panic(panic),
            },
        };
        let _ = out.send(Outgoing::Message(msg.to_value()));
        let _ = done.send(id);
    });

    CurrentTask { id, join }
}

/// Look up the method (or built-in) for a request.
fn resolve_method(
    registry: &Arc<Registry>,
    req: Request,
    native: Option<NativeCall>,
    cx: TaskContext,
) -> BoxFuture<'static, Result<Reply, RemoteError>> {
    if let Some(call) = native {
        let params = req.params;
        return Box::pin(async move { call(params).map(Reply::from) });
    }
    match req.method.as_str() {
        "methods" => {
            let mut names = registry.method_names();
            names.push("methods".to_string());
            names.push("run".to_string());
            Box::pin(async move { Ok(Reply::from(json!(names))) })
        }
        "run" => Box::pin(async {
            Err(RemoteError::new(
                "method \"run\" requires an in-process worker",
            )
            .with_name("MethodNotFound"))
        }),
        name => match registry.get(name) {
            Some(method) => method(req.params, cx),
            None => {
                let message = format!("unknown method \"{}\"", name);
                Box::pin(async move { Err(RemoteError::new(message).with_name("MethodNotFound")) })
            }
        },
    }
}

/// Run registered abort listeners for a cleanup request and acknowledge.
///
/// Returns `Some(exit_code)` when a listener rejection requires the worker
/// to exit.
async fn handle_cleanup(
    registry: &Arc<Registry>,
    listeners: &Arc<Mutex<Vec<ListenerFn>>>,
    id: u32,
    out: &mpsc::UnboundedSender<Outgoing>,
    current: &mut Option<CurrentTask>,
) -> Option<i32> {
    let pending: Vec<ListenerFn> = {
        let mut guard = listeners.lock().expect("abort listener list poisoned");
        guard.drain(..).collect()
    };

    if pending.is_empty() {
        // Nothing registered: the controller will tear this worker down.
        send_ack(out, id, Some(RemoteError::new("Worker terminating")));
        return None;
    }

    let running: Vec<_> = pending.into_iter().map(|listener| listener()).collect();
    let bound = registry.abort_timeout();
    match tokio::time::timeout(bound, futures::future::join_all(running)).await {
        Ok(results) => {
            if let Some(error) = results.into_iter().find_map(|r| r.err()) {
                send_ack(out, id, Some(error));
                return Some(1);
            }
            // Listeners finished: drop whatever the task was still doing.
            if let Some(task) = current.take_if(|c| c.id == id) {
                task.join.abort();
            }
            send_ack(out, id, None);
            None
        }
        Err(_) => {
            send_ack(
                out,
                id,
                Some(
                    RemoteError::new(format!("abort listeners timed out after {:?}", bound))
                        .with_name("TimeoutError"),
                ),
            );
            None
        }
    }
}

fn send_ack(out: &mpsc::UnboundedSender<Outgoing>, id: u32, error: Option<RemoteError>) {
    let msg = WorkerMessage::CleanupAck { id, error };
    let _ = out.send(Outgoing::Message(msg.to_value()));
}

/// Wait until every previously sent message has been written.
async fn flush(out: &mpsc::UnboundedSender<Outgoing>) {
    let (tx, rx) = oneshot::channel();
    if out.send(Outgoing::Flush(tx)).is_ok() {
        let _ = rx.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_registry() -> Arc<Registry> {
        let mut registry = Registry::new();
        registry.register_sync("add", |params| {
            let a = params[0].as_i64().unwrap_or(0);
            let b = params[1].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });
        registry.register_sync("boom", |_| Err(RemoteError::new("x")));
        registry.register("panics", |_params, _cx| async {
            if true {
                panic!("deliberate");
            }
            Ok(Reply::from(Value::Null))
        });
        Arc::new(registry)
    }

    fn request(id: u32, method: &str, params: Vec<Value>) -> WorkerInput {
        WorkerInput::Request(
            Request {
                id,
                method: method.to_string(),
                params,
                transfer: None,
            },
            None,
        )
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Value {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("worker output timed out")
                .expect("worker output closed")
            {
                Outgoing::Message(v) => return v,
                Outgoing::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    }

    #[tokio::test]
    async fn test_ready_then_result() {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let server = tokio::spawn(serve(test_registry(), in_rx, out_tx));

        assert_eq!(next_message(&mut out_rx).await, json!("ready"));

        in_tx.send(request(1, "add", vec![json!(2), json!(3)])).unwrap();
        let msg = next_message(&mut out_rx).await;
        assert_eq!(msg["id"], json!(1));
        assert_eq!(msg["result"], json!(5));
        assert_eq!(msg["error"], Value::Null);

        in_tx.send(WorkerInput::Terminate).unwrap();
        assert_eq!(server.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_method_error_serialized() {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(test_registry(), in_rx, out_tx));
        next_message(&mut out_rx).await; // ready

        in_tx.send(request(1, "boom", vec![])).unwrap();
        let msg = next_message(&mut out_rx).await;
        assert_eq!(msg["result"], Value::Null);
        assert_eq!(msg["error"]["message"], json!("x"));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(test_registry(), in_rx, out_tx));
        next_message(&mut out_rx).await;

        in_tx.send(request(1, "missing", vec![])).unwrap();
        let msg = next_message(&mut out_rx).await;
        assert_eq!(msg["error"]["name"], json!("MethodNotFound"));
    }

    #[tokio::test]
    async fn test_panic_becomes_error_response() {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(test_registry(), in_rx, out_tx));
        next_message(&mut out_rx).await;

        in_tx.send(request(1, "panics", vec![])).unwrap();
        let msg = next_message(&mut out_rx).await;
        assert_eq!(msg["error"]["name"], json!("Panic"));
        assert_eq!(msg["error"]["message"], json!("deliberate"));
    }

    #[tokio::test]
    async fn test_cleanup_without_listeners() {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(test_registry(), in_rx, out_tx));
        next_message(&mut out_rx).await;

        in_tx.send(request(4, CLEANUP_METHOD_ID, vec![])).unwrap();
        let msg = next_message(&mut out_rx).await;
        assert_eq!(msg["method"], json!(CLEANUP_METHOD_ID));
        assert_eq!(msg["error"]["message"], json!("Worker terminating"));
    }

    #[tokio::test]
    async fn test_cleanup_with_listener_acks_clean() {
        let mut registry = Registry::new();
        registry.register("hang", |_params, cx: TaskContext| async move {
            cx.add_abort_listener(|| async { Ok(()) });
            futures::future::pending::<()>().await;
            Ok(Reply::from(Value::Null))
        });
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(Arc::new(registry), in_rx, out_tx));
        next_message(&mut out_rx).await;

        in_tx.send(request(1, "hang", vec![])).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        in_tx.send(request(1, CLEANUP_METHOD_ID, vec![])).unwrap();

        let msg = next_message(&mut out_rx).await;
        assert_eq!(msg["method"], json!(CLEANUP_METHOD_ID));
        assert_eq!(msg["error"], Value::Null);
    }

    #[tokio::test]
    async fn test_cleanup_listener_rejection_exits() {
        let mut registry = Registry::new();
        registry.register("hang", |_params, cx: TaskContext| async move {
            cx.add_abort_listener(|| async { Err(RemoteError::new("cannot stop")) });
            futures::future::pending::<()>().await;
            Ok(Reply::from(Value::Null))
        });
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let server = tokio::spawn(serve(Arc::new(registry), in_rx, out_tx));
        next_message(&mut out_rx).await;

        in_tx.send(request(1, "hang", vec![])).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        in_tx.send(request(1, CLEANUP_METHOD_ID, vec![])).unwrap();

        let msg = next_message(&mut out_rx).await;
        assert_eq!(msg["error"]["message"], json!("cannot stop"));
        assert_eq!(server.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_terminate_runs_handler() {
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen = flag.clone();
        let registry = Registry::new().with_terminate_handler(move |_code| {
            let seen = seen.clone();
            async move {
                seen.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        });
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let server = tokio::spawn(serve(Arc::new(registry), in_rx, out_tx));
        next_message(&mut out_rx).await;

        in_tx.send(WorkerInput::Terminate).unwrap();
        assert_eq!(server.await.unwrap(), 0);
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_events_precede_terminal() {
        let mut registry = Registry::new();
        registry.register("steps", |_params, cx: TaskContext| async move {
            cx.emit(json!(1));
            cx.emit(json!(2));
            Ok(Reply::from(json!("done")))
        });
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(Arc::new(registry), in_rx, out_tx));
        next_message(&mut out_rx).await;

        in_tx.send(request(1, "steps", vec![])).unwrap();
        let first = next_message(&mut out_rx).await;
        assert_eq!(first["isEvent"], json!(true));
        assert_eq!(first["payload"], json!(1));
        let second = next_message(&mut out_rx).await;
        assert_eq!(second["payload"], json!(2));
        let terminal = next_message(&mut out_rx).await;
        assert_eq!(terminal["result"], json!("done"));
    }
}
