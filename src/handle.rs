//! Controller-side worker handles.
//!
//! A handle owns one endpoint and its protocol state: the in-flight
//! `processing` map, the `tracking` map for cancelled tasks awaiting
//! cleanup, and the pre-ready request queue. Lifecycle flags move one way:
//! spawned, ready, possibly terminating/cleaning, terminated.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

use crate::config::{PoolConfig, SpawnOptions, WorkerInfo, WorkerKind};
use crate::endpoint::{self, InboundFrame, OutboundFrame, SpawnedEndpoint};
use crate::error::{CrashReport, PoolError};
use crate::future::{CancelKind, EventHandler, NativeCall, TaskController, TaskOutcome};
use crate::ports;
use crate::protocol::{Request, WorkerMessage};
use crate::signals::TerminationReason;

/// Lines of worker stderr retained for crash reports.
const STDERR_TAIL_LINES: usize = 64;

/// Notifications from handles to the pool's maintenance loop.
pub(crate) enum PoolEvent {
    /// The worker may accept a new task (terminal response or cleanup ack).
    WorkerIdle { worker_id: usize },
    /// The worker is gone. `expected` is false for crashes.
    WorkerExited { info: WorkerInfo, expected: bool },
}

#[derive(Clone)]
pub(crate) struct WorkerHandle {
    inner: Arc<HandleInner>,
}

pub(crate) struct HandleInner {
    worker_id: usize,
    kind: WorkerKind,
    /// What was spawned, for diagnostics.
    script: String,
    terminate_timeout: Duration,
    emit_std_streams: bool,
    debug_port: Option<u16>,
    pid: Option<u32>,
    out_tx: mpsc::UnboundedSender<OutboundFrame>,
    kill: mpsc::UnboundedSender<()>,
    events: mpsc::UnboundedSender<PoolEvent>,
    st: Mutex<HandleState>,
}

struct HandleState {
    ready: bool,
    terminating: bool,
    terminated: bool,
    cleaning: bool,
    last_id: u32,
    processing: HashMap<u32, ProcessingEntry>,
    tracking: HashMap<u32, TrackingEntry>,
    /// Requests held back until the `"ready"` signal, flushed FIFO.
    request_queue: VecDeque<OutboundFrame>,
    stderr_tail: VecDeque<String>,
    exit_waiters: Vec<oneshot::Sender<()>>,
    kill_timer: Option<tokio::task::JoinHandle<()>>,
    /// Kill-timer override requested by a deferred (non-force) terminate.
    teardown_timeout: Option<Duration>,
}

struct ProcessingEntry {
    ctrl: Arc<TaskController>,
    on_event: Option<EventHandler>,
}

struct TrackingEntry {
    timer: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn an endpoint of the configured kind and wire up its frames.
    pub(crate) fn spawn(
        cfg: &PoolConfig,
        kind: WorkerKind,
        worker_id: usize,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> crate::error::Result<Self> {
        let (spawned, script, debug_port, ready) = match kind {
            WorkerKind::Process => {
                let mut opts = SpawnOptions {
                    script: cfg.worker_script.clone(),
                    args: cfg.fork_args.clone(),
                    envs: cfg.fork_envs.clone(),
                    debug_port: cfg
                        .debug_ports
                        .then(|| ports::acquire(cfg.debug_port_start())),
                };
                if let Some(hook) = &cfg.on_spawn {
                    hook(&mut opts);
                }
                let script = opts
                    .script
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<current-exe>".to_string());
                match endpoint::process::spawn(&opts, worker_id) {
                    Ok(spawned) => (spawned, script, opts.debug_port, false),
                    Err(e) => {
                        if let Some(port) = opts.debug_port {
                            ports::release(port);
                        }
                        return Err(e);
                    }
                }
            }
            WorkerKind::Auto | WorkerKind::Thread => {
                let registry = cfg.registry.clone().ok_or_else(|| {
                    PoolError::Config("thread workers require a registry".to_string())
                })?;
                let spawned =
                    endpoint::thread::spawn(registry, worker_id, cfg.thread_stack_size)?;
                // The registry is installed up front: the handle starts
                // ready and treats the wire signal as a no-op drain.
                (spawned, "<thread>".to_string(), None, true)
            }
        };

        let SpawnedEndpoint { tx, rx, kill, pid } = spawned;
        let inner = Arc::new(HandleInner {
            worker_id,
            kind,
            script,
            terminate_timeout: cfg.terminate_timeout(),
            emit_std_streams: cfg.emit_std_streams,
            debug_port,
            pid,
            out_tx: tx,
            kill,
            events,
            st: Mutex::new(HandleState {
                ready,
                terminating: false,
                terminated: false,
                cleaning: false,
                last_id: 0,
                processing: HashMap::new(),
                tracking: HashMap::new(),
                request_queue: VecDeque::new(),
                stderr_tail: VecDeque::new(),
                exit_waiters: Vec::new(),
                kill_timer: None,
                teardown_timeout: None,
            }),
        });

        let reader = inner.clone();
        tokio::spawn(async move {
            let mut rx = rx;
            while let Some(frame) = rx.recv().await {
                match frame {
                    InboundFrame::Message(value) => handle_wire_message(&reader, value),
                    InboundFrame::Stderr(line) => handle_stderr(&reader, line),
                    InboundFrame::Exit(reason) => {
                        handle_exit(&reader, reason);
                        break;
                    }
                }
            }
        });

        Ok(Self { inner })
    }

    pub(crate) fn worker_id(&self) -> usize {
        self.inner.worker_id
    }

    pub(crate) fn info(&self) -> WorkerInfo {
        self.inner.info()
    }

    /// A worker is busy while a task is in flight or a cleanup exchange is
    /// pending.
    pub(crate) fn busy(&self) -> bool {
        let st = self.inner.st.lock().expect("worker handle poisoned");
        st.cleaning || !st.processing.is_empty()
    }

    /// Whether the dispatcher may hand this worker a new task.
    pub(crate) fn assignable(&self) -> bool {
        let st = self.inner.st.lock().expect("worker handle poisoned");
        !st.terminating && !st.terminated && !st.cleaning && st.processing.is_empty()
    }

    /// Send one task to this worker. The controller settles through the
    /// task's resolver; nothing is returned here.
    pub(crate) fn exec(
        &self,
        method: String,
        params: Vec<Value>,
        transfer: Option<Vec<Value>>,
        native: Option<NativeCall>,
        ctrl: Arc<TaskController>,
        on_event: Option<EventHandler>,
    ) {
        let inner = &self.inner;
        let mut st = inner.st.lock().expect("worker handle poisoned");
        st.last_id += 1;
        let id = st.last_id;
        if st.terminated {
            drop(st);
            ctrl.settle(Err(PoolError::WorkerTerminated));
            return;
        }
        // Refused when the task settled first (cancelled while queued).
        if !ctrl.mark_dispatched(Arc::downgrade(inner), id) {
            return;
        }
        tracing::trace!(
            worker_id = inner.worker_id,
            request_id = id,
            method = %method,
            "dispatching task"
        );
        st.processing.insert(id, ProcessingEntry { ctrl, on_event });
        let frame = OutboundFrame::Request(
            Request {
                id,
                method,
                params,
                transfer,
            },
            native,
        );
        // Sent under the lock so requests leave in id order.
        if st.ready {
            let _ = inner.out_tx.send(frame);
        } else {
            st.request_queue.push_back(frame);
        }
    }

    /// Tear the worker down. With `force`, in-flight tasks are rejected
    /// immediately; otherwise teardown waits for them to drain. The
    /// returned receiver resolves once the endpoint is gone.
    pub(crate) fn terminate_and_notify(
        &self,
        force: bool,
        timeout: Option<Duration>,
    ) -> oneshot::Receiver<()> {
        terminate_inner(&self.inner, force, timeout)
    }

    /// Last-resort teardown for drops: wire signal plus kill switch.
    pub(crate) fn shutdown(&self) {
        let _ = self.inner.out_tx.send(OutboundFrame::Terminate);
        let _ = self.inner.kill.send(());
    }
}

impl HandleInner {
    fn info(&self) -> WorkerInfo {
        WorkerInfo {
            worker_id: self.worker_id,
            pid: self.pid,
            kind: self.kind,
        }
    }
}

/// Start the cleanup exchange for a cancelled or timed-out task.
///
/// The caller's future has already settled with the original error; from
/// here the worker either acknowledges cleanup in time (and survives) or
/// is destroyed.
pub(crate) fn begin_cleanup(inner: Arc<HandleInner>, id: u32, kind: CancelKind) {
    let mut st = inner.st.lock().expect("worker handle poisoned");
    if st.terminated {
        return;
    }
    if st.processing.remove(&id).is_none() {
        // Terminal already arrived; nothing to clean up.
        return;
    }
    st.cleaning = true;
    let timer = {
        let watch = inner.clone();
        let bound = inner.terminate_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(bound).await;
            on_cleanup_timeout(&watch, id);
        })
    };
    st.tracking.insert(id, TrackingEntry { timer });
    tracing::debug!(
        worker_id = inner.worker_id,
        request_id = id,
        reason = %kind,
        "requesting task cleanup"
    );
    let frame = OutboundFrame::Request(Request::cleanup(id), None);
    if st.ready {
        let _ = inner.out_tx.send(frame);
    } else {
        st.request_queue.push_back(frame);
    }
}

fn on_cleanup_timeout(inner: &Arc<HandleInner>, id: u32) {
    {
        let mut st = inner.st.lock().expect("worker handle poisoned");
        if st.tracking.remove(&id).is_none() {
            return;
        }
    }
    tracing::warn!(
        worker_id = inner.worker_id,
        request_id = id,
        "cleanup timed out; forcing worker termination"
    );
    let _ = terminate_inner(inner, true, None);
}

fn terminate_inner(
    inner: &Arc<HandleInner>,
    force: bool,
    timeout: Option<Duration>,
) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    let mut rejected: Vec<ProcessingEntry> = Vec::new();
    {
        let mut st = inner.st.lock().expect("worker handle poisoned");
        if st.terminated {
            let _ = tx.send(());
            return rx;
        }
        st.exit_waiters.push(tx);
        if timeout.is_some() {
            st.teardown_timeout = timeout;
        }
        for (_, entry) in st.tracking.drain() {
            entry.timer.abort();
        }
        if force {
            rejected = st.processing.drain().map(|(_, entry)| entry).collect();
        }
        if force || st.processing.is_empty() {
            start_teardown(inner, &mut st, timeout);
        } else {
            st.terminating = true;
        }
    }
    for entry in rejected {
        entry.ctrl.settle(Err(PoolError::WorkerTerminated));
    }
    rx
}

/// Send the terminate signal and arm the kill timer.
fn start_teardown(inner: &Arc<HandleInner>, st: &mut HandleState, timeout: Option<Duration>) {
    st.terminating = true;
    st.cleaning = true;
    if st.kill_timer.is_some() {
        return;
    }
    if st.ready {
        let _ = inner.out_tx.send(OutboundFrame::Terminate);
    } else {
        st.request_queue.push_back(OutboundFrame::Terminate);
    }
    let bound = timeout
        .or(st.teardown_timeout)
        .unwrap_or(inner.terminate_timeout);
    let watch = inner.clone();
    st.kill_timer = Some(tokio::spawn(async move {
        tokio::time::sleep(bound).await;
        tracing::warn!(
            worker_id = watch.worker_id,
            "worker did not exit in time; killing endpoint"
        );
        let _ = watch.kill.send(());
    }));
}

fn handle_wire_message(inner: &Arc<HandleInner>, value: Value) {
    let Some(msg) = WorkerMessage::from_value(&value) else {
        tracing::warn!(
            worker_id = inner.worker_id,
            "discarding unclassifiable worker message"
        );
        return;
    };
    let mut st = inner.st.lock().expect("worker handle poisoned");
    if st.terminated {
        return;
    }
    match msg {
        WorkerMessage::Ready => {
            st.ready = true;
            // Drained under the lock so no fresh request can slip between
            // the queued ones.
            let mut flushed = 0usize;
            while let Some(frame) = st.request_queue.pop_front() {
                let _ = inner.out_tx.send(frame);
                flushed += 1;
            }
            drop(st);
            tracing::debug!(worker_id = inner.worker_id, flushed, "worker ready");
        }
        WorkerMessage::Event { id, payload, .. } => {
            let handler = st.processing.get(&id).and_then(|e| e.on_event.clone());
            drop(st);
            if let Some(handler) = handler {
                handler(payload);
            }
        }
        WorkerMessage::CleanupAck { id, error } => {
            let Some(entry) = st.tracking.remove(&id) else {
                return;
            };
            entry.timer.abort();
            match error {
                None => {
                    st.cleaning = false;
                    drop(st);
                    tracing::debug!(
                        worker_id = inner.worker_id,
                        request_id = id,
                        "cleanup acknowledged; worker kept"
                    );
                    let _ = inner.events.send(PoolEvent::WorkerIdle {
                        worker_id: inner.worker_id,
                    });
                }
                Some(err) => {
                    drop(st);
                    tracing::warn!(
                        worker_id = inner.worker_id,
                        request_id = id,
                        error = %err,
                        "cleanup failed; terminating worker"
                    );
                    let _ = terminate_inner(inner, true, None);
                }
            }
        }
        WorkerMessage::Result { id, result, .. } => finish_task(inner, st, id, Ok(result)),
        WorkerMessage::Failure { id, error } => {
            finish_task(inner, st, id, Err(PoolError::Remote(error)))
        }
    }
}

/// Handle a terminal response: settle the task, finalize a deferred
/// termination when the last in-flight request drains.
fn finish_task(
    inner: &Arc<HandleInner>,
    mut st: MutexGuard<'_, HandleState>,
    id: u32,
    outcome: TaskOutcome,
) {
    let entry = st.processing.remove(&id);
    if entry.is_none() {
        drop(st);
        tracing::trace!(
            worker_id = inner.worker_id,
            request_id = id,
            "terminal for unknown request discarded"
        );
        return;
    }
    let finalize = st.terminating && st.processing.is_empty();
    if finalize {
        start_teardown(inner, &mut st, None);
    }
    drop(st);
    if let Some(entry) = entry {
        entry.ctrl.settle(outcome);
    }
    if !finalize {
        let _ = inner.events.send(PoolEvent::WorkerIdle {
            worker_id: inner.worker_id,
        });
    }
}

fn handle_stderr(inner: &Arc<HandleInner>, line: String) {
    let handlers: Vec<EventHandler> = {
        let mut st = inner.st.lock().expect("worker handle poisoned");
        st.stderr_tail.push_back(line.clone());
        if st.stderr_tail.len() > STDERR_TAIL_LINES {
            st.stderr_tail.pop_front();
        }
        if inner.emit_std_streams {
            st.processing
                .values()
                .filter_map(|e| e.on_event.clone())
                .collect()
        } else {
            Vec::new()
        }
    };
    if inner.emit_std_streams {
        for handler in handlers {
            handler(json!({ "stderr": line }));
        }
    } else {
        log_worker_stderr(inner.worker_id, &line);
    }
}

/// Forward worker stderr through tracing, classified by content.
fn log_worker_stderr(worker_id: usize, line: &str) {
    let lower = line.to_lowercase();
    if lower.starts_with("trace:") {
        tracing::trace!(worker_id, "{}", line);
    } else if lower.contains("error:") {
        tracing::warn!(worker_id, "{}", line);
    } else {
        tracing::debug!(worker_id, "{}", line);
    }
}

fn handle_exit(inner: &Arc<HandleInner>, reason: TerminationReason) {
    let expected;
    let entries: Vec<ProcessingEntry>;
    let waiters: Vec<oneshot::Sender<()>>;
    let tail: Vec<String>;
    {
        let mut st = inner.st.lock().expect("worker handle poisoned");
        if st.terminated {
            return;
        }
        expected = st.terminating;
        st.terminated = true;
        st.ready = false;
        st.cleaning = false;
        if let Some(timer) = st.kill_timer.take() {
            timer.abort();
        }
        for (_, entry) in st.tracking.drain() {
            entry.timer.abort();
        }
        entries = st.processing.drain().map(|(_, entry)| entry).collect();
        waiters = std::mem::take(&mut st.exit_waiters);
        tail = st.stderr_tail.iter().cloned().collect();
        st.request_queue.clear();
    }

    if expected {
        tracing::debug!(worker_id = inner.worker_id, reason = %reason, "worker exited");
        for entry in entries {
            entry.ctrl.settle(Err(PoolError::WorkerTerminated));
        }
    } else {
        tracing::warn!(
            worker_id = inner.worker_id,
            reason = %reason,
            "worker exited unexpectedly"
        );
        for entry in entries {
            let report = CrashReport {
                reason: reason.clone(),
                script: inner.script.clone(),
                stderr_tail: tail.clone(),
            };
            entry.ctrl.settle(Err(PoolError::WorkerCrashed(report)));
        }
    }

    if let Some(port) = inner.debug_port {
        ports::release(port);
    }
    for waiter in waiters {
        let _ = waiter.send(());
    }
    let _ = inner.events.send(PoolEvent::WorkerExited {
        info: inner.info(),
        expected,
    });
}
