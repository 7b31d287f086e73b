//! Task futures with cancellation and late-binding timeouts.
//!
//! `Pool::exec` hands back a [`TaskFuture`] resolved through a oneshot
//! channel. Cancellation and timeout are carried by a controller shared
//! between the future, any number of [`TaskHandle`] clones, and the worker
//! handle the task is dispatched to, so cancelling any of them cancels the
//! one underlying task.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::PoolError;
use crate::handle::HandleInner;
use crate::protocol::RemoteError;

/// What a settled task produced.
pub type TaskOutcome = std::result::Result<Value, PoolError>;

/// Per-task event callback, invoked for every inbound event envelope (and
/// stderr chunk when stream forwarding is enabled).
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// A callable shipped to an in-process worker under the built-in `run` method.
pub(crate) type NativeCall =
    Box<dyn FnOnce(Vec<Value>) -> std::result::Result<Value, RemoteError> + Send + 'static>;

/// Options for a single `exec` call.
#[derive(Default, Clone)]
pub struct ExecOptions {
    /// Callback for event envelopes emitted by the worker for this task.
    pub on: Option<EventHandler>,
    /// Transferable handles forwarded with the request envelope.
    pub transfer: Option<Vec<Value>>,
}

/// Why a task was torn away from its worker.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CancelKind {
    Cancel,
    Timeout(Duration),
}

impl CancelKind {
    pub(crate) fn to_error(self) -> PoolError {
        match self {
            Self::Cancel => PoolError::Cancelled,
            Self::Timeout(after) => PoolError::TimedOut(after),
        }
    }
}

impl std::fmt::Display for CancelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancel => write!(f, "cancelled"),
            Self::Timeout(after) => write!(f, "timed out after {:?}", after),
        }
    }
}

#[derive(Debug)]
enum Phase {
    Queued,
    Dispatched {
        worker: Weak<HandleInner>,
        request_id: u32,
    },
    Done,
}

#[derive(Debug)]
struct CtrlInner {
    sender: Option<oneshot::Sender<TaskOutcome>>,
    phase: Phase,
    /// Timeout recorded while the task is still queued.
    pending_timeout: Option<Duration>,
    /// Armed timer once dispatched.
    timer: Option<tokio::task::JoinHandle<()>>,
}

/// Shared state machine behind a task future.
#[derive(Debug)]
pub(crate) struct TaskController {
    inner: Mutex<CtrlInner>,
}

impl TaskController {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<TaskOutcome>) {
        let (tx, rx) = oneshot::channel();
        let ctrl = Arc::new(Self {
            inner: Mutex::new(CtrlInner {
                sender: Some(tx),
                phase: Phase::Queued,
                pending_timeout: None,
                timer: None,
            }),
        });
        (ctrl, rx)
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.inner
            .lock()
            .expect("task controller poisoned")
            .sender
            .is_none()
    }

    /// Deliver the outcome. Every path after the first is a no-op, which is
    /// what keeps "resolves exactly once" true under races.
    pub(crate) fn settle(&self, outcome: TaskOutcome) {
        let mut inner = self.inner.lock().expect("task controller poisoned");
        let Some(tx) = inner.sender.take() else {
            return;
        };
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.phase = Phase::Done;
        drop(inner);
        let _ = tx.send(outcome);
    }

    /// Record that the task was handed to a worker. Arms any timeout stored
    /// while the task sat in the queue. Returns `false` if the task settled
    /// first (cancelled while queued) and must not be sent.
    pub(crate) fn mark_dispatched(
        self: &Arc<Self>,
        worker: Weak<HandleInner>,
        request_id: u32,
    ) -> bool {
        let mut inner = self.inner.lock().expect("task controller poisoned");
        if inner.sender.is_none() {
            return false;
        }
        inner.phase = Phase::Dispatched { worker, request_id };
        if let Some(after) = inner.pending_timeout.take() {
            inner.timer = Some(self.arm_timer(after));
        }
        true
    }

    /// Set the task deadline. A still-queued task stores the duration and
    /// the timer starts at dispatch, so queue wait never consumes it; a
    /// dispatched task starts the timer immediately.
    pub(crate) fn set_timeout(self: &Arc<Self>, after: Duration) {
        let mut inner = self.inner.lock().expect("task controller poisoned");
        if inner.sender.is_none() {
            return;
        }
        match inner.phase {
            Phase::Queued => inner.pending_timeout = Some(after),
            Phase::Dispatched { .. } => {
                if let Some(old) = inner.timer.take() {
                    old.abort();
                }
                inner.timer = Some(self.arm_timer(after));
            }
            Phase::Done => {}
        }
    }

    fn arm_timer(self: &Arc<Self>, after: Duration) -> tokio::task::JoinHandle<()> {
        let ctrl = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            ctrl.abort_with(CancelKind::Timeout(after));
        })
    }

    pub(crate) fn cancel(self: &Arc<Self>) {
        self.abort_with(CancelKind::Cancel);
    }

    /// Settle the caller with the cancellation/timeout error, then kick the
    /// cleanup protocol on the owning worker if the task was in flight.
    fn abort_with(self: &Arc<Self>, kind: CancelKind) {
        let dispatched = {
            let mut inner = self.inner.lock().expect("task controller poisoned");
            let Some(tx) = inner.sender.take() else {
                return;
            };
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            let dispatched = match &inner.phase {
                Phase::Dispatched { worker, request_id } => {
                    worker.upgrade().map(|w| (w, *request_id))
                }
                _ => None,
            };
            inner.phase = Phase::Done;
            let _ = tx.send(Err(kind.to_error()));
            dispatched
        };
        if let Some((worker, request_id)) = dispatched {
            crate::handle::begin_cleanup(worker, request_id, kind);
        }
    }
}

/// Future for one offloaded task.
///
/// Resolves exactly once with the task's result or a [`PoolError`].
#[derive(Debug)]
pub struct TaskFuture {
    ctrl: Arc<TaskController>,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskFuture {
    pub(crate) fn new(ctrl: Arc<TaskController>, rx: oneshot::Receiver<TaskOutcome>) -> Self {
        Self { ctrl, rx }
    }

    /// A cloneable handle for cancelling or timing out this task from
    /// elsewhere.
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            ctrl: Arc::clone(&self.ctrl),
        }
    }

    /// Cancel the task. The future resolves with [`PoolError::Cancelled`];
    /// the worker is asked to clean up, and is destroyed if it cannot.
    /// Call from within the pool's runtime.
    pub fn cancel(&self) {
        self.ctrl.cancel();
    }

    /// Apply a deadline (late-binding: queue wait is not counted). Call
    /// from within the pool's runtime.
    pub fn timeout(self, after: Duration) -> Self {
        self.ctrl.set_timeout(after);
        self
    }
}

impl Future for TaskFuture {
    type Output = TaskOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(outcome) => outcome,
            // The resolver is dropped only when its worker bookkeeping is
            // torn down without settling.
            Err(_) => Err(PoolError::WorkerTerminated),
        })
    }
}

/// Cloneable cancellation/timeout handle for a task.
#[derive(Clone)]
pub struct TaskHandle {
    ctrl: Arc<TaskController>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.ctrl.cancel();
    }

    pub fn timeout(&self, after: Duration) {
        self.ctrl.set_timeout(after);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_settle_resolves_future() {
        let (ctrl, rx) = TaskController::new();
        let fut = TaskFuture::new(ctrl.clone(), rx);
        ctrl.settle(Ok(serde_json::json!(5)));
        assert_eq!(fut.await.unwrap(), serde_json::json!(5));
    }

    #[tokio::test]
    async fn test_settle_is_idempotent() {
        let (ctrl, rx) = TaskController::new();
        let fut = TaskFuture::new(ctrl.clone(), rx);
        ctrl.settle(Ok(serde_json::json!(1)));
        ctrl.settle(Ok(serde_json::json!(2)));
        ctrl.settle(Err(PoolError::Cancelled));
        assert_eq!(fut.await.unwrap(), serde_json::json!(1));
    }

    #[tokio::test]
    async fn test_cancel_while_queued() {
        let (ctrl, rx) = TaskController::new();
        let fut = TaskFuture::new(ctrl.clone(), rx);
        fut.cancel();
        assert!(matches!(fut.await, Err(PoolError::Cancelled)));
        assert!(ctrl.is_settled());
    }

    #[tokio::test]
    async fn test_timeout_stored_while_queued() {
        let (ctrl, rx) = TaskController::new();
        let fut = TaskFuture::new(ctrl.clone(), rx).timeout(Duration::from_millis(10));
        // Not dispatched: the timer must not be running.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!ctrl.is_settled());
        ctrl.settle(Ok(serde_json::json!("late but fine")));
        assert!(fut.await.is_ok());
    }

    #[tokio::test]
    async fn test_timeout_fires_after_dispatch() {
        let (ctrl, rx) = TaskController::new();
        let fut = TaskFuture::new(ctrl.clone(), rx).timeout(Duration::from_millis(20));
        assert!(ctrl.mark_dispatched(Weak::new(), 1));
        match fut.await {
            Err(PoolError::TimedOut(after)) => assert_eq!(after, Duration::from_millis(20)),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mark_dispatched_refused_after_cancel() {
        let (ctrl, _rx) = TaskController::new();
        ctrl.cancel();
        assert!(!ctrl.mark_dispatched(Weak::new(), 1));
    }

    #[tokio::test]
    async fn test_handle_shares_cancellation() {
        let (ctrl, rx) = TaskController::new();
        let fut = TaskFuture::new(ctrl, rx);
        let handle = fut.handle();
        handle.cancel();
        assert!(matches!(fut.await, Err(PoolError::Cancelled)));
    }
}
