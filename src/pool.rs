//! Pool of worker handles with a FIFO task queue.
//!
//! The pool owns the handles, the queue, and the sizing policy. Dispatch is
//! first-fit over the worker list; a fresh worker is spawned only when no
//! existing one is idle and the pool is below `max_workers`. Crashed
//! workers are removed and replaced to keep `min_workers`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::{PoolConfig, ResolvedConfig, WorkerKind};
use crate::error::{PoolError, Result};
use crate::future::{ExecOptions, NativeCall, TaskController, TaskFuture};
use crate::handle::{PoolEvent, WorkerHandle};
use crate::protocol::RemoteError;

/// A pool of isolated workers executing named methods.
///
/// Cloning is cheap; all clones drive the same pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    cfg: PoolConfig,
    sizing: ResolvedConfig,
    st: Mutex<PoolState>,
    events: mpsc::UnboundedSender<PoolEvent>,
}

struct PoolState {
    workers: Vec<WorkerHandle>,
    queue: VecDeque<QueuedTask>,
    terminated: bool,
    next_worker_id: usize,
}

struct QueuedTask {
    method: String,
    params: Vec<Value>,
    options: ExecOptions,
    native: Option<NativeCall>,
    ctrl: Arc<TaskController>,
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total_workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    /// Tasks still waiting in the queue.
    pub pending_tasks: usize,
    /// Tasks currently running (one per busy worker).
    pub active_tasks: usize,
}

impl Pool {
    /// Validate the configuration, start the maintenance loop, and spawn
    /// workers up to `min_workers`. Must be called within a tokio runtime.
    pub fn new(config: PoolConfig) -> Result<Self> {
        let sizing = config.resolve()?;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            cfg: config,
            sizing,
            st: Mutex::new(PoolState {
                workers: Vec::new(),
                queue: VecDeque::new(),
                terminated: false,
                next_worker_id: 0,
            }),
            events: events_tx,
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                match event {
                    PoolEvent::WorkerIdle { .. } => dispatch(&inner),
                    PoolEvent::WorkerExited { info, expected } => {
                        if let Some(hook) = &inner.cfg.on_worker_terminated {
                            hook(&info);
                        }
                        replace_worker(&inner, info.worker_id, expected);
                        dispatch(&inner);
                    }
                }
            }
        });

        for _ in 0..sizing.min_workers {
            let created = {
                let mut st = inner.st.lock().expect("pool state poisoned");
                spawn_worker(&inner, &mut st)?
            };
            notify_created(&inner, &created);
        }
        tracing::info!(
            min_workers = sizing.min_workers,
            max_workers = sizing.max_workers,
            kind = %sizing.kind,
            "worker pool initialized"
        );

        Ok(Self { inner })
    }

    /// Offload a registered method. Fails synchronously when the queue is
    /// full or the pool is terminated; everything later arrives through the
    /// returned future.
    pub fn exec(&self, method: impl Into<String>, params: Vec<Value>) -> Result<TaskFuture> {
        self.exec_with(method, params, ExecOptions::default())
    }

    /// [`Pool::exec`] with per-task options (event callback, transfer list).
    pub fn exec_with(
        &self,
        method: impl Into<String>,
        params: Vec<Value>,
        options: ExecOptions,
    ) -> Result<TaskFuture> {
        self.submit(method.into(), params, options, None)
    }

    /// Offload a closure instead of a registered method.
    ///
    /// The callable is shipped through the in-memory channel of a thread
    /// worker under the built-in `run` method; process pools reject it
    /// because code cannot be marshalled across a process boundary.
    pub fn exec_fn<F>(&self, task: F, params: Vec<Value>) -> Result<TaskFuture>
    where
        F: FnOnce(Vec<Value>) -> std::result::Result<Value, RemoteError> + Send + 'static,
    {
        if self.inner.sizing.kind != WorkerKind::Thread {
            return Err(PoolError::Config(
                "closure offload requires thread workers".to_string(),
            ));
        }
        self.submit(
            "run".to_string(),
            params,
            ExecOptions::default(),
            Some(Box::new(task)),
        )
    }

    fn submit(
        &self,
        method: String,
        params: Vec<Value>,
        options: ExecOptions,
        native: Option<NativeCall>,
    ) -> Result<TaskFuture> {
        let inner = &self.inner;
        let (ctrl, rx) = TaskController::new();
        {
            let mut st = inner.st.lock().expect("pool state poisoned");
            if st.terminated {
                return Err(PoolError::PoolTerminated);
            }
            if let Some(limit) = inner.cfg.max_queue_size
                && st.queue.len() >= limit
            {
                return Err(PoolError::QueueFull { limit });
            }
            st.queue.push_back(QueuedTask {
                method,
                params,
                options,
                native,
                ctrl: ctrl.clone(),
            });
        }
        dispatch(inner);
        Ok(TaskFuture::new(ctrl, rx))
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> PoolStats {
        let st = self.inner.st.lock().expect("pool state poisoned");
        let total_workers = st.workers.len();
        let busy_workers = st.workers.iter().filter(|w| w.busy()).count();
        PoolStats {
            total_workers,
            busy_workers,
            idle_workers: total_workers - busy_workers,
            pending_tasks: st.queue.len(),
            active_tasks: busy_workers,
        }
    }

    /// Query the workers' method list and build a thin invocation proxy.
    pub async fn proxy(&self) -> Result<Proxy> {
        let value = self.exec("methods", Vec::new())?.await?;
        let methods: Vec<String> = serde_json::from_value(value)?;
        Ok(Proxy {
            pool: self.clone(),
            methods,
        })
    }

    /// Reject all queued tasks, then tear down every worker concurrently.
    ///
    /// `timeout` overrides the per-worker terminate timeout for this
    /// shutdown. The pool accepts no work afterwards.
    pub async fn terminate(&self, force: bool, timeout: Option<Duration>) {
        let (workers, queued) = {
            let mut st = self.inner.st.lock().expect("pool state poisoned");
            st.terminated = true;
            (
                std::mem::take(&mut st.workers),
                std::mem::take(&mut st.queue),
            )
        };
        for task in queued {
            task.ctrl.settle(Err(PoolError::PoolTerminated));
        }
        let waits: Vec<_> = workers
            .iter()
            .map(|worker| worker.terminate_and_notify(force, timeout))
            .collect();
        futures::future::join_all(waits).await;
        tracing::info!(workers = workers.len(), "worker pool terminated");
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Ok(st) = self.st.get_mut() {
            for worker in &st.workers {
                worker.shutdown();
            }
        }
    }
}

/// Assign queued tasks to idle workers until one of them runs out.
fn dispatch(inner: &Arc<PoolInner>) {
    loop {
        let mut created: Option<WorkerHandle> = None;
        let (worker, task) = {
            let mut st = inner.st.lock().expect("pool state poisoned");
            if st.terminated {
                return;
            }
            // Tasks cancelled while queued are dropped, not dispatched.
            while st.queue.front().is_some_and(|t| t.ctrl.is_settled()) {
                st.queue.pop_front();
            }
            if st.queue.is_empty() {
                return;
            }
            let worker = match st.workers.iter().find(|w| w.assignable()).cloned() {
                Some(worker) => worker,
                None if st.workers.len() < inner.sizing.max_workers => {
                    match spawn_worker(inner, &mut st) {
                        Ok(worker) => {
                            created = Some(worker.clone());
                            worker
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to spawn worker");
                            let task = st.queue.pop_front().expect("queue emptied under lock");
                            drop(st);
                            task.ctrl.settle(Err(e));
                            continue;
                        }
                    }
                }
                None => return,
            };
            let task = st.queue.pop_front().expect("queue emptied under lock");
            (worker, task)
        };
        if let Some(created) = &created {
            notify_created(inner, created);
        }
        worker.exec(
            task.method,
            task.params,
            task.options.transfer,
            task.native,
            task.ctrl,
            task.options.on,
        );
    }
}

fn spawn_worker(inner: &Arc<PoolInner>, st: &mut PoolState) -> Result<WorkerHandle> {
    let worker_id = st.next_worker_id;
    st.next_worker_id += 1;
    let handle = WorkerHandle::spawn(&inner.cfg, inner.sizing.kind, worker_id, inner.events.clone())?;
    st.workers.push(handle.clone());
    Ok(handle)
}

fn notify_created(inner: &Arc<PoolInner>, worker: &WorkerHandle) {
    if let Some(hook) = &inner.cfg.on_worker_created {
        hook(&worker.info());
    }
}

/// Drop a dead worker from the list and top the pool back up to
/// `min_workers`.
fn replace_worker(inner: &Arc<PoolInner>, worker_id: usize, expected: bool) {
    let mut created: Option<WorkerHandle> = None;
    {
        let mut st = inner.st.lock().expect("pool state poisoned");
        st.workers.retain(|w| w.worker_id() != worker_id);
        if st.terminated {
            return;
        }
        if st.workers.len() < inner.sizing.min_workers {
            match spawn_worker(inner, &mut st) {
                Ok(handle) => created = Some(handle),
                Err(e) => tracing::error!(error = %e, "failed to replace worker"),
            }
        }
    }
    if !expected {
        tracing::debug!(worker_id, "removed crashed worker from pool");
    }
    if let Some(handle) = created {
        notify_created(inner, &handle);
    }
}

/// Mapping from worker method names to invocation stubs.
pub struct Proxy {
    pool: Pool,
    methods: Vec<String>,
}

impl Proxy {
    /// Method names offered by the workers.
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Forward an invocation to `Pool::exec`, verifying the name first.
    pub fn call(&self, name: &str, params: Vec<Value>) -> Result<TaskFuture> {
        if !self.methods.iter().any(|m| m == name) {
            return Err(PoolError::Remote(
                RemoteError::new(format!("unknown method \"{}\"", name))
                    .with_name("MethodNotFound"),
            ));
        }
        self.pool.exec(name, params)
    }
}
