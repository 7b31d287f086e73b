//! Pool configuration and validation.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::environment;
use crate::error::PoolError;
use crate::worker::Registry;

/// Default bound on worker teardown and cleanup acknowledgement.
pub const DEFAULT_WORKER_TERMINATE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default first port handed out by the debug-port allocator.
pub const DEFAULT_DEBUG_PORT_START: u16 = 43210;

/// Kind of isolation backing each worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerKind {
    /// Pick the best kind for this platform (resolves to `Thread`).
    #[default]
    Auto,
    /// In-process OS thread running the registry supplied to the pool.
    Thread,
    /// Separate OS process speaking the wire protocol over stdio.
    Process,
}

impl FromStr for WorkerKind {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "thread" => Ok(Self::Thread),
            "process" => Ok(Self::Process),
            "web" => Err(PoolError::Config(
                "worker kind \"web\" requires a browser host".to_string(),
            )),
            other => Err(PoolError::Config(format!(
                "unknown worker kind: \"{}\". Valid options: auto, thread, process",
                other
            ))),
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Thread => write!(f, "thread"),
            Self::Process => write!(f, "process"),
        }
    }
}

/// Lower bound on pool size: a count, or "as many as `max_workers`".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MinWorkers {
    #[default]
    None,
    Count(usize),
    Max,
}

/// Parameters for spawning one process worker, mutable from the
/// `on_spawn` hook before the child starts.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Worker binary to spawn; `None` re-executes the current binary
    /// (the host must call `worker::run_if_worker` at startup).
    pub script: Option<PathBuf>,
    /// Extra command-line arguments for the child.
    pub args: Vec<String>,
    /// Extra environment variables for the child.
    pub envs: Vec<(String, String)>,
    /// Allocated debug port, exported to the child when set.
    pub debug_port: Option<u16>,
}

/// Identity of a spawned worker, passed to lifecycle hooks.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub worker_id: usize,
    pub pid: Option<u32>,
    pub kind: WorkerKind,
}

pub type SpawnHook = Arc<dyn Fn(&mut SpawnOptions) + Send + Sync>;
pub type WorkerHook = Arc<dyn Fn(&WorkerInfo) + Send + Sync>;

/// Pool configuration.
///
/// Built with `with_*` methods and validated when the pool is constructed;
/// invalid values fail fast with [`PoolError::Config`].
#[derive(Clone, Default)]
pub struct PoolConfig {
    pub(crate) min_workers: MinWorkers,
    pub(crate) max_workers: Option<usize>,
    pub(crate) max_queue_size: Option<usize>,
    pub(crate) worker_kind: WorkerKind,
    pub(crate) worker_script: Option<PathBuf>,
    pub(crate) fork_args: Vec<String>,
    pub(crate) fork_envs: Vec<(String, String)>,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) worker_terminate_timeout: Option<Duration>,
    pub(crate) debug_ports: bool,
    pub(crate) debug_port_start: Option<u16>,
    pub(crate) emit_std_streams: bool,
    pub(crate) registry: Option<Arc<Registry>>,
    pub(crate) on_spawn: Option<SpawnHook>,
    pub(crate) on_worker_created: Option<WorkerHook>,
    pub(crate) on_worker_terminated: Option<WorkerHook>,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at least `count` workers alive, spawning eagerly at construction.
    pub fn with_min_workers(mut self, count: usize) -> Self {
        self.min_workers = MinWorkers::Count(count);
        self
    }

    /// Keep `max_workers` workers alive at all times.
    pub fn with_min_workers_max(mut self) -> Self {
        self.min_workers = MinWorkers::Max;
        self
    }

    /// Upper bound on concurrent workers. Defaults to `max(cpus − 1, 1)`.
    pub fn with_max_workers(mut self, count: usize) -> Self {
        self.max_workers = Some(count);
        self
    }

    /// Bound on queued (not yet dispatched) tasks. Defaults to unbounded.
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = Some(size);
        self
    }

    pub fn with_worker_kind(mut self, kind: WorkerKind) -> Self {
        self.worker_kind = kind;
        self
    }

    /// Worker binary for process workers. Without it, process workers
    /// re-execute the current binary.
    pub fn with_worker_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_script = Some(path.into());
        self
    }

    /// Extra argv for process workers.
    pub fn with_fork_args(mut self, args: Vec<String>) -> Self {
        self.fork_args = args;
        self
    }

    /// Extra environment variable for process workers.
    pub fn with_fork_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fork_envs.push((key.into(), value.into()));
        self
    }

    /// Stack size for thread workers.
    pub fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = Some(bytes);
        self
    }

    /// Bound on teardown and cleanup acknowledgement. Defaults to 1000 ms.
    pub fn with_worker_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.worker_terminate_timeout = Some(timeout);
        self
    }

    /// Allocate a debug port per process worker, exported to the child via
    /// the `OFFLOAD_DEBUG_PORT` environment variable.
    pub fn with_debug_ports(mut self, enabled: bool) -> Self {
        self.debug_ports = enabled;
        self
    }

    /// First port the allocator hands out. Defaults to 43210.
    pub fn with_debug_port_start(mut self, port: u16) -> Self {
        self.debug_port_start = Some(port);
        self
    }

    /// Forward worker stderr lines to per-task `on` callbacks instead of
    /// the controller's log.
    pub fn with_emit_std_streams(mut self, enabled: bool) -> Self {
        self.emit_std_streams = enabled;
        self
    }

    /// Method registry executed by thread workers.
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    /// Hook to adjust spawn parameters before each process worker starts.
    pub fn with_on_spawn(mut self, hook: impl Fn(&mut SpawnOptions) + Send + Sync + 'static) -> Self {
        self.on_spawn = Some(Arc::new(hook));
        self
    }

    /// Hook invoked after each worker is created.
    pub fn with_on_worker_created(
        mut self,
        hook: impl Fn(&WorkerInfo) + Send + Sync + 'static,
    ) -> Self {
        self.on_worker_created = Some(Arc::new(hook));
        self
    }

    /// Hook invoked after each worker has gone away (teardown or crash).
    pub fn with_on_worker_terminated(
        mut self,
        hook: impl Fn(&WorkerInfo) + Send + Sync + 'static,
    ) -> Self {
        self.on_worker_terminated = Some(Arc::new(hook));
        self
    }

    pub(crate) fn terminate_timeout(&self) -> Duration {
        self.worker_terminate_timeout
            .unwrap_or(DEFAULT_WORKER_TERMINATE_TIMEOUT)
    }

    pub(crate) fn debug_port_start(&self) -> u16 {
        self.debug_port_start.unwrap_or(DEFAULT_DEBUG_PORT_START)
    }

    /// Validate and resolve sizing and worker kind.
    pub(crate) fn resolve(&self) -> Result<ResolvedConfig, PoolError> {
        let max_workers = match self.max_workers {
            Some(0) => {
                return Err(PoolError::Config(
                    "max_workers must be at least 1".to_string(),
                ));
            }
            Some(n) => n,
            None => environment::default_pool_size(),
        };
        let min_workers = match self.min_workers {
            MinWorkers::None => 0,
            MinWorkers::Count(n) => n,
            MinWorkers::Max => max_workers,
        };
        // min_workers wins when the two bounds conflict.
        let max_workers = max_workers.max(min_workers);

        let kind = match self.worker_kind {
            WorkerKind::Auto | WorkerKind::Thread => WorkerKind::Thread,
            WorkerKind::Process => WorkerKind::Process,
        };
        if kind == WorkerKind::Thread && self.registry.is_none() {
            return Err(PoolError::Config(
                "thread workers require a registry (see PoolConfig::with_registry)".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            min_workers,
            max_workers,
            kind,
        })
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("min_workers", &self.min_workers)
            .field("max_workers", &self.max_workers)
            .field("max_queue_size", &self.max_queue_size)
            .field("worker_kind", &self.worker_kind)
            .field("worker_script", &self.worker_script)
            .field("worker_terminate_timeout", &self.terminate_timeout())
            .field("debug_ports", &self.debug_ports)
            .field("emit_std_streams", &self.emit_std_streams)
            .finish_non_exhaustive()
    }
}

/// Sizing and kind after validation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResolvedConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub kind: WorkerKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_registry(config: PoolConfig) -> PoolConfig {
        config.with_registry(Registry::new())
    }

    #[test]
    fn test_defaults() {
        let resolved = with_registry(PoolConfig::new()).resolve().unwrap();
        assert_eq!(resolved.min_workers, 0);
        assert_eq!(resolved.max_workers, environment::default_pool_size());
        assert_eq!(resolved.kind, WorkerKind::Thread);
    }

    #[test]
    fn test_min_workers_max() {
        let resolved = with_registry(PoolConfig::new().with_max_workers(3).with_min_workers_max())
            .resolve()
            .unwrap();
        assert_eq!(resolved.min_workers, 3);
        assert_eq!(resolved.max_workers, 3);
    }

    #[test]
    fn test_min_raises_max() {
        let resolved = with_registry(PoolConfig::new().with_max_workers(2).with_min_workers(5))
            .resolve()
            .unwrap();
        assert_eq!(resolved.min_workers, 5);
        assert_eq!(resolved.max_workers, 5);
    }

    #[test]
    fn test_zero_max_workers_rejected() {
        let err = with_registry(PoolConfig::new().with_max_workers(0))
            .resolve()
            .unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
    }

    #[test]
    fn test_thread_kind_requires_registry() {
        let err = PoolConfig::new().resolve().unwrap_err();
        assert!(err.to_string().contains("registry"));
    }

    #[test]
    fn test_process_kind_needs_no_registry() {
        let resolved = PoolConfig::new()
            .with_worker_kind(WorkerKind::Process)
            .resolve()
            .unwrap();
        assert_eq!(resolved.kind, WorkerKind::Process);
    }

    #[test]
    fn test_worker_kind_from_str() {
        assert_eq!("auto".parse::<WorkerKind>().unwrap(), WorkerKind::Auto);
        assert_eq!("thread".parse::<WorkerKind>().unwrap(), WorkerKind::Thread);
        assert_eq!(
            "process".parse::<WorkerKind>().unwrap(),
            WorkerKind::Process
        );
        assert!("web".parse::<WorkerKind>().is_err());
        assert!("fiber".parse::<WorkerKind>().is_err());
    }
}
