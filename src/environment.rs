//! Process environment helpers for pool sizing and worker detection.

/// Environment variable that marks a spawned process as a worker child.
///
/// Process pools set this on their children; `worker::run_if_worker` checks
/// it at host startup to decide whether to enter the worker loop.
pub const WORKER_ENV: &str = "OFFLOAD_WORKER";

/// Environment variable carrying the allocated debug port, when enabled.
pub const DEBUG_PORT_ENV: &str = "OFFLOAD_DEBUG_PORT";

/// Number of logical CPUs available to this process.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Default `max_workers` for a pool: one core is left for the controller.
pub fn default_pool_size() -> usize {
    cpu_count().saturating_sub(1).max(1)
}

/// Whether the current process was spawned as a worker child.
pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

/// Whether this process is the controlling side (not a spawned worker).
pub fn is_main_process() -> bool {
    !is_worker_process()
}

/// Operating system the pool is running on, for callers sizing their own
/// pools per platform.
pub fn platform() -> &'static str {
    std::env::consts::OS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_count_positive() {
        assert!(cpu_count() >= 1);
    }

    #[test]
    fn test_default_pool_size() {
        let size = default_pool_size();
        assert!(size >= 1);
        assert!(size <= cpu_count());
    }

    #[test]
    fn test_controller_is_main_process() {
        // The test harness is never spawned with the worker marker.
        assert!(is_main_process());
        assert!(!is_worker_process());
        assert!(!platform().is_empty());
    }
}
