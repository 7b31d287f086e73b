//! Default worker binary.
//!
//! Serves only the built-in methods; point a process pool at it with
//! `PoolConfig::with_worker_script` when the host binary cannot take the
//! `run_if_worker` handshake itself.

fn main() {
    offload::worker::run_worker(offload::Registry::new());
}
