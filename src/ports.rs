//! Process-wide debug-port allocator for worker endpoints.
//!
//! Ports are handed to process workers through an environment variable so
//! that debuggers or diagnostic listeners inside a worker get a stable,
//! non-conflicting port. The allocator is a process-wide singleton; pools
//! release ports as their workers go away.

use std::collections::BTreeSet;
use std::sync::{Mutex, OnceLock};

static ALLOCATED: OnceLock<Mutex<BTreeSet<u16>>> = OnceLock::new();

fn allocated() -> &'static Mutex<BTreeSet<u16>> {
    ALLOCATED.get_or_init(|| Mutex::new(BTreeSet::new()))
}

/// Reserve the lowest free port at or above `start`.
pub(crate) fn acquire(start: u16) -> u16 {
    let mut used = allocated().lock().expect("debug port allocator poisoned");
    let mut port = start;
    while used.contains(&port) {
        port += 1;
    }
    used.insert(port);
    port
}

/// Return a previously acquired port to the allocator.
pub(crate) fn release(port: u16) {
    let mut used = allocated().lock().expect("debug port allocator poisoned");
    used.remove(&port);
}
