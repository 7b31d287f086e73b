//! Worker endpoints: the isolated execution contexts behind each handle.
//!
//! An endpoint exposes one outbound frame channel, one inbound frame
//! channel, and a kill switch. Process endpoints speak JSON lines over the
//! child's stdio; thread endpoints hand frames straight to the worker loop
//! over in-memory channels.

pub(crate) mod process;
pub(crate) mod thread;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::future::NativeCall;
use crate::protocol::Request;
use crate::signals::TerminationReason;

/// Frame from controller to worker.
pub(crate) enum OutboundFrame {
    /// A request envelope, optionally carrying a native callable (honored
    /// by thread endpoints only).
    Request(Request, Option<NativeCall>),
    /// The bare terminate signal.
    Terminate,
}

/// Frame from worker to controller.
pub(crate) enum InboundFrame {
    /// A protocol message (already parsed JSON).
    Message(Value),
    /// One line of worker stderr.
    Stderr(String),
    /// The endpoint is gone. Always the final frame.
    Exit(TerminationReason),
}

/// A spawned endpoint, ready to be wired into a worker handle.
pub(crate) struct SpawnedEndpoint {
    pub tx: mpsc::UnboundedSender<OutboundFrame>,
    pub rx: mpsc::UnboundedReceiver<InboundFrame>,
    /// Fire-and-forget kill switch; the endpoint reports back through an
    /// `Exit` frame.
    pub kill: mpsc::UnboundedSender<()>,
    pub pid: Option<u32>,
}
