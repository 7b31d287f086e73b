//! Thread-backed worker endpoints.
//!
//! The worker loop runs on a dedicated OS thread with its own
//! current-thread runtime; frames cross over in-memory channels. Threads
//! cannot be killed: the kill switch detaches the thread and closes its
//! channels, so a cooperative worker drains and exits while a wedged one
//! is abandoned.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::signals::TerminationReason;
use crate::worker::{Outgoing, Registry, WorkerInput, serve_channels};

use super::{InboundFrame, OutboundFrame, SpawnedEndpoint};

/// Spawn an in-process worker thread and wire up its channels.
pub(crate) fn spawn(
    registry: Arc<Registry>,
    worker_id: usize,
    stack_size: Option<usize>,
) -> Result<SpawnedEndpoint> {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<InboundFrame>();
    let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();

    let (wi_tx, wi_rx) = mpsc::unbounded_channel::<WorkerInput>();
    let (wo_tx, mut wo_rx) = mpsc::unbounded_channel::<Outgoing>();

    // Outbound bridge: frames become worker inputs.
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let input = match frame {
                OutboundFrame::Request(req, native) => WorkerInput::Request(req, native),
                OutboundFrame::Terminate => WorkerInput::Terminate,
            };
            if wi_tx.send(input).is_err() {
                break;
            }
        }
    });

    // Inbound bridge: worker output becomes message frames.
    let bridge = {
        let in_tx = in_tx.clone();
        tokio::spawn(async move {
            while let Some(out) = wo_rx.recv().await {
                match out {
                    Outgoing::Message(value) => {
                        if in_tx.send(InboundFrame::Message(value)).is_err() {
                            break;
                        }
                    }
                    Outgoing::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        })
    };

    let mut builder = std::thread::Builder::new().name(format!("offload-worker-{}", worker_id));
    if let Some(bytes) = stack_size {
        builder = builder.stack_size(bytes);
    }
    let thread = builder.spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("failed to build worker thread runtime");
        rt.block_on(serve_channels(registry, wi_rx, wo_tx));
    })?;
    tracing::debug!(worker_id, "spawned worker thread");

    // Supervisor: report exit once the loop finishes, or immediately on
    // kill (the thread itself is detached).
    tokio::spawn(async move {
        let joined = tokio::task::spawn_blocking(move || thread.join());
        tokio::select! {
            res = joined => {
                // Make sure buffered messages reach the handle before Exit.
                let _ = bridge.await;
                let reason = match res {
                    Ok(Ok(())) => TerminationReason::Exited(0),
                    _ => TerminationReason::Unknown,
                };
                let _ = in_tx.send(InboundFrame::Exit(reason));
            }
            _ = kill_rx.recv() => {
                let _ = in_tx.send(InboundFrame::Exit(TerminationReason::ChannelClosed));
            }
        }
    });

    Ok(SpawnedEndpoint {
        tx: out_tx,
        rx: in_rx,
        kill: kill_tx,
        pid: None,
    })
}
