//! Process-backed worker endpoints.
//!
//! Spawns the worker binary (or re-executes the current one) with piped
//! stdio: stdout carries protocol messages, stderr is forwarded line by
//! line for logging or event delivery. Teardown escalates from the wire
//! terminate signal to SIGTERM, then SIGKILL.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::config::SpawnOptions;
use crate::environment::{DEBUG_PORT_ENV, WORKER_ENV};
use crate::error::Result;
use crate::protocol::terminate_line;
use crate::signals::{TerminationReason, analyze_exit_status};

use super::{InboundFrame, OutboundFrame, SpawnedEndpoint};

/// Grace period between SIGTERM and SIGKILL during a forced stop.
const SIGTERM_GRACE: Duration = Duration::from_millis(100);

/// Spawn a worker subprocess and wire up its IPC channels.
pub(crate) fn spawn(opts: &SpawnOptions, worker_id: usize) -> Result<SpawnedEndpoint> {
    let program = match &opts.script {
        Some(path) => path.clone(),
        None => std::env::current_exe()?,
    };

    let mut cmd = Command::new(&program);
    cmd.args(&opts.args);
    cmd.env(WORKER_ENV, "1");
    for (key, value) in &opts.envs {
        cmd.env(key, value);
    }
    if let Some(port) = opts.debug_port {
        cmd.env(DEBUG_PORT_ENV, port.to_string());
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let pid = child.id();
    tracing::debug!(worker_id, pid, program = %program.display(), "spawned worker process");

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("child stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("child stderr not captured"))?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<InboundFrame>();
    let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();

    // Writer: outbound frames to the child's stdin.
    tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(frame) = out_rx.recv().await {
            let line = match frame {
                OutboundFrame::Request(req, native) => {
                    if native.is_some() {
                        tracing::warn!(
                            worker_id,
                            "dropping native callable: process workers cannot receive closures"
                        );
                    }
                    req.to_line()
                }
                OutboundFrame::Terminate => terminate_line(),
            };
            if stdin.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
    });

    // Protocol reader: stdout lines become inbound messages.
    let (stdout_done_tx, stdout_done_rx) = tokio::sync::oneshot::channel::<()>();
    {
        let in_tx = in_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str(&line) {
                    Ok(value) => {
                        if in_tx.send(InboundFrame::Message(value)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(worker_id, error = %e, "discarding malformed worker output");
                    }
                }
            }
            let _ = stdout_done_tx.send(());
        });
    }

    // Stderr pump.
    {
        let in_tx = in_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if in_tx.send(InboundFrame::Stderr(line)).is_err() {
                    break;
                }
            }
        });
    }

    // Supervisor: owns the child, reports the exit reason last. The stdout
    // reader is drained first so buffered terminal responses are never
    // outrun by the exit frame.
    tokio::spawn(async move {
        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = kill_rx.recv() => None,
        };
        let reason = match waited {
            Some(Ok(status)) => analyze_exit_status(status),
            Some(Err(_)) => TerminationReason::Unknown,
            None => terminate_then_kill(&mut child).await,
        };
        let _ = tokio::time::timeout(Duration::from_secs(1), stdout_done_rx).await;
        let _ = in_tx.send(InboundFrame::Exit(reason));
    });

    Ok(SpawnedEndpoint {
        tx: out_tx,
        rx: in_rx,
        kill: kill_tx,
        pid,
    })
}

/// Forced stop ladder: SIGTERM, brief wait, then SIGKILL.
async fn terminate_then_kill(child: &mut Child) -> TerminationReason {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
        if let Ok(Ok(status)) = tokio::time::timeout(SIGTERM_GRACE, child.wait()).await {
            return analyze_exit_status(status);
        }
    }
    let _ = child.start_kill();
    match child.wait().await {
        Ok(status) => analyze_exit_status(status),
        Err(_) => TerminationReason::Unknown,
    }
}
