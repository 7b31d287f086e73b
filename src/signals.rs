//! Crash analysis for worker endpoints.
//!
//! Classifies how an endpoint died so crash errors can say more than
//! "the worker is gone".

use std::fmt;
use std::process::ExitStatus;

use nix::sys::signal::Signal;

/// Reason why a worker endpoint terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(i32),
    /// Likely out of memory (SIGKILL, usually from the OOM killer).
    OutOfMemory,
    /// Stack overflow (SIGSEGV on Linux, SIGBUS on macOS).
    StackOverflow,
    /// In-process worker whose channels were torn down.
    ChannelClosed,
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(sig) => match Signal::try_from(*sig) {
                Ok(name) => write!(f, "killed by signal {:?}", name),
                Err(_) => write!(f, "killed by signal {}", sig),
            },
            Self::OutOfMemory => write!(f, "out of memory (SIGKILL)"),
            Self::StackOverflow => write!(f, "stack overflow"),
            Self::ChannelClosed => write!(f, "worker channel closed"),
            Self::Unknown => write!(f, "unknown reason"),
        }
    }
}

/// Analyze an `ExitStatus` to determine the termination reason.
pub fn analyze_exit_status(status: ExitStatus) -> TerminationReason {
    if let Some(code) = status.code() {
        return TerminationReason::Exited(code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return match sig {
                s if s == Signal::SIGKILL as i32 => TerminationReason::OutOfMemory,
                s if s == Signal::SIGSEGV as i32 => TerminationReason::StackOverflow,
                s if s == Signal::SIGBUS as i32 => TerminationReason::StackOverflow,
                other => TerminationReason::Signaled(other),
            };
        }
    }

    TerminationReason::Unknown
}
