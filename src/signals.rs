//! Exit analysis for stopped compiler processes.
//!
//! Turns a `WaitStatus` into something loggable and classifies which
//! terminations deserve a warning.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Reason why a compiler process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal; the flag records a core dump.
    Signaled(Signal, bool),
    /// Process had not exited when the wait gave up.
    StillAlive,
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// An expected way for a stopped worker to go away: clean exit, or the
    /// SIGTERM the stop path itself sent.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Exited(0) | Self::Signaled(Signal::SIGTERM, _))
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status code {code}"),
            Self::Signaled(signal, core_dumped) => write!(
                f,
                "terminated by signal {:?}{}",
                signal,
                if *core_dumped { " (core dumped)" } else { "" }
            ),
            Self::StillAlive => write!(f, "still running"),
            Self::Unknown => write!(f, "unknown termination reason"),
        }
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, core_dumped) => {
            TerminationReason::Signaled(signal, core_dumped)
        }
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}
