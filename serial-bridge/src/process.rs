//! OS process primitives: exit classification, signalling and waiting.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::record::BridgeStatus;

/// How a bridge process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited with a status code
    Code(i32),
    /// Killed by a signal
    Signal(i32),
    /// Never ran, or its status could not be collected
    Unknown,
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            ExitOutcome::Code(code)
        } else if let Some(sig) = status.signal() {
            ExitOutcome::Signal(sig)
        } else {
            ExitOutcome::Unknown
        }
    }

    /// Exit code with the shell convention of `128 + n` for signal `n`.
    pub fn exit_code(self) -> Option<i32> {
        match self {
            ExitOutcome::Code(code) => Some(code),
            ExitOutcome::Signal(sig) => Some(128 + sig),
            ExitOutcome::Unknown => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == ExitOutcome::Code(0)
    }

    /// Terminal status for a bridge that was `current` when it ended.
    ///
    /// Any exit after a requested stop counts as `Stopped`.
    pub fn terminal_status(self, current: BridgeStatus) -> BridgeStatus {
        if current == BridgeStatus::Stopping || self.is_success() {
            BridgeStatus::Stopped
        } else {
            BridgeStatus::Failed
        }
    }
}

/// Receiving side of a bridge's exit channel; `Some` once the child was reaped.
pub(crate) type ExitWatch = watch::Receiver<Option<ExitOutcome>>;

/// Send `sig` to the process group led by `pid`.
pub(crate) fn signal_group(pid: u32, sig: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        warn!("PID {} out of range, not sending {}", pid, sig);
        return;
    };
    match signal::killpg(Pid::from_raw(raw), sig) {
        Ok(()) => debug!("Sent {} to process group {}", sig, pid),
        Err(nix::errno::Errno::ESRCH) => debug!("Process group {} already gone", pid),
        Err(e) => warn!("Failed to send {} to process group {}: {}", sig, pid, e),
    }
}

/// Wait until the exit channel reports an outcome.
///
/// Returns `None` if the channel closed without one.
pub(crate) async fn wait_for_exit(exited: &mut ExitWatch) -> Option<ExitOutcome> {
    match exited.wait_for(Option::is_some).await {
        Ok(outcome) => *outcome,
        Err(_) => None,
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL and wait up to `kill_timeout`.
///
/// Cancelling `ct` cuts the grace period short; the process is still killed.
pub(crate) async fn terminate(
    pid: u32,
    mut exited: ExitWatch,
    grace: Duration,
    kill_timeout: Duration,
    ct: &CancellationToken,
) -> ExitOutcome {
    if let Some(outcome) = *exited.borrow() {
        return outcome;
    }

    signal_group(pid, Signal::SIGTERM);

    let graceful = tokio::select! {
        outcome = wait_for_exit(&mut exited) => outcome,
        _ = tokio::time::sleep(grace) => None,
        _ = ct.cancelled() => {
            debug!("Stop of PID {} cancelled, skipping the rest of the grace period", pid);
            None
        }
    };
    if let Some(outcome) = graceful {
        return outcome;
    }

    warn!(
        "Process {} did not exit within {:?}, sending SIGKILL to its process group",
        pid, grace
    );
    signal_group(pid, Signal::SIGKILL);

    match tokio::time::timeout(kill_timeout, wait_for_exit(&mut exited)).await {
        Ok(Some(outcome)) => outcome,
        Ok(None) => ExitOutcome::Unknown,
        Err(_) => {
            warn!(
                "Process {} still running {:?} after SIGKILL, giving up",
                pid, kill_timeout
            );
            ExitOutcome::Unknown
        }
    }
}
