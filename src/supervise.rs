use nix::sys::signal::Signal;
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    ChildStatus(i32),
    Reboot,
    ShutDown,
    Failure,
}

pub fn wait_and_classify(child: Pid) -> Result<ExitOutcome> {
    let status = waitid(Id::Pid(child), WaitPidFlag::WEXITED)?;
    Ok(match status {
        WaitStatus::Exited(_, 0) => ExitOutcome::Success,
        WaitStatus::Exited(_, code) => {
            tracing::warn!(code, "container payload exited with non-zero status");
            ExitOutcome::ChildStatus(code)
        }
        WaitStatus::Signaled(_, Signal::SIGINT, _) => ExitOutcome::ShutDown,
        WaitStatus::Signaled(_, Signal::SIGHUP, _) => {
            tracing::info!("container requested reboot");
            ExitOutcome::Reboot
        }
        WaitStatus::Signaled(_, sig, _) => {
            tracing::warn!(?sig, "container payload was killed by signal");
            ExitOutcome::Failure
        }
        other => {
            tracing::warn!(?other, "unexpected wait status");
            ExitOutcome::Failure
        }
    })
}

pub fn exit_code(outcome: ExitOutcome) -> i32 {
    match outcome {
        ExitOutcome::Success | ExitOutcome::ShutDown => 0,
        ExitOutcome::ChildStatus(code) => code,
        ExitOutcome::Reboot => 0,
        ExitOutcome::Failure => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_shutdown_exit_zero() {
        assert_eq!(exit_code(ExitOutcome::Success), 0);
        assert_eq!(exit_code(ExitOutcome::ShutDown), 0);
    }

    #[test]
    fn failure_exits_nonzero() {
        assert_eq!(exit_code(ExitOutcome::Failure), 1);
    }

    #[test]
    fn child_status_is_surfaced_verbatim() {
        assert_eq!(exit_code(ExitOutcome::ChildStatus(42)), 42);
    }
}
