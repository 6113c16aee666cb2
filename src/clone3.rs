//! Thin wrapper around the raw `clone3(2)` syscall, used instead of
//! `nix::sched::clone`/`unshare` because the combined-namespace clone needs
//! the `exit_signal` field (so the parent observes the child's death as a
//! `SIGCHLD` on its signalfd) alongside the namespace flags in one atomic
//! call.

use std::os::fd::AsRawFd;

use nix::errno::Errno;
use nix::unistd::Pid;

#[repr(C, align(8))]
#[derive(Debug, Default)]
pub(crate) struct CloneArgs {
    pub flags: u64,
    pub pidfd: u64,
    pub child_tid: u64,
    pub parent_tid: u64,
    pub exit_signal: u64,
    pub stack: u64,
    pub stack_size: u64,
    pub tls: u64,
    pub set_tid: u64,
    pub set_tid_size: u64,
    pub cgroup: u64,
}

impl CloneArgs {
    pub fn flag_newns(&mut self) {
        self.flags |= libc::CLONE_NEWNS as u64;
    }

    pub fn flag_newpid(&mut self) {
        self.flags |= libc::CLONE_NEWPID as u64;
    }

    pub fn flag_newuts(&mut self) {
        self.flags |= libc::CLONE_NEWUTS as u64;
    }

    pub fn flag_newipc(&mut self) {
        self.flags |= libc::CLONE_NEWIPC as u64;
    }

    pub fn flag_newnet(&mut self) {
        self.flags |= libc::CLONE_NEWNET as u64;
    }

    // Deliver SIGCHLD to the parent on child exit, so the relay's signalfd
    // observes termination the same way it observes SIGWINCH.
    pub fn exit_signal_sigchld(&mut self) {
        self.exit_signal = libc::SIGCHLD as u64;
    }

    // Places the new process directly into `cgroup` as part of the clone,
    // instead of racing a separate cgroup.procs write after the child
    // already exists.
    pub fn flag_into_cgroup<T: AsRawFd>(&mut self, cgroup: &T) {
        self.flags |= libc::CLONE_INTO_CGROUP as u64;
        self.cgroup = cgroup.as_raw_fd() as u64;
    }
}

pub(crate) enum CloneResult {
    Child,
    Parent { child: Pid },
}

// Safety: must be called with no other threads in the process holding
// locks the clone would duplicate into an inconsistent state in the child;
// this crate only ever clones from a single-threaded process.
pub(crate) unsafe fn clone3(cl_args: &CloneArgs) -> Result<CloneResult, Errno> {
    let res = libc::syscall(
        libc::SYS_clone3,
        cl_args as *const CloneArgs,
        core::mem::size_of::<CloneArgs>(),
    );
    Errno::result(res).map(|v| match v {
        0 => CloneResult::Child,
        v => CloneResult::Parent {
            child: Pid::from_raw(v as libc::pid_t),
        },
    })
}

