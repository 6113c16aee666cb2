//! Small wire protocol used across the parent/child boundary created by the
//! clone in [`crate::spawn`]: a gate pipe that synchronizes "parent has
//! finished post-clone setup" with child continuation, and a result pipe
//! that lets the child report success/failure of its setup sequence back to
//! the parent before it execs the payload.
//!
//! Wire format for a result: one tag byte (0 = Ok, 1 = Err), and on error a
//! little-endian `usize` length followed by that many UTF-8 bytes.

use std::io::{Read, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::io::OwnedFd;

use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;

use crate::error::{Error, Result};

pub struct Pipe {
    rx: OwnedFd,
    tx: OwnedFd,
}

impl Pipe {
    pub fn rx(self) -> OwnedFd {
        drop(self.tx);
        self.rx
    }

    pub fn tx(self) -> OwnedFd {
        drop(self.rx);
        self.tx
    }
}

pub fn new_pipe() -> Result<Pipe> {
    let (rx, tx) = nix::unistd::pipe()?;
    Ok(Pipe { rx, tx })
}

fn as_file(fd: &OwnedFd) -> std::fs::File {
    use std::os::fd::AsRawFd;
    unsafe { std::fs::File::from_raw_fd(libc::dup(fd.as_raw_fd())) }
}

// Blocks until the peer closes its end, used to gate the child on "parent
// has finished post-clone setup".
pub fn wait_hup(rx: &OwnedFd) -> Result<()> {
    let mut buf = [0u8; 1];
    // A read of zero length signals EOF, i.e. the peer closed its write end.
    let n = as_file(rx).read(&mut buf)?;
    if n != 0 {
        return Err(Error::Other("unexpected data on gate pipe".into()));
    }
    Ok(())
}

pub fn write_result(tx: &OwnedFd, result: &std::result::Result<(), String>) -> Result<()> {
    let mut f = as_file(tx);
    match result {
        Ok(()) => f.write_all(&[0])?,
        Err(msg) => {
            f.write_all(&[1])?;
            f.write_all(&usize::to_le_bytes(msg.as_bytes().len()))?;
            f.write_all(msg.as_bytes())?;
        }
    }
    Ok(())
}

// Treats a clean EOF as success: the descriptor is CLOEXEC, so a successful
// execve closes it implicitly and the parent never sees a written byte.
pub fn read_child_outcome(rx: &OwnedFd) -> Result<std::result::Result<(), String>> {
    let mut tag = [0u8; 1];
    let n = as_file(rx).read(&mut tag)?;
    if n == 0 {
        return Ok(Ok(()));
    }
    match tag[0] {
        0 => Ok(Ok(())),
        1 => {
            let mut f = as_file(rx);
            let mut len_buf = [0u8; std::mem::size_of::<usize>()];
            f.read_exact(&mut len_buf)?;
            let len = usize::from_le_bytes(len_buf);
            let mut msg = vec![0u8; len];
            f.read_exact(&mut msg)?;
            Ok(Err(String::from_utf8_lossy(&msg).into_owned()))
        }
        _ => Err(Error::Other("corrupt result pipe".into())),
    }
}

// Drop reaps the pid so a panicking setup path never leaves a zombie behind.
pub struct OwnedPid(Option<Pid>);

impl OwnedPid {
    /// # Safety
    /// `pid` must be a child of the current process that nothing else reaps.
    pub unsafe fn from_raw(pid: Pid) -> Self {
        Self(Some(pid))
    }

    pub fn as_raw(&self) -> Pid {
        self.0.unwrap()
    }
}

impl Drop for OwnedPid {
    fn drop(&mut self) {
        if let Some(pid) = self.0.take() {
            let _ = waitpid(pid, Some(WaitPidFlag::__WALL));
        }
    }
}

pub fn exit_child<T>(result: Result<T>) -> ! {
    match result {
        Ok(_) => unsafe { libc::_exit(0) },
        Err(_) => unsafe { libc::_exit(1) },
    }
}

/// Duplicate a raw fd as an [`OwnedFd`], taking ownership of `raw`.
///
/// # Safety
/// `raw` must be a valid, open, uniquely-owned file descriptor.
pub unsafe fn owned_fd_from_raw(raw: RawFd) -> OwnedFd {
    OwnedFd::from_raw_fd(raw)
}
