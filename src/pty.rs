use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;

use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt, OpenptFlags};
use nix::sys::termios::{self, SetArg, Termios};

use crate::error::Result;

pub struct MasterPty {
    pub master: OwnedFd,
    pub slave_path: PathBuf,
}

pub fn allocate() -> Result<MasterPty> {
    let master = posix_openpt(OpenptFlags::O_RDWR | OpenptFlags::O_NOCTTY)?;
    grantpt(&master)?;
    unlockpt(&master)?;
    let slave_name = unsafe { ptsname_r(&master)? };
    Ok(MasterPty {
        master: master.into(),
        slave_path: PathBuf::from(slave_name),
    })
}

// Best-effort: a caller without a controlling terminal (a pipe, a file)
// simply leaves the pty at its default size.
pub fn propagate_window_size(master: &OwnedFd) {
    let stdin = std::io::stdin();
    match termios::tcgetwinsize(&stdin) {
        Ok(size) => {
            if let Err(e) = termios::tcsetwinsize(master, size) {
                tracing::debug!(%e, "failed to propagate window size to pty master");
            }
        }
        Err(e) => {
            tracing::debug!(%e, "caller has no controlling terminal, using default pty size");
        }
    }
}

// Snapshots the caller's stdin termios and switches it to raw mode,
// restoring the original settings on `Drop` unconditionally, including on
// panic unwind.
pub struct RawModeGuard {
    original: Option<Termios>,
}

impl RawModeGuard {
    pub fn enable() -> Result<Self> {
        let stdin = std::io::stdin();
        let original = match termios::tcgetattr(&stdin) {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!(%e, "stdin is not a terminal, skipping raw mode");
                return Ok(Self { original: None });
            }
        };
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw)?;
        Ok(Self {
            original: Some(original),
        })
    }

    // Reapplied inside the child to its inherited stdin before it reopens
    // /dev/console.
    pub fn snapshot(&self) -> Option<&Termios> {
        self.original.as_ref()
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Some(original) = &self.original {
            let stdin = std::io::stdin();
            let _ = termios::tcsetattr(&stdin, SetArg::TCSANOW, original);
        }
    }
}

pub fn reapply_to_fd<Fd: AsFd>(fd: &Fd, termios: &Termios) -> Result<()> {
    nix::sys::termios::tcsetattr(fd, SetArg::TCSANOW, termios)?;
    Ok(())
}
