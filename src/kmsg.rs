use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::Path;

use nix::fcntl::OFlag;
use nix::mount::{mount, MsFlags};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use crate::error::{Error, Result};

pub fn setup_kmsg(rootfs: &Path, socket: &OwnedFd) -> Result<()> {
    let kmsg_path = rootfs.join("dev/kmsg");
    let proc_kmsg_path = rootfs.join("proc/kmsg");

    mkfifo(&kmsg_path, Mode::from_bits_truncate(0o600))?;

    mount(
        Some(&kmsg_path),
        &proc_kmsg_path,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )?;

    let read_raw_fd: RawFd = nix::fcntl::open(
        &kmsg_path,
        OFlag::O_RDWR | OFlag::O_NONBLOCK,
        Mode::empty(),
    )?;
    let read_fd: OwnedFd = unsafe { crate::ipc::owned_fd_from_raw(read_raw_fd) };

    let iov_buf = [0u8];
    let iov = [std::io::IoSlice::new(&iov_buf)];
    let borrowed: BorrowedFd<'_> = read_fd.as_fd();
    let fds = [borrowed];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(
        socket.as_raw_fd(),
        &iov,
        &cmsg,
        MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL,
        None,
    )?;
    drop(read_fd);

    std::fs::remove_file(&kmsg_path)?;
    Ok(())
}

pub fn receive_kmsg_fd(socket: &OwnedFd) -> Result<OwnedFd> {
    let mut cmsg_buf = nix::cmsg_space!(RawFd);
    let mut iov_buf = [0u8; 1];
    let iov = [std::io::IoSliceMut::new(&mut iov_buf)];
    let msg = recvmsg::<()>(
        socket.as_raw_fd(),
        &iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )?;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(fd) = fds.into_iter().next() {
                return Ok(unsafe { crate::ipc::owned_fd_from_raw(fd) });
            }
        }
    }
    Err(Error::Setup(
        "no kmsg descriptor received over socketpair".into(),
    ))
}
