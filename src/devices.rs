use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use nix::mount::{mount, MsFlags};
use nix::sys::stat::{mknod, Mode, SFlag};

use crate::error::{Error, Result};

const REPLICATED_DEVICES: &[&str] = &["null", "zero", "full", "random", "urandom", "tty", "ptmx"];

pub fn provision_devices(rootfs: &Path) -> Result<()> {
    let _umask = UmaskGuard::set(Mode::empty());
    for name in REPLICATED_DEVICES {
        let host_path = Path::new("/dev").join(name);
        let meta = match nix::sys::stat::stat(&host_path) {
            Ok(m) => m,
            Err(nix::errno::Errno::ENOENT) => {
                tracing::debug!(device = name, "host device missing, skipping");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let file_type = std::fs::symlink_metadata(&host_path)?.file_type();
        if !(file_type.is_char_device() || file_type.is_block_device()) {
            return Err(Error::Setup(format!(
                "/dev/{name} on host is not a device special file"
            )));
        }
        let kind = if file_type.is_char_device() {
            SFlag::S_IFCHR
        } else {
            SFlag::S_IFBLK
        };
        let container_path = rootfs.join("dev").join(name);
        match mknod(
            &container_path,
            kind,
            Mode::from_bits_truncate(meta.st_mode),
            meta.st_rdev,
        ) {
            Ok(()) => {}
            Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

pub fn setup_console(rootfs: &Path, pty_slave_path: &Path) -> Result<()> {
    let console = rootfs.join("dev/console");
    match mknod(
        &console,
        SFlag::S_IFCHR,
        Mode::from_bits_truncate(0o600),
        0,
    ) {
        Ok(()) => {}
        Err(nix::errno::Errno::EEXIST) => {}
        Err(e) => return Err(e.into()),
    }
    mount(
        Some(pty_slave_path),
        &console,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )?;
    Ok(())
}

struct UmaskGuard(Mode);

impl UmaskGuard {
    fn set(mode: Mode) -> Self {
        Self(nix::sys::stat::umask(mode))
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        let _ = nix::sys::stat::umask(self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replicated_devices_list_is_stable() {
        assert_eq!(
            REPLICATED_DEVICES,
            &["null", "zero", "full", "random", "urandom", "tty", "ptmx"]
        );
    }
}
