use std::fs::create_dir_all;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::mount::{mount, MsFlags};

use crate::error::Result;

#[derive(Clone, Debug)]
pub struct MountEntry {
    pub source: Option<&'static str>,
    pub target: &'static str,
    pub fstype: Option<&'static str>,
    pub flags: MsFlags,
    pub data: Option<&'static str>,
    pub fatal: bool,
}

impl MountEntry {
    const fn new(
        source: Option<&'static str>,
        target: &'static str,
        fstype: Option<&'static str>,
        flags: MsFlags,
        data: Option<&'static str>,
        fatal: bool,
    ) -> Self {
        Self {
            source,
            target,
            fstype,
            flags,
            data,
            fatal,
        }
    }
}

pub fn standard_plan(selinux_available: bool) -> Vec<MountEntry> {
    let mut plan = vec![
        MountEntry::new(
            Some("proc"),
            "/proc",
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            None,
            true,
        ),
        MountEntry::new(
            Some("/proc/sys"),
            "/proc/sys",
            None,
            MsFlags::MS_BIND,
            None,
            false,
        ),
        MountEntry::new(
            None,
            "/proc/sys",
            None,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None,
            false,
        ),
        MountEntry::new(
            Some("sysfs"),
            "/sys",
            Some("sysfs"),
            MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            None,
            true,
        ),
        MountEntry::new(
            Some("tmpfs"),
            "/dev",
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
            Some("mode=755"),
            true,
        ),
        MountEntry::new(
            Some("/dev/pts"),
            "/dev/pts",
            None,
            MsFlags::MS_BIND,
            None,
            false,
        ),
        MountEntry::new(
            Some("tmpfs"),
            "/dev/shm",
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_STRICTATIME,
            Some("mode=1777"),
            false,
        ),
        MountEntry::new(
            Some("tmpfs"),
            "/run",
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_STRICTATIME,
            Some("mode=755"),
            false,
        ),
    ];
    if selinux_available {
        plan.push(MountEntry::new(
            Some("/sys/fs/selinux"),
            "/sys/fs/selinux",
            None,
            MsFlags::MS_BIND,
            None,
            false,
        ));
        plan.push(MountEntry::new(
            None,
            "/sys/fs/selinux",
            None,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None,
            false,
        ));
    }
    plan
}

fn is_mount_point(target: &Path) -> bool {
    let parent = match target.parent() {
        Some(p) => p,
        None => return false,
    };
    let (Ok(target_meta), Ok(parent_meta)) =
        (nix::sys::stat::stat(target), nix::sys::stat::stat(parent))
    else {
        return false;
    };
    target_meta.st_dev != parent_meta.st_dev
}

pub fn apply_plan(prefix: &Path, plan: &[MountEntry]) -> Result<()> {
    let mut first_fatal = None;
    for entry in plan {
        if let Err(err) = apply_entry(prefix, entry) {
            tracing::warn!(target = entry.target, fatal = entry.fatal, %err, "mount entry failed");
            if entry.fatal && first_fatal.is_none() {
                first_fatal = Some(err);
            }
        }
    }
    match first_fatal {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn apply_entry(prefix: &Path, entry: &MountEntry) -> Result<()> {
    let target: PathBuf = prefix.join(entry.target.trim_start_matches('/'));
    let is_remount = entry.source.is_none();
    if !is_remount && is_mount_point(&target) {
        tracing::debug!(target = %target.display(), "already a mount point, skipping");
        return Ok(());
    }
    if !is_remount {
        match create_dir_all(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
    }
    mount(
        entry.source,
        &target,
        entry.fstype,
        entry.flags,
        entry.data,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_plan_orders_proc_before_proc_sys_remount() {
        let plan = standard_plan(false);
        let proc_idx = plan.iter().position(|e| e.target == "/proc").unwrap();
        let proc_sys_bind_idx = plan
            .iter()
            .position(|e| e.target == "/proc/sys" && e.source.is_some())
            .unwrap();
        let proc_sys_remount_idx = plan
            .iter()
            .position(|e| e.target == "/proc/sys" && e.source.is_none())
            .unwrap();
        assert!(proc_idx < proc_sys_bind_idx);
        assert!(proc_sys_bind_idx < proc_sys_remount_idx);
    }

    #[test]
    fn selinux_entries_only_added_when_available() {
        assert_eq!(standard_plan(false).len(), 8);
        assert_eq!(standard_plan(true).len(), 10);
    }

    #[test]
    fn fatal_entries_are_proc_sys_and_dev() {
        let plan = standard_plan(false);
        let fatal: Vec<_> = plan.iter().filter(|e| e.fatal).map(|e| e.target).collect();
        assert_eq!(fatal, ["/proc", "/sys", "/dev"]);
    }
}
