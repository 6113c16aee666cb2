use std::path::{Path, PathBuf};

use nix::mount::{mount, MsFlags};

use crate::config::JournalLink;
use crate::error::Result;

pub fn setup_timezone(rootfs: &Path) {
    let host_localtime = match std::fs::read_link("/etc/localtime") {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(%e, "host /etc/localtime is not a symlink, leaving container as-is");
            return;
        }
    };
    let host_str = host_localtime.to_string_lossy();
    let marker = "zoneinfo/";
    let Some(idx) = host_str.find(marker) else {
        tracing::warn!(target = %host_str, "cannot determine zone name from host localtime link");
        return;
    };
    let zone = &host_str[idx + marker.len()..];
    let container_zonefile = rootfs.join("usr/share/zoneinfo").join(zone);
    if !container_zonefile.exists() {
        tracing::warn!(zone, "container has no matching zoneinfo entry, skipping");
        return;
    }
    let container_localtime = rootfs.join("etc/localtime");
    let _ = std::fs::remove_file(&container_localtime);
    let relative = PathBuf::from("../usr/share/zoneinfo").join(zone);
    if let Err(e) = std::os::unix::fs::symlink(&relative, &container_localtime) {
        tracing::warn!(%e, "failed to link container timezone");
    }
}

pub fn setup_resolv_conf(rootfs: &Path, private_network: bool, has_veth: bool) {
    if private_network && !has_veth {
        tracing::debug!("private network with no veth pair, skipping resolv.conf bind");
        return;
    }
    let target = rootfs.join("etc/resolv.conf");
    if let Err(e) = mount(
        Some("/etc/resolv.conf"),
        &target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    ) {
        tracing::warn!(%e, "failed to bind-mount resolv.conf");
    }
    let _ = mount(
        None::<&str>,
        &target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    );
}

pub fn setup_boot_id(rootfs: &Path) -> Result<()> {
    let boot_id = uuid::Uuid::new_v4();
    let scratch = rootfs.join("dev/.boot_id");
    std::fs::write(&scratch, boot_id.to_string())?;
    let target = rootfs.join("proc/sys/kernel/random/boot_id");
    mount(
        Some(&scratch),
        &target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )?;
    std::fs::remove_file(&scratch)?;
    Ok(())
}

fn read_machine_id(rootfs: &Path) -> Option<uuid::Uuid> {
    let raw = std::fs::read_to_string(rootfs.join("etc/machine-id")).ok()?;
    let trimmed = raw.trim();
    if trimmed.len() != 32 {
        return None;
    }
    let hyphenated = format!(
        "{}-{}-{}-{}-{}",
        &trimmed[0..8],
        &trimmed[8..12],
        &trimmed[12..16],
        &trimmed[16..20],
        &trimmed[20..32]
    );
    uuid::Uuid::parse_str(&hyphenated).ok()
}

fn is_mount_point(path: &Path) -> bool {
    let parent = match path.parent() {
        Some(p) => p,
        None => return false,
    };
    match (nix::sys::stat::stat(path), nix::sys::stat::stat(parent)) {
        (Ok(a), Ok(b)) => a.st_dev != b.st_dev,
        _ => false,
    }
}

pub fn setup_journal_link(rootfs: &Path, mode: JournalLink) -> Result<()> {
    if mode == JournalLink::None {
        return Ok(());
    }
    let Some(machine_id) = read_machine_id(rootfs) else {
        return if mode == JournalLink::Auto {
            Ok(())
        } else {
            Err(crate::error::Error::Setup(
                "container has no valid /etc/machine-id".into(),
            ))
        };
    };
    let id = machine_id.simple().to_string();
    let host_dir = PathBuf::from("/var/log/journal").join(&id);
    let guest_dir = rootfs.join("var/log/journal").join(&id);

    if mode != JournalLink::Auto && (is_mount_point(&host_dir) || is_mount_point(&guest_dir)) {
        return Err(crate::error::Error::Setup(
            "journal directory is already a mount point".into(),
        ));
    }

    match mode {
        JournalLink::None => unreachable!(),
        JournalLink::Auto => {
            if host_dir.is_dir() {
                std::fs::create_dir_all(&guest_dir)?;
                bind_journal(&host_dir, &guest_dir)?;
            } else if let Ok(target) = std::fs::read_link(&host_dir) {
                if target == guest_dir {
                    std::fs::create_dir_all(&guest_dir)?;
                }
            }
        }
        JournalLink::Host => {
            if guest_dir.exists() && std::fs::read_dir(&guest_dir)?.next().is_some() {
                return Err(crate::error::Error::Setup(
                    "guest journal directory must be empty for host link mode".into(),
                ));
            }
            std::fs::create_dir_all(&host_dir)?;
            std::fs::create_dir_all(&guest_dir)?;
            bind_journal(&host_dir, &guest_dir)?;
        }
        JournalLink::Guest => {
            let _ = std::fs::remove_dir_all(&host_dir);
            let _ = std::fs::remove_file(&host_dir);
            std::fs::create_dir_all(&guest_dir)?;
            std::os::unix::fs::symlink(&guest_dir, &host_dir)?;
        }
    }
    Ok(())
}

fn bind_journal(host_dir: &Path, guest_dir: &Path) -> Result<()> {
    mount(
        Some(host_dir),
        guest_dir,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_must_be_32_hex_chars() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(dir.path().join("etc/machine-id"), "short\n").unwrap();
        assert!(read_machine_id(dir.path()).is_none());
    }

    #[test]
    fn machine_id_parses_valid_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(
            dir.path().join("etc/machine-id"),
            "0123456789abcdef0123456789abcdef\n",
        )
        .unwrap();
        assert!(read_machine_id(dir.path()).is_some());
    }

    #[test]
    fn none_mode_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        assert!(setup_journal_link(dir.path(), JournalLink::None).is_ok());
    }
}
