use std::collections::HashSet;
use std::fs::create_dir;

use nsbox::config::{default_capabilities, ContainerConfig, JournalLink};
use nsbox::launcher;
use nsbox::supervise::ExitOutcome;

mod common;

use common::{get_rootfs, require_root_e2e, TempDir};

fn base_config(root_dir: std::path::PathBuf, command: Vec<String>) -> ContainerConfig {
    ContainerConfig {
        root_dir,
        user: None,
        extra_controllers: Vec::new(),
        machine_uuid: None,
        private_network: false,
        veth_pairs: Vec::new(),
        read_only: false,
        boot_mode: false,
        journal_link: JournalLink::None,
        retained_caps: default_capabilities(),
        command,
    }
}

/// Launches a busybox rootfs in command mode and checks that the payload's
/// exit status round-trips through `launcher::run`.
#[test]
fn test_container_command_mode() {
    if !require_root_e2e() {
        eprintln!("skipping: set NSBOX_TEST_ROOTFS=1 and run as root under cgroup v2");
        return;
    }

    let tmpdir = TempDir::new().unwrap();
    let rootfs_dir = tmpdir.join("rootfs");
    create_dir(&rootfs_dir).unwrap();
    get_rootfs().unwrap().unpack(&rootfs_dir).unwrap();

    let config = base_config(
        rootfs_dir.clone(),
        vec![
            "/bin/sh".into(),
            "-c".into(),
            "id && cat /proc/self/cgroup && ls -al /proc/self/ns".into(),
        ],
    );

    let outcome = launcher::run(&config).unwrap();
    assert!(matches!(outcome, ExitOutcome::Success));
}

/// A payload exiting non-zero must surface that code verbatim, not get
/// coerced into a generic launch failure.
#[test]
fn test_container_nonzero_exit_surfaces() {
    if !require_root_e2e() {
        eprintln!("skipping: set NSBOX_TEST_ROOTFS=1 and run as root under cgroup v2");
        return;
    }

    let tmpdir = TempDir::new().unwrap();
    let rootfs_dir = tmpdir.join("rootfs");
    create_dir(&rootfs_dir).unwrap();
    get_rootfs().unwrap().unpack(&rootfs_dir).unwrap();

    let config = base_config(
        rootfs_dir.clone(),
        vec!["/bin/sh".into(), "-c".into(), "exit 7".into()],
    );

    let outcome = launcher::run(&config).unwrap();
    assert!(matches!(outcome, ExitOutcome::ChildStatus(7)));
}

/// `--read-only` must leave the container root mounted read-only; a write
/// attempt from inside fails even though the payload itself runs fine.
#[test]
fn test_container_read_only_root() {
    if !require_root_e2e() {
        eprintln!("skipping: set NSBOX_TEST_ROOTFS=1 and run as root under cgroup v2");
        return;
    }

    let tmpdir = TempDir::new().unwrap();
    let rootfs_dir = tmpdir.join("rootfs");
    create_dir(&rootfs_dir).unwrap();
    get_rootfs().unwrap().unpack(&rootfs_dir).unwrap();

    let mut config = base_config(
        rootfs_dir.clone(),
        vec![
            "/bin/sh".into(),
            "-c".into(),
            "touch /should-fail && exit 1 || exit 0".into(),
        ],
    );
    config.read_only = true;
    config.retained_caps = HashSet::new();

    let outcome = launcher::run(&config).unwrap();
    assert!(matches!(outcome, ExitOutcome::Success));
}
