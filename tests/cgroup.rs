use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use nsbox::cgroup::CgroupPlacement;

mod common;

use common::require_root_e2e;

/// Exercises the full placement lifecycle: prepare a sub-cgroup, fork a
/// child into it directly (standing in for `clone3`'s `CLONE_INTO_CGROUP`,
/// which this crate doesn't expose outside `spawn::spawn`), attach an extra
/// controller hierarchy, then tear everything down.
#[test]
fn test_cgroup_placement_lifecycle() {
    if !require_root_e2e() {
        eprintln!("skipping: set NSBOX_TEST_ROOTFS=1 and run as root under cgroup v2");
        return;
    }

    let mut placement = CgroupPlacement::prepare().unwrap();

    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            std::fs::write(
                placement.primary.mount_path().join("cgroup.procs"),
                std::process::id().to_string(),
            )
            .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(200));
            std::process::exit(0);
        }
        ForkResult::Parent { child } => {
            placement.attach_extras(child, &["pids".to_owned()]);
            match waitpid(child, None).unwrap() {
                WaitStatus::Exited(_, 0) => {}
                other => panic!("unexpected child exit: {other:?}"),
            }
            placement.teardown().unwrap();
        }
    }
}
