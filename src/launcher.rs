use crate::cgroup::CgroupPlacement;
use crate::config::ContainerConfig;
use crate::error::Result;
use crate::network;
use crate::pty::RawModeGuard;
use crate::relay::{self, RelayExit};
use crate::spawn;
use crate::supervise::{self, ExitOutcome};

pub fn run(config: &ContainerConfig) -> Result<ExitOutcome> {
    loop {
        match run_once(config)? {
            ExitOutcome::Reboot => {
                tracing::info!("rebooting container with the same configuration");
                continue;
            }
            outcome => return Ok(outcome),
        }
    }
}

fn run_once(config: &ContainerConfig) -> Result<ExitOutcome> {
    // Cgroup is created and opened under the launcher's own pid so the clone
    // can place the child into it atomically via `CLONE_INTO_CGROUP`.
    let mut placement = CgroupPlacement::prepare()?;

    let raw_guard = RawModeGuard::enable()?;
    let signal_fd = relay::block_signals()?;

    let mut setup = spawn::spawn(config, raw_guard, placement.primary_fd())?;
    let child_pid = setup.child.as_raw();

    placement.attach_extras(child_pid, &config.extra_controllers);

    if config.private_network {
        network::setup_veth_pairs(&config.veth_pairs, child_pid)?;
    }

    setup.release_gate();

    let _kmsg_fd = setup.receive_kmsg_fd()?;
    setup.wait_child_outcome()?;

    let relay_exit = relay::run(&setup.pty_master, signal_fd, child_pid, config.boot_mode)?;
    drop(setup.raw_guard);

    let outcome = match relay_exit {
        RelayExit::ChildExited => supervise::wait_and_classify(child_pid)?,
        RelayExit::UserShutdown => {
            let _ = nix::sys::signal::kill(child_pid, nix::sys::signal::Signal::SIGTERM);
            supervise::wait_and_classify(child_pid)?
        }
    };

    if let Err(e) = placement.teardown() {
        tracing::warn!(%e, "cgroup teardown failed");
    }

    Ok(outcome)
}
