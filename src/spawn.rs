use std::convert::Infallible;
use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::panic::catch_unwind;
use std::path::{Path, PathBuf};

use nix::fcntl::{FcntlArg, FdFlag, OFlag};
use nix::mount::{mount, MsFlags};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::stat::Mode;
use nix::sys::termios::Termios;
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
use nix::unistd::{
    chdir, chroot, dup2, execvpe, initgroups, sethostname, setresgid, setresuid, umask, Gid, Uid,
};

use crate::capabilities::apply_bounding_set;
use crate::clone3::{clone3, CloneArgs, CloneResult};
use crate::config::ContainerConfig;
use crate::error::{Error, Result};
use crate::identity;
use crate::ipc::{self, exit_child, new_pipe, OwnedPid};
use crate::kmsg;
use crate::mounts::{apply_plan, standard_plan};
use crate::network;
use crate::pty::{self, RawModeGuard};

const LAUNCHER_TAG: &str = "nsbox";
const BOOT_INIT_CANDIDATES: &[&str] = &["/sbin/init", "/usr/sbin/init", "/usr/lib/systemd/systemd"];

pub struct SpawnSetup {
    pub child: OwnedPid,
    pub pty_master: OwnedFd,
    pub raw_guard: RawModeGuard,
    gate_tx: Option<OwnedFd>,
    parent_kmsg_sock: OwnedFd,
    result_rx: OwnedFd,
}

impl SpawnSetup {
    // Releases the child from its post-clone gate wait. Must be called only
    // after veth setup has already run.
    pub fn release_gate(&mut self) {
        self.gate_tx.take();
    }

    // Blocks until the child sends its kmsg read fd over the socketpair,
    // which only happens after the gate is released.
    pub fn receive_kmsg_fd(&self) -> Result<OwnedFd> {
        kmsg::receive_kmsg_fd(&self.parent_kmsg_sock)
    }

    // Blocks until the child either reports a setup failure or execs (which
    // closes its end of the result pipe implicitly, read as a clean EOF).
    pub fn wait_child_outcome(&self) -> Result<()> {
        match ipc::read_child_outcome(&self.result_rx)? {
            Ok(()) => Ok(()),
            Err(msg) => Err(Error::Child(msg)),
        }
    }
}

// Allocates the pty and kmsg socketpair, opens the gate pipe, and clones.
// Window-size propagation and raw-mode entry are the caller's
// responsibility since they touch the caller's own stdin before any of
// this runs.
pub fn spawn(config: &ContainerConfig, raw_guard: RawModeGuard, cgroup_fd: &File) -> Result<SpawnSetup> {
    let master = pty::allocate()?;
    pty::propagate_window_size(&master.master);

    let (parent_kmsg_sock, child_kmsg_sock) = socketpair(
        AddressFamily::Unix,
        SockType::Datagram,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;

    let gate_pipe = new_pipe()?;
    let result_pipe = new_pipe()?;

    let mut clone_args = CloneArgs::default();
    clone_args.flag_newns();
    clone_args.flag_newpid();
    clone_args.flag_newuts();
    clone_args.flag_newipc();
    if config.private_network {
        clone_args.flag_newnet();
    }
    clone_args.exit_signal_sigchld();
    clone_args.flag_into_cgroup(cgroup_fd);

    let stdin_termios = raw_guard.snapshot().cloned();
    let slave_path = master.slave_path.clone();
    let config = config.clone();

    match unsafe { clone3(&clone_args) }.map_err(|e| Error::Setup(format!("clone3 failed: {e}")))? {
        CloneResult::Child => {
            let gate_rx = gate_pipe.rx();
            let result_tx = result_pipe.tx();
            let master_fd = master.master.as_raw_fd();
            let _ = catch_unwind(move || {
                exit_child(child_main(
                    &config,
                    gate_rx,
                    result_tx,
                    master_fd,
                    &slave_path,
                    child_kmsg_sock,
                    stdin_termios,
                ))
            });
            unsafe { libc::_exit(2) }
        }
        CloneResult::Parent { child } => {
            drop(child_kmsg_sock);
            let child = unsafe { OwnedPid::from_raw(child) };
            Ok(SpawnSetup {
                child,
                pty_master: master.master,
                raw_guard,
                gate_tx: Some(gate_pipe.tx()),
                parent_kmsg_sock,
                result_rx: result_pipe.rx(),
            })
        }
    }
}

// The child's entire bring-up sequence. Runs inside the cloned process;
// never returns on success since it ends in execve.
fn child_main(
    config: &ContainerConfig,
    gate_rx: OwnedFd,
    result_tx: OwnedFd,
    pty_master_fd: RawFd,
    slave_path: &Path,
    kmsg_sock: OwnedFd,
    stdin_termios: Option<Termios>,
) -> Result<Infallible> {
    // Wait for the parent to finish veth setup before continuing.
    ipc::wait_hup(&gate_rx)?;
    drop(gate_rx);
    let _ = unsafe { libc::close(pty_master_fd) };

    let outcome = run_setup(config, slave_path, &kmsg_sock, stdin_termios);
    drop(kmsg_sock);
    if let Err(e) = &outcome {
        let _ = ipc::write_result(&result_tx, &Err(e.to_string()));
        return Err(Error::Child(e.to_string()));
    }
    drop(result_tx);

    exec_payload(config)
}

fn run_setup(
    config: &ContainerConfig,
    slave_path: &Path,
    kmsg_sock: &OwnedFd,
    stdin_termios: Option<Termios>,
) -> Result<()> {
    if let Some(termios) = &stdin_termios {
        let stdin_fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(0) };
        let _ = pty::reapply_to_fd(&stdin_fd, termios);
    }
    unsafe {
        libc::close(0);
        libc::close(1);
        libc::close(2);
    }
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)?;
    let console_fd = nix::fcntl::open(slave_path, OFlag::O_RDWR, Mode::empty())?;
    if console_fd != 0 {
        return Err(Error::Setup("console did not become fd 0".into()));
    }
    dup2(0, 1)?;
    dup2(0, 2)?;

    nix::unistd::setsid()?;
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
    }

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )?;

    let root = &config.root_dir;
    mount(
        Some(root),
        root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;
    if config.read_only {
        mount(
            None::<&str>,
            root,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )?;
    }

    let selinux_available = Path::new("/sys/fs/selinux").is_dir();
    apply_plan(root, &standard_plan(selinux_available))?;
    crate::devices::provision_devices(root)?;
    crate::devices::setup_console(root, slave_path)?;
    kmsg::setup_kmsg(root, kmsg_sock)?;

    identity::setup_timezone(root);
    identity::setup_resolv_conf(root, config.private_network, !config.veth_pairs.is_empty());
    identity::setup_boot_id(root)?;
    identity::setup_journal_link(root, config.journal_link)?;

    chdir(root)?;
    mount(
        Some(root),
        "/",
        None::<&str>,
        MsFlags::MS_MOVE,
        None::<&str>,
    )?;
    chroot(".")?;
    chdir("/")?;

    umask(Mode::from_bits_truncate(0o022));
    if config.private_network {
        network::bring_up_loopback()?;
    }

    apply_bounding_set(&config.retained_caps)?;

    let resolved = resolve_user(config.user.as_deref())?;
    std::fs::create_dir_all(&resolved.home).ok();
    initgroups(&CString::new(resolved.name.as_bytes()).unwrap(), resolved.gid)?;
    setresgid(resolved.gid, resolved.gid, resolved.gid)?;
    setresuid(resolved.uid, resolved.uid, resolved.uid)?;

    match sethostname(config.hostname()) {
        Ok(()) => {}
        Err(e) => tracing::warn!(%e, "failed to set hostname, container keeps inherited name"),
    }

    Ok(())
}

struct ResolvedUser {
    uid: Uid,
    gid: Gid,
    home: PathBuf,
    name: String,
}

// Resolves `user` against the container's own /etc/passwd — this must run
// after chroot so NSS reads come from the container, not the host.
fn resolve_user(user: Option<&str>) -> Result<ResolvedUser> {
    let Some(name) = user else {
        return Ok(ResolvedUser {
            uid: Uid::from_raw(0),
            gid: Gid::from_raw(0),
            home: PathBuf::from("/root"),
            name: "root".to_owned(),
        });
    };
    let entry = nix::unistd::User::from_name(name)
        .map_err(|e| Error::Setup(format!("failed to resolve user {name}: {e}")))?
        .ok_or_else(|| Error::Setup(format!("no such user in container: {name}")))?;
    Ok(ResolvedUser {
        uid: entry.uid,
        gid: entry.gid,
        home: entry.dir,
        name: entry.name,
    })
}

fn build_environment(config: &ContainerConfig, home: &Path, user: &str) -> Vec<String> {
    let mut env = vec![
        "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_owned(),
        format!("container={LAUNCHER_TAG}"),
        format!("HOME={}", home.display()),
        format!("USER={user}"),
        format!("LOGNAME={user}"),
    ];
    if let Ok(term) = std::env::var("TERM") {
        env.push(format!("TERM={term}"));
    }
    if let Some(uuid) = config.machine_uuid {
        env.push(format!("container_uuid={uuid}"));
    }
    if let Ok(listen_fds) = std::env::var("LISTEN_FDS") {
        if let Ok(n) = listen_fds.parse::<i32>() {
            for fd in 3..3 + n {
                let _ = nix::fcntl::fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()));
            }
            env.push(format!("LISTEN_FDS={n}"));
            env.push("LISTEN_PID=1".to_owned());
        }
    }
    env
}

fn exec_payload(config: &ContainerConfig) -> Result<Infallible> {
    let resolved = resolve_user(config.user.as_deref())?;
    let env = build_environment(config, &resolved.home, &resolved.name);
    let envp: Vec<CString> = env.iter().map(|v| CString::new(v.as_str()).unwrap()).collect();

    let argv_strings: Vec<String> = if config.boot_mode {
        let init = BOOT_INIT_CANDIDATES
            .iter()
            .find(|p| Path::new(p).exists())
            .ok_or_else(|| Error::Setup("no init binary found for --boot".into()))?;
        let mut argv = vec![init.to_string()];
        argv.extend(config.command.iter().cloned());
        argv
    } else if !config.command.is_empty() {
        config.command.clone()
    } else {
        let _ = chdir(&resolved.home);
        vec![std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_owned())]
    };

    let filename = CString::new(argv_strings[0].as_bytes())
        .map_err(|e| Error::Setup(format!("invalid exec path: {e}")))?;
    let argv: Vec<CString> = argv_strings
        .iter()
        .map(|s| CString::new(s.as_bytes()).map_err(|e| Error::Setup(format!("invalid argument: {e}"))))
        .collect::<Result<_>>()?;

    execvpe(&filename, &argv, &envp)?;
    unreachable!("execvpe only returns on error, which the `?` above already propagated")
}
