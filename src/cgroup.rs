use std::fs::{self, File};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::{Error, Result};

const CGROUP_MOUNT: &str = "/sys/fs/cgroup";
const PROC_SELF_CGROUP: &str = "/proc/self/cgroup";

#[derive(Clone, Debug)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    pub fn current() -> Result<Self> {
        let contents = fs::read_to_string(PROC_SELF_CGROUP)?;
        for line in contents.lines() {
            if let Some(rest) = line.strip_prefix("0::") {
                return Ok(Self {
                    path: PathBuf::from(rest.trim_start_matches('/')),
                });
            }
        }
        Err(Error::Setup(
            "no unified cgroup hierarchy entry in /proc/self/cgroup".into(),
        ))
    }

    pub fn mount_path(&self) -> PathBuf {
        Path::new(CGROUP_MOUNT).join(&self.path)
    }

    fn child(&self, name: &str) -> Self {
        Self {
            path: self.path.join(name),
        }
    }

    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(self.mount_path())?;
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        fs::remove_dir(self.mount_path())?;
        Ok(())
    }

    pub fn add_process(&self, pid: Pid) -> Result<()> {
        fs::write(self.mount_path().join("cgroup.procs"), pid.to_string())?;
        Ok(())
    }

    pub fn open(&self) -> Result<File> {
        Ok(File::options()
            .read(true)
            .custom_flags(libc::O_PATH | libc::O_DIRECTORY)
            .open(self.mount_path())?)
    }

    fn procs(&self) -> Result<Vec<Pid>> {
        let contents = fs::read_to_string(self.mount_path().join("cgroup.procs"))?;
        Ok(contents
            .lines()
            .filter_map(|l| l.trim().parse::<i32>().ok())
            .map(Pid::from_raw)
            .collect())
    }
}

// `primary` is created and opened under the launcher's own pid, before the
// clone, so the child can be placed into it atomically via
// `CLONE_INTO_CGROUP` instead of a racy `cgroup.procs` write after the fact.
pub struct CgroupPlacement {
    pub primary: Cgroup,
    primary_fd: File,
    extras: Vec<Cgroup>,
    parent: Cgroup,
}

impl CgroupPlacement {
    pub fn prepare() -> Result<Self> {
        let parent = Cgroup::current()?;
        let primary = parent.child(&format!("nspawn-{}", Pid::this()));
        primary.create()?;
        let primary_fd = primary.open()?;
        Ok(Self {
            primary,
            primary_fd,
            extras: Vec::new(),
            parent,
        })
    }

    pub fn primary_fd(&self) -> &File {
        &self.primary_fd
    }

    pub fn attach_extras(&mut self, pid: Pid, extra_controllers: &[String]) {
        for name in extra_controllers {
            let hierarchy = Cgroup {
                path: PathBuf::from(name),
            };
            let sub = hierarchy.child(&format!("nspawn-{pid}"));
            match sub.create().and_then(|()| sub.add_process(pid)) {
                Ok(()) => self.extras.push(sub),
                Err(e) => {
                    tracing::warn!(controller = name, %e, "failed to attach extra controller");
                }
            }
        }
    }

    pub fn teardown(&self) -> Result<()> {
        let self_pid = Pid::this();
        if let Err(e) = self.parent.add_process(self_pid) {
            tracing::warn!(%e, "failed to reattach launcher to parent cgroup");
        }
        for sub in std::iter::once(&self.primary).chain(self.extras.iter()) {
            kill_and_wait(sub);
            if let Err(e) = sub.remove() {
                tracing::warn!(path = %sub.mount_path().display(), %e, "failed to remove sub-cgroup");
            }
        }
        Ok(())
    }
}

fn kill_and_wait(cg: &Cgroup) {
    let pids = match cg.procs() {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(%e, "failed to read cgroup.procs during teardown");
            return;
        }
    };
    for pid in pids {
        let _ = kill(pid, Signal::SIGKILL);
        let _ = nix::sys::wait::waitpid(pid, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_appends_segment_under_parent() {
        let parent = Cgroup {
            path: PathBuf::from("user.slice/session.scope"),
        };
        let child = parent.child("nspawn-1234");
        assert_eq!(
            child.mount_path(),
            Path::new(CGROUP_MOUNT).join("user.slice/session.scope/nspawn-1234")
        );
    }

    #[test]
    fn root_cgroup_mount_path_is_bare_mount_point() {
        let root = Cgroup {
            path: PathBuf::new(),
        };
        assert_eq!(root.mount_path(), Path::new(CGROUP_MOUNT));
    }
}
