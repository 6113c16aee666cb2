use std::collections::HashSet;
use std::path::{Path, PathBuf};

use caps::Capability;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum JournalLink {
    #[default]
    None,
    Auto,
    Host,
    Guest,
}

impl std::str::FromStr for JournalLink {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "no" | "none" => Ok(JournalLink::None),
            "auto" => Ok(JournalLink::Auto),
            "host" => Ok(JournalLink::Host),
            "guest" => Ok(JournalLink::Guest),
            other => Err(Error::Preflight(format!(
                "unknown --link-journal mode: {other}"
            ))),
        }
    }
}

pub fn default_capabilities() -> HashSet<Capability> {
    use Capability::*;
    [
        CAP_AUDIT_WRITE,
        CAP_CHOWN,
        CAP_DAC_OVERRIDE,
        CAP_FOWNER,
        CAP_FSETID,
        CAP_KILL,
        CAP_MKNOD,
        CAP_NET_BIND_SERVICE,
        CAP_NET_RAW,
        CAP_SETFCAP,
        CAP_SETGID,
        CAP_SETPCAP,
        CAP_SETUID,
        CAP_SYS_CHROOT,
    ]
    .into_iter()
    .collect()
}

#[derive(Clone, Debug)]
pub struct ContainerConfig {
    pub root_dir: PathBuf,
    pub user: Option<String>,
    pub extra_controllers: Vec<String>,
    pub machine_uuid: Option<uuid::Uuid>,
    pub private_network: bool,
    pub veth_pairs: Vec<(String, String)>,
    pub read_only: bool,
    pub boot_mode: bool,
    pub journal_link: JournalLink,
    pub retained_caps: HashSet<Capability>,
    pub command: Vec<String>,
}

impl ContainerConfig {
    pub fn validate_root(root_dir: &Path) -> Result<PathBuf> {
        let canon = root_dir
            .canonicalize()
            .map_err(|e| Error::Preflight(format!("cannot canonicalize {root_dir:?}: {e}")))?;
        if canon == Path::new("/") {
            return Err(Error::Preflight("container root cannot be /".into()));
        }
        if !canon.join("bin/sh").exists() {
            return Err(Error::Preflight(format!(
                "{canon:?} does not look like an OS root (missing /bin/sh)"
            )));
        }
        Ok(canon)
    }

    pub fn hostname(&self) -> String {
        self.root_dir
            .file_name()
            .map(|v| v.to_string_lossy().into_owned())
            .unwrap_or_else(|| "container".to_owned())
    }
}
