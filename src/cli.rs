//! Command-line surface. Argument parsing itself is an external
//! collaborator (`clap`'s derive macros generate `--help`/`--version`); this
//! module's own job is translating the raw parsed struct into a validated
//! [`ContainerConfig`], which is where PATH canonicalization, capability
//! name parsing, and `OUTER:INNER` veth splitting happen.

use std::path::PathBuf;

use caps::Capability;
use clap::Parser;

use crate::config::{default_capabilities, ContainerConfig, JournalLink};
use crate::error::{Error, Result};

const MAX_VETH_PAIRS: usize = 16;

#[derive(Parser, Debug)]
#[command(name = "nsbox", version, about = "Linux namespace container launcher")]
pub struct LauncherArgs {
    /// Container root directory (defaults to the current directory).
    #[arg(short = 'D', long = "directory")]
    pub directory: Option<PathBuf>,

    /// Payload user, resolved inside the container after pivot.
    #[arg(short = 'u', long = "user")]
    pub user: Option<String>,

    /// Comma-separated extra cgroup controllers.
    #[arg(short = 'C', long = "controllers")]
    pub controllers: Option<String>,

    /// Value exposed to the payload as `container_uuid`.
    #[arg(long = "uuid")]
    pub uuid: Option<uuid::Uuid>,

    /// Join a fresh network namespace.
    #[arg(long = "private-network")]
    pub private_network: bool,

    /// Create a veth pair `OUTER:INNER`; repeatable up to 16 times.
    #[arg(long = "network-if")]
    pub network_if: Vec<String>,

    /// Remount the root bind mount read-only.
    #[arg(long = "read-only")]
    pub read_only: bool,

    /// Search for an init binary and run it as PID 1.
    #[arg(short = 'b', long = "boot")]
    pub boot: bool,

    /// Additional capabilities to retain, comma-separated, repeatable.
    #[arg(long = "capability")]
    pub capability: Vec<String>,

    /// Journal link mode: no, auto, host, guest.
    #[arg(long = "link-journal")]
    pub link_journal: Option<String>,

    /// Shorthand for --link-journal=host.
    #[arg(short = 'j')]
    pub link_journal_host: bool,

    /// PATH followed by ARGUMENTS for the payload.
    pub positional: Vec<String>,
}

impl TryFrom<LauncherArgs> for ContainerConfig {
    type Error = Error;

    fn try_from(args: LauncherArgs) -> Result<Self> {
        let mut positional = args.positional.into_iter();
        let root_dir = match args.directory {
            Some(v) => v,
            None => positional
                .next()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        let root_dir = ContainerConfig::validate_root(&root_dir)?;
        let command: Vec<String> = positional.collect();

        let extra_controllers = args
            .controllers
            .as_deref()
            .map(|v| {
                let mut names: Vec<String> =
                    v.split(',').filter(|s| !s.is_empty()).map(str::to_owned).collect();
                names.sort();
                names.dedup();
                names
            })
            .unwrap_or_default();

        let mut veth_pairs = Vec::new();
        if args.network_if.len() > MAX_VETH_PAIRS {
            return Err(Error::Preflight(format!(
                "at most {MAX_VETH_PAIRS} --network-if pairs are supported"
            )));
        }
        for spec in &args.network_if {
            let (outer, inner) = spec.split_once(':').ok_or_else(|| {
                Error::Preflight(format!("--network-if expects OUTER:INNER, got {spec:?}"))
            })?;
            veth_pairs.push((outer.to_owned(), inner.to_owned()));
        }

        let mut retained_caps = default_capabilities();
        for group in &args.capability {
            for name in group.split(',').filter(|s| !s.is_empty()) {
                let cap = name
                    .parse::<Capability>()
                    .map_err(|_| Error::Preflight(format!("unknown capability: {name}")))?;
                retained_caps.insert(cap);
            }
        }

        let journal_link = if args.link_journal_host {
            JournalLink::Host
        } else if let Some(mode) = &args.link_journal {
            mode.parse()?
        } else {
            JournalLink::None
        };

        Ok(ContainerConfig {
            root_dir,
            user: args.user,
            extra_controllers,
            machine_uuid: args.uuid,
            private_network: args.private_network,
            veth_pairs,
            read_only: args.read_only,
            boot_mode: args.boot,
            journal_link,
            retained_caps,
            command,
        })
    }
}
