use std::process::ExitCode;

use clap::Parser;
use nix::unistd::Uid;

use nsbox::cli::LauncherArgs;
use nsbox::config::ContainerConfig;
use nsbox::error::Error;
use nsbox::supervise::{exit_code, ExitOutcome};
use nsbox::{launcher, Result};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(outcome) => ExitCode::from(exit_code(outcome) as u8),
        Err(e) => {
            tracing::error!(%e, "launch failed");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitOutcome> {
    preflight()?;
    let args = LauncherArgs::parse();
    let config = ContainerConfig::try_from(args)?;
    tracing::debug!(root_dir = ?config.root_dir, "launching container");
    launcher::run(&config)
}

fn preflight() -> Result<()> {
    if !Uid::effective().is_root() {
        return Err(Error::Preflight(
            "nsbox must run as root (effective uid 0)".into(),
        ));
    }
    if !std::path::Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
        return Err(Error::Preflight(
            "cgroup v2 unified hierarchy not available at /sys/fs/cgroup".into(),
        ));
    }
    Ok(())
}
