pub mod arg;
mod interaction;
pub mod subcommand;

use std::{fs::File, path::Path, process::ExitCode};

use clap::Parser;
use eyre::{eyre, WrapErr};
use nix::fcntl::{Flock, FlockArg};
use owo_colors::OwoColorize;
use tokio::sync::broadcast::Sender;

use self::subcommand::KunsInstallerSubcommand;
use crate::KunsInstallerError;

/// Serializes installer runs, two runs sharing a disk or a mount point would corrupt each other
pub const RUN_LOCK_LOCATION: &str = "/run/kuns-installer.lock";

/// Tools which must be on the `PATH` of the live system before any disk is touched
pub const REQUIRED_TOOLS: &[&str] = &[
    "parted",
    "mkfs.fat",
    "mkfs.ext4",
    "mount",
    "pacstrap",
    "genfstab",
    "arch-chroot",
];

#[async_trait::async_trait]
pub trait CommandExecute {
    async fn execute(self) -> eyre::Result<ExitCode>;
}

/**
An installer for Kuns OS

Partitions a disk, installs an Arch-based system with a desktop onto it and makes it bootable.
*/
#[derive(Debug, Parser)]
#[clap(version)]
pub struct KunsInstallerCli {
    #[clap(flatten)]
    pub instrumentation: arg::Instrumentation,

    #[clap(subcommand)]
    pub subcommand: KunsInstallerSubcommand,
}

#[async_trait::async_trait]
impl CommandExecute for KunsInstallerCli {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn execute(self) -> eyre::Result<ExitCode> {
        let Self {
            instrumentation: _,
            subcommand,
        } = self;

        match subcommand {
            KunsInstallerSubcommand::Install(install) => install.execute().await,
            KunsInstallerSubcommand::Plan(plan) => plan.execute().await,
            KunsInstallerSubcommand::ListDisks(list_disks) => list_disks.execute().await,
        }
    }
}

/// Forward SIGINT and SIGTERM to `cancel`, for example [`InstallHandle::cancel_sender`](crate::InstallHandle::cancel_sender)
pub(crate) fn forward_signals(cancel: Sender<()>) -> eyre::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).wrap_err("Registering SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).wrap_err("Registering SIGTERM handler")?;

    let _guard = tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            };
            tracing::warn!("Got {name}, cancelling the installation");
            if cancel.send(()).is_err() {
                break;
            }
        }
    });

    Ok(())
}

pub(crate) fn ensure_root() -> eyre::Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        return Err(eyre!(
            "`kuns-installer` needs to run as `root`, try `sudo kuns-installer {}`",
            std::env::args().skip(1).collect::<Vec<_>>().join(" ")
        ));
    }
    Ok(())
}

/// Fail early if a tool the stages shell out to is missing
pub(crate) fn ensure_required_tools() -> eyre::Result<()> {
    let missing = REQUIRED_TOOLS
        .iter()
        .filter(|tool| which::which(tool).is_err())
        .copied()
        .collect::<Vec<_>>();

    match missing.is_empty() {
        true => Ok(()),
        false => Err(eyre!(
            "Required tools are missing from `PATH`: {}",
            missing.join(", ").bold()
        )),
    }
}

/// Hold an exclusive lock on `path` until the returned guard is dropped
pub(crate) fn acquire_run_lock(path: impl AsRef<Path>) -> Result<Flock<File>, KunsInstallerError> {
    let path = path.as_ref();
    let file = File::options()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| KunsInstallerError::OpenLock(path.to_path_buf(), e))?;

    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => {
            tracing::debug!(path = %path.display(), "Acquired run lock");
            Ok(lock)
        },
        Err((_, nix::errno::Errno::EWOULDBLOCK)) => {
            Err(KunsInstallerError::AlreadyRunning(path.to_path_buf()))
        },
        Err((_, errno)) => Err(KunsInstallerError::Lock(path.to_path_buf(), errno)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn run_lock_is_exclusive() -> eyre::Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        let lock_path = temp_dir.path().join("kuns-installer.lock");

        let guard = acquire_run_lock(&lock_path)?;
        assert!(matches!(
            acquire_run_lock(&lock_path),
            Err(KunsInstallerError::AlreadyRunning(_))
        ));
        drop(guard);

        let _guard = acquire_run_lock(&lock_path)?;
        Ok(())
    }

    #[tokio::test]
    async fn signals_are_forwarded_as_cancellation() -> eyre::Result<()> {
        let (cancel, mut cancelled) = tokio::sync::broadcast::channel(1);
        forward_signals(cancel)?;

        nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM)?;
        tokio::time::timeout(std::time::Duration::from_secs(5), cancelled.recv()).await??;
        Ok(())
    }

    #[test]
    fn parses_subcommands() -> eyre::Result<()> {
        let cli = KunsInstallerCli::try_parse_from([
            "kuns-installer",
            "-vv",
            "install",
            "--disk",
            "/dev/sda",
            "--no-confirm",
            "--package",
            "htop",
            "--package",
            "git",
        ])?;
        assert_eq!(cli.instrumentation.verbose, 2);
        assert!(matches!(cli.subcommand, KunsInstallerSubcommand::Install(_)));

        let cli = KunsInstallerCli::try_parse_from(["kuns-installer", "list-disks"])?;
        assert!(matches!(
            cli.subcommand,
            KunsInstallerSubcommand::ListDisks(_)
        ));
        Ok(())
    }
}
