use std::path::PathBuf;

use crate::{settings::InstallSettingsError, stage::StageError};

/// An error occurring during a call defined in this crate
#[non_exhaustive]
#[derive(thiserror::Error, Debug, strum::IntoStaticStr)]
pub enum KunsInstallerError {
    /// An error originating from a [`Stage`](crate::stage::Stage)
    #[error("Error executing stage")]
    Stage(
        #[source]
        #[from]
        StageError,
    ),
    /// The installation worker task panicked or was aborted
    #[error("Installation worker terminated unexpectedly")]
    Worker(#[source] tokio::task::JoinError),
    /// The block device lister did not run successfully
    #[error("Listing block devices with `{0}` failed")]
    ListDisks(String),
    /// Another installer already holds the run lock
    #[error("Another installation is already running (lock `{0}` is held)")]
    AlreadyRunning(PathBuf),
    /// Taking the run lock failed
    #[error("Acquiring run lock `{0}`")]
    Lock(PathBuf, #[source] nix::errno::Errno),
    /// Opening the run lock file failed
    #[error("Opening run lock `{0}`")]
    OpenLock(PathBuf, #[source] std::io::Error),
    /// Reading a settings file failed
    #[error("Reading settings file `{0}`")]
    ReadSettings(PathBuf, #[source] std::io::Error),
    /// (De)serializing settings failed
    #[error("Parsing settings")]
    ParseSettings(
        #[from]
        #[source]
        serde_json::Error,
    ),
    /// Install setting error
    #[error("Install setting error")]
    InstallSettings(
        #[from]
        #[source]
        InstallSettingsError,
    ),
}
