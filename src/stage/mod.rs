/*! The eight stages of an installation

Each stage is a struct holding everything it was planned with, implementing [`Stage`]. The
[`InstallPlan`](crate::InstallPlan) runs them in the fixed order of [`StageKind`], wrapped in
[`StatefulStage`]s, and threads a [`StageContext`] through them.
*/
pub mod base_install;
pub mod bootloader;
pub mod cleanup;
pub mod configure;
pub mod disk_prep;
pub mod filesystems;
pub mod fstab;
pub mod mount;
mod stateful;

pub use base_install::BaseInstall;
pub use bootloader::Bootloader;
pub use cleanup::Cleanup;
pub use configure::Configure;
pub use disk_prep::DiskPrep;
pub use filesystems::Filesystems;
pub use fstab::Fstab;
pub use mount::Mount;
pub use stateful::{StageState, StatefulStage};

use std::path::PathBuf;

use tracing::Span;

use crate::{
    feedback::Feedback,
    layout::{MountTopology, PartitionLayout},
    runner::{CommandRunner, Strictness},
    InstallCommand,
};

/// An installation step, carrying everything it was planned with
#[async_trait::async_trait]
pub trait Stage: Send + Sync + std::fmt::Debug {
    fn stage_kind() -> StageKind
    where
        Self: Sized;
    fn kind(&self) -> StageKind;
    /// A synopsis of the stage for tracing purposes
    fn tracing_synopsis(&self) -> String;
    /// A tracing span suitable for the stage
    fn tracing_span(&self) -> Span;
    /// A description of what this stage would do during execution
    fn execute_description(&self) -> Vec<StageDescription>;
    /** Perform the stage

    Returns only after every command of the stage has finished, so its side effects are complete
    before the next stage starts.
    */
    async fn execute(&mut self, ctx: &mut StageContext<'_>) -> Result<(), StageError>;

    fn error(kind: impl Into<StageErrorKind>) -> StageError
    where
        Self: Sized,
    {
        StageError::new(Self::stage_kind(), kind)
    }
}

/// Stages in execution order, with their user-facing texts and progress checkpoints
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    strum::EnumIter,
    strum::IntoStaticStr,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StageKind {
    DiskPrep,
    Filesystems,
    Mount,
    BaseInstall,
    Fstab,
    Configure,
    Bootloader,
    Cleanup,
}

impl StageKind {
    /// The status text published when the stage starts
    pub fn status(&self) -> &'static str {
        match self {
            StageKind::DiskPrep => "Preparing disk...",
            StageKind::Filesystems => "Creating filesystems...",
            StageKind::Mount => "Mounting filesystems...",
            StageKind::BaseInstall => "Installing base system...",
            StageKind::Fstab => "Generating fstab...",
            StageKind::Configure => "Configuring system...",
            StageKind::Bootloader => "Installing bootloader...",
            StageKind::Cleanup => "Cleaning up...",
        }
    }

    /// The terminal message published when the stage fails
    pub fn failure_message(&self) -> &'static str {
        match self {
            StageKind::DiskPrep => "Disk preparation failed",
            StageKind::Filesystems => "Filesystem creation failed",
            StageKind::Mount => "Filesystem mounting failed",
            StageKind::BaseInstall => "Base system installation failed",
            StageKind::Fstab => "fstab generation failed",
            StageKind::Configure => "System configuration failed",
            StageKind::Bootloader => "Bootloader installation failed",
            StageKind::Cleanup => "Cleanup failed",
        }
    }

    /// The cumulative progress reached once the stage succeeded
    pub fn checkpoint(&self) -> u8 {
        match self {
            StageKind::DiskPrep => 15,
            StageKind::Filesystems => 25,
            StageKind::Mount => 35,
            StageKind::BaseInstall => 60,
            StageKind::Fstab => 65,
            StageKind::Configure => 85,
            StageKind::Bootloader => 95,
            StageKind::Cleanup => 100,
        }
    }
}

/// A description of a [`Stage`] for confirmation and `--explain` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescription {
    pub description: String,
    pub explanation: Vec<String>,
}

impl StageDescription {
    pub fn new(description: String, explanation: Vec<String>) -> Self {
        Self {
            description,
            explanation,
        }
    }
}

/** State threaded from stage to stage

The [`PartitionLayout`] is derived by [`Filesystems`] and consumed by later stages, the rest is
borrowed from the running [`InstallPlan`](crate::InstallPlan).
*/
pub struct StageContext<'a> {
    runner: &'a dyn CommandRunner,
    feedback: &'a dyn Feedback,
    topology: &'a MountTopology,
    layout: Option<PartitionLayout>,
}

impl<'a> StageContext<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        feedback: &'a dyn Feedback,
        topology: &'a MountTopology,
    ) -> Self {
        Self {
            runner,
            feedback,
            topology,
            layout: None,
        }
    }

    pub fn topology(&self) -> &MountTopology {
        self.topology
    }

    pub fn feedback(&self) -> &dyn Feedback {
        self.feedback
    }

    pub fn log(&self, line: impl AsRef<str>) {
        self.feedback.log(line.as_ref())
    }

    pub fn layout(&self) -> Result<&PartitionLayout, StageErrorKind> {
        self.layout.as_ref().ok_or(StageErrorKind::MissingLayout)
    }

    pub(crate) fn set_layout(&mut self, layout: PartitionLayout) {
        self.layout = Some(layout);
    }

    /// Run a command whose failure aborts the stage
    pub(crate) async fn must_succeed(&self, command: InstallCommand) -> Result<(), StageErrorKind> {
        match self
            .runner
            .run(&command, Strictness::MustSucceed, self.feedback)
            .await
        {
            true => Ok(()),
            false => Err(StageErrorKind::Command(command.to_string())),
        }
    }

    /// Run a command whose failure is only logged
    pub(crate) async fn best_effort(&self, command: InstallCommand) {
        self.runner
            .run(&command, Strictness::BestEffort, self.feedback)
            .await;
    }

    /// Run a command and report whether it succeeded, leaving the consequences to the stage
    pub(crate) async fn attempt(&self, command: InstallCommand) -> bool {
        self.runner
            .run(&command, Strictness::MustSucceed, self.feedback)
            .await
    }

    pub(crate) async fn capture(&self, command: InstallCommand) -> Option<String> {
        self.runner.capture(&command, self.feedback).await
    }
}

/// An error occurring during a [`Stage`]
#[derive(Debug, thiserror::Error)]
#[error("Error executing stage `{stage}`")]
pub struct StageError {
    stage: StageKind,
    #[source]
    kind: StageErrorKind,
}

impl StageError {
    pub fn new(stage: StageKind, kind: impl Into<StageErrorKind>) -> Self {
        Self {
            stage,
            kind: kind.into(),
        }
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    pub fn kind(&self) -> &StageErrorKind {
        &self.kind
    }
}

/// The reason a [`Stage`] failed
#[non_exhaustive]
#[derive(Debug, thiserror::Error, strum::IntoStaticStr)]
pub enum StageErrorKind {
    #[error("Target disk `{0}` does not exist")]
    DiskMissing(PathBuf),
    #[error("Command `{0}` failed")]
    Command(String),
    #[error("Creating directory `{0}`")]
    CreateDirectory(PathBuf, #[source] std::io::Error),
    #[error("Reading `{0}`")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("Writing `{0}`")]
    Write(PathBuf, #[source] std::io::Error),
    #[error("Setting permissions of `{0}`")]
    SetPermissions(PathBuf, #[source] std::io::Error),
    #[error("Renaming `{0}` to `{1}`")]
    Rename(PathBuf, PathBuf, #[source] std::io::Error),
    #[error("The partition layout is only known after filesystems were created")]
    MissingLayout,
    #[error("Cancelled by user")]
    Cancelled,
}

#[cfg(test)]
mod test {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn checkpoints_are_monotonic_and_end_at_100() {
        let checkpoints = StageKind::iter()
            .map(|kind| kind.checkpoint())
            .collect::<Vec<_>>();
        assert_eq!(checkpoints, vec![15, 25, 35, 60, 65, 85, 95, 100]);
    }

    #[test]
    fn stage_errors_render_their_stage() {
        let err = StageError::new(
            StageKind::Fstab,
            StageErrorKind::Command("genfstab -U /mnt".into()),
        );
        assert_eq!(err.to_string(), "Error executing stage `fstab`");
        assert_eq!(err.kind().to_string(), "Command `genfstab -U /mnt` failed");
    }
}
