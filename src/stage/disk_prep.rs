use std::{path::PathBuf, time::Duration};

use tokio::time::Instant;
use tracing::{span, Span};

use crate::{
    layout::{PartitionLayout, EFI_END, EFI_START, ROOT_END},
    stage::{
        Stage, StageContext, StageDescription, StageError, StageErrorKind, StageKind, StatefulStage,
    },
    InstallCommand,
};

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/**
Write a fresh GPT partition table to the target disk with an EFI system partition and a root
partition, then wait for the kernel to expose the new partitions

This is destructive: any existing partition table on the disk is overwritten.
*/
#[derive(Debug, Clone)]
pub struct DiskPrep {
    disk: PathBuf,
    settle_timeout: Duration,
}

impl DiskPrep {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn plan(disk: impl Into<PathBuf>, settle_timeout: Duration) -> StatefulStage<Self> {
        Self {
            disk: disk.into(),
            settle_timeout,
        }
        .into()
    }

    fn parted(&self) -> InstallCommand {
        InstallCommand::new("parted")
            .arg("-s")
            .arg(self.disk.display().to_string())
    }
}

#[async_trait::async_trait]
impl Stage for DiskPrep {
    fn stage_kind() -> StageKind {
        StageKind::DiskPrep
    }
    fn kind(&self) -> StageKind {
        Self::stage_kind()
    }
    fn tracing_synopsis(&self) -> String {
        format!("Partition `{}` with a GPT label", self.disk.display())
    }

    fn tracing_span(&self) -> Span {
        span!(
            tracing::Level::DEBUG,
            "disk_prep",
            disk = tracing::field::display(self.disk.display()),
        )
    }

    fn execute_description(&self) -> Vec<StageDescription> {
        vec![StageDescription::new(
            self.tracing_synopsis(),
            vec![
                format!("Erase the partition table of `{}`", self.disk.display()),
                format!("Create a FAT32 EFI system partition from {EFI_START} to {EFI_END}"),
                format!("Create an ext4 root partition from {EFI_END} to {ROOT_END}"),
            ],
        )]
    }

    #[tracing::instrument(level = "debug", skip_all, fields(disk = %self.disk.display()))]
    async fn execute(&mut self, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        if !self.disk.exists() {
            ctx.log(format!("Disk {} does not exist", self.disk.display()));
            return Err(Self::error(StageErrorKind::DiskMissing(self.disk.clone())));
        }

        ctx.log("Unmounting existing partitions...");
        ctx.best_effort(
            InstallCommand::new("umount")
                .arg("-R")
                .arg(ctx.topology().root().display().to_string()),
        )
        .await;

        ctx.log("Creating new partition table...");
        ctx.must_succeed(self.parted().args(["mklabel", "gpt"]))
            .await
            .map_err(Self::error)?;

        ctx.log("Creating EFI partition...");
        ctx.must_succeed(
            self.parted()
                .args(["mkpart", "primary", "fat32", EFI_START, EFI_END]),
        )
        .await
        .map_err(Self::error)?;
        ctx.must_succeed(self.parted().args(["set", "1", "esp", "on"]))
            .await
            .map_err(Self::error)?;

        ctx.log("Creating root partition...");
        ctx.must_succeed(
            self.parted()
                .args(["mkpart", "primary", "ext4", EFI_END, ROOT_END]),
        )
        .await
        .map_err(Self::error)?;

        ctx.best_effort(InstallCommand::new("partprobe").arg(self.disk.display().to_string()))
            .await;

        let layout = PartitionLayout::for_disk(&self.disk);
        if !wait_for_partitions(&layout, self.settle_timeout).await {
            ctx.log(format!(
                "Partitions {} did not appear within {:?}, continuing",
                layout
                    .partitions()
                    .iter()
                    .map(|v| v.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                self.settle_timeout,
            ));
        }

        Ok(())
    }
}

/// Poll until every partition device node exists, or `timeout` elapsed
async fn wait_for_partitions(layout: &PartitionLayout, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if layout.partitions().iter().all(|v| v.exists()) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            tracing::debug!("Timed out waiting for partitions");
            return false;
        }
        tokio::time::sleep(SETTLE_POLL_INTERVAL.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn waits_for_existing_partitions() -> eyre::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let disk = temp_dir.path().join("sda");
        let layout = PartitionLayout::for_disk(&disk);
        for partition in layout.partitions() {
            tokio::fs::write(partition, "").await?;
        }
        assert!(wait_for_partitions(&layout, Duration::ZERO).await);
        Ok(())
    }

    #[tokio::test]
    async fn gives_up_on_missing_partitions() -> eyre::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let layout = PartitionLayout::for_disk(temp_dir.path().join("sda"));
        assert!(!wait_for_partitions(&layout, Duration::from_millis(10)).await);
        Ok(())
    }
}
