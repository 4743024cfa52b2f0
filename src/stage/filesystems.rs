use std::path::PathBuf;

use tracing::{span, Span};

use crate::{
    layout::PartitionLayout,
    stage::{Stage, StageContext, StageDescription, StageError, StageKind, StatefulStage},
    InstallCommand,
};

/**
Format the EFI system partition as FAT32 and the root partition as ext4, discarding any existing
filesystem signature

Also derives the [`PartitionLayout`] the following stages use.
*/
#[derive(Debug, Clone)]
pub struct Filesystems {
    layout: PartitionLayout,
}

impl Filesystems {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn plan(disk: impl Into<PathBuf>) -> StatefulStage<Self> {
        Self {
            layout: PartitionLayout::for_disk(disk.into()),
        }
        .into()
    }

    pub fn layout(&self) -> &PartitionLayout {
        &self.layout
    }
}

#[async_trait::async_trait]
impl Stage for Filesystems {
    fn stage_kind() -> StageKind {
        StageKind::Filesystems
    }
    fn kind(&self) -> StageKind {
        Self::stage_kind()
    }
    fn tracing_synopsis(&self) -> String {
        format!(
            "Format `{}` as FAT32 and `{}` as ext4",
            self.layout.efi_partition.display(),
            self.layout.root_partition.display()
        )
    }

    fn tracing_span(&self) -> Span {
        span!(
            tracing::Level::DEBUG,
            "filesystems",
            efi_partition = tracing::field::display(self.layout.efi_partition.display()),
            root_partition = tracing::field::display(self.layout.root_partition.display()),
        )
    }

    fn execute_description(&self) -> Vec<StageDescription> {
        vec![StageDescription::new(self.tracing_synopsis(), vec![])]
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn execute(&mut self, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        let Self { layout } = self;

        ctx.log("Formatting EFI partition...");
        ctx.must_succeed(
            InstallCommand::new("mkfs.fat")
                .arg("-F32")
                .arg(layout.efi_partition.display().to_string()),
        )
        .await
        .map_err(Self::error)?;

        ctx.log("Formatting root partition...");
        ctx.must_succeed(
            InstallCommand::new("mkfs.ext4")
                .arg("-F")
                .arg(layout.root_partition.display().to_string()),
        )
        .await
        .map_err(Self::error)?;

        ctx.set_layout(layout.clone());

        Ok(())
    }
}
