use tracing::{span, Span};

use crate::{
    stage::{Stage, StageContext, StageDescription, StageError, StageKind, StatefulStage},
    util::create_dir_all,
    InstallCommand,
};

/**
Mount the root partition at the mount root, then the EFI system partition nested at its `boot`
directory
*/
#[derive(Debug, Clone, Default)]
pub struct Mount;

impl Mount {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn plan() -> StatefulStage<Self> {
        Self.into()
    }
}

#[async_trait::async_trait]
impl Stage for Mount {
    fn stage_kind() -> StageKind {
        StageKind::Mount
    }
    fn kind(&self) -> StageKind {
        Self::stage_kind()
    }
    fn tracing_synopsis(&self) -> String {
        "Mount the root and EFI partitions".to_string()
    }

    fn tracing_span(&self) -> Span {
        span!(tracing::Level::DEBUG, "mount")
    }

    fn execute_description(&self) -> Vec<StageDescription> {
        vec![StageDescription::new(
            self.tracing_synopsis(),
            vec!["The EFI partition is mounted at `boot` inside the root partition".to_string()],
        )]
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn execute(&mut self, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        let layout = ctx.layout().map_err(Self::error)?.clone();
        let root = ctx.topology().root().to_path_buf();
        let boot = ctx.topology().boot();

        create_dir_all(&root).await.map_err(Self::error)?;

        ctx.log("Mounting root partition...");
        ctx.must_succeed(
            InstallCommand::new("mount")
                .arg(layout.root_partition.display().to_string())
                .arg(root.display().to_string()),
        )
        .await
        .map_err(Self::error)?;

        // Only now, so the directory lands on the root filesystem
        ctx.log("Creating boot mount point...");
        create_dir_all(&boot).await.map_err(Self::error)?;

        ctx.log("Mounting EFI partition...");
        ctx.must_succeed(
            InstallCommand::new("mount")
                .arg(layout.efi_partition.display().to_string())
                .arg(boot.display().to_string()),
        )
        .await
        .map_err(Self::error)?;

        Ok(())
    }
}
