use tracing::{span, Span};

use crate::{
    stage::{Stage, StageContext, StageDescription, StageError, StageKind, StatefulStage},
    InstallCommand,
};

/// Recursively unmount everything under the mount root, ignoring failures
#[derive(Debug, Clone, Default)]
pub struct Cleanup;

impl Cleanup {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn plan() -> StatefulStage<Self> {
        Self.into()
    }

    /// Unmount the target, whatever state it is in
    pub(crate) async fn unmount(ctx: &StageContext<'_>) {
        ctx.log("Unmounting filesystems...");
        ctx.best_effort(
            InstallCommand::new("umount")
                .arg("-R")
                .arg(ctx.topology().root().display().to_string()),
        )
        .await;
    }
}

#[async_trait::async_trait]
impl Stage for Cleanup {
    fn stage_kind() -> StageKind {
        StageKind::Cleanup
    }
    fn kind(&self) -> StageKind {
        Self::stage_kind()
    }
    fn tracing_synopsis(&self) -> String {
        "Unmount the installed system".to_string()
    }

    fn tracing_span(&self) -> Span {
        span!(tracing::Level::DEBUG, "cleanup")
    }

    fn execute_description(&self) -> Vec<StageDescription> {
        vec![StageDescription::new(self.tracing_synopsis(), vec![])]
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn execute(&mut self, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        Self::unmount(ctx).await;
        ctx.log("Installation cleanup completed");
        Ok(())
    }
}
