use tracing::{span, Span};

use crate::{
    stage::{
        Stage, StageContext, StageDescription, StageError, StageErrorKind, StageKind, StatefulStage,
    },
    util::append,
    InstallCommand,
};

/// Append the UUID-keyed table of the currently mounted target filesystems to the target's `/etc/fstab`
#[derive(Debug, Clone, Default)]
pub struct Fstab;

impl Fstab {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn plan() -> StatefulStage<Self> {
        Self.into()
    }
}

#[async_trait::async_trait]
impl Stage for Fstab {
    fn stage_kind() -> StageKind {
        StageKind::Fstab
    }
    fn kind(&self) -> StageKind {
        Self::stage_kind()
    }
    fn tracing_synopsis(&self) -> String {
        "Generate `/etc/fstab` with `genfstab`".to_string()
    }

    fn tracing_span(&self) -> Span {
        span!(tracing::Level::DEBUG, "fstab")
    }

    fn execute_description(&self) -> Vec<StageDescription> {
        vec![StageDescription::new(self.tracing_synopsis(), vec![])]
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn execute(&mut self, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        ctx.log("Generating fstab file...");
        let command = InstallCommand::new("genfstab")
            .arg("-U")
            .arg(ctx.topology().root().display().to_string());
        let table = ctx
            .capture(command.clone())
            .await
            .ok_or_else(|| Self::error(StageErrorKind::Command(command.to_string())))?;

        append(&ctx.topology().target_path("/etc/fstab"), &table)
            .await
            .map_err(Self::error)?;

        Ok(())
    }
}
