use std::process::ExitCode;

use clap::{ArgAction, Parser};

use crate::{
    cli::{arg::SettingsArgs, CommandExecute},
    InstallPlan,
};

/// Describe what an install with the given settings would do, without touching anything
#[derive(Debug, Parser)]
pub struct Plan {
    /// Explain each stage of the plan
    #[clap(long, action(ArgAction::SetTrue), default_value = "false")]
    pub explain: bool,

    #[clap(flatten)]
    pub settings: SettingsArgs,
}

#[async_trait::async_trait]
impl CommandExecute for Plan {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn execute(self) -> eyre::Result<ExitCode> {
        let Self { explain, settings } = self;

        let options = settings.options();
        let install_plan = InstallPlan::new(settings.settings().await?, options);
        println!("{}", install_plan.describe_install(explain));

        Ok(ExitCode::SUCCESS)
    }
}
