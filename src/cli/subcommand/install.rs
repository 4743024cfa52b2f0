use std::{process::ExitCode, sync::Arc};

use clap::{ArgAction, Parser};
use eyre::WrapErr;
use owo_colors::OwoColorize;

use crate::{
    cli::{
        acquire_run_lock, arg::SettingsArgs, ensure_required_tools, ensure_root, forward_signals,
        interaction::{self, PromptChoice},
        CommandExecute, RUN_LOCK_LOCATION,
    },
    feedback::console::Console,
    InstallPlan, ProcessRunner, RunOutcome,
};

/**
Erase a disk and install Kuns OS onto it
*/
#[derive(Debug, Parser)]
pub struct Install {
    /// Run installation without requiring explicit user confirmation
    #[clap(
        long,
        env = "KUNS_INSTALLER_NO_CONFIRM",
        action(ArgAction::SetTrue),
        default_value = "false",
        global = true
    )]
    pub no_confirm: bool,

    /// Provide an explanation of the changes the installation process will make to the disk
    #[clap(
        long,
        env = "KUNS_INSTALLER_EXPLAIN",
        action(ArgAction::SetTrue),
        default_value = "false",
        global = true
    )]
    pub explain: bool,

    #[clap(flatten)]
    pub settings: SettingsArgs,
}

#[async_trait::async_trait]
impl CommandExecute for Install {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn execute(self) -> eyre::Result<ExitCode> {
        let Self {
            no_confirm,
            explain,
            settings,
        } = self;

        ensure_root()?;
        ensure_required_tools()?;
        let _lock = acquire_run_lock(RUN_LOCK_LOCATION)?;

        let options = settings.options();
        let settings = settings.settings().await?;
        settings
            .require_credentials()
            .wrap_err("Both `--password` and `--root-password` are required")?;

        let install_plan = InstallPlan::new(settings, options);

        if !no_confirm {
            let mut currently_explaining = explain;
            loop {
                match interaction::prompt(
                    install_plan.describe_install(currently_explaining),
                    PromptChoice::No,
                    currently_explaining,
                )
                .await?
                {
                    PromptChoice::Yes => break,
                    PromptChoice::Explain => currently_explaining = true,
                    PromptChoice::No => {
                        interaction::clean_exit_with_message(
                            "Okay, didn't touch the disk. Bye!",
                        )
                        .await
                    },
                }
            }
        }

        let handle = install_plan.spawn(Arc::new(ProcessRunner), Arc::new(Console::new()));
        forward_signals(handle.cancel_sender())?;

        match handle.wait().await {
            RunOutcome::Success { .. } => {
                println!(
                    "\
                    {success}\n\
                    Remove the installation media and reboot into your new system.\n\
                    ",
                    success = "Kuns OS was installed successfully!".green().bold(),
                );
                Ok(ExitCode::SUCCESS)
            },
            RunOutcome::Failure { stage, message } => {
                tracing::error!(?stage, "{message}");
                Ok(ExitCode::FAILURE)
            },
        }
    }
}
