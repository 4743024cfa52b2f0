use std::process::ExitCode;

use clap::{ArgAction, Parser};
use owo_colors::OwoColorize;

use crate::{cli::CommandExecute, disks::list_disks, feedback::console::Console, ProcessRunner};

/// List the disks Kuns OS can be installed to, largest first
#[derive(Debug, Parser)]
pub struct ListDisks {
    /// Print the disks as JSON
    #[clap(long, action(ArgAction::SetTrue), default_value = "false")]
    pub json: bool,
}

#[async_trait::async_trait]
impl CommandExecute for ListDisks {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn execute(self) -> eyre::Result<ExitCode> {
        let disks = list_disks(&ProcessRunner, &Console::new()).await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&disks)?);
            return Ok(ExitCode::SUCCESS);
        }

        if disks.is_empty() {
            eprintln!(
                "{}",
                "No suitable installation disks found, at least 1 GiB of capacity is required."
                    .red()
            );
            return Ok(ExitCode::FAILURE);
        }

        for disk in disks {
            println!(
                "{device:<16} {size:>8}  {model}",
                device = disk.device.display().bold(),
                size = disk.size,
                model = disk.model,
            );
        }
        Ok(ExitCode::SUCCESS)
    }
}
