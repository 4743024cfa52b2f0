mod install;
pub use install::Install;
mod list_disks;
pub use list_disks::ListDisks;
mod plan;
pub use plan::Plan;

#[derive(Debug, clap::Subcommand)]
pub enum KunsInstallerSubcommand {
    Install(Install),
    Plan(Plan),
    ListDisks(ListDisks),
}
