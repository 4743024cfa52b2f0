/*! The Kuns OS installer

`kuns-installer` partitions a target disk, creates its filesystems, bootstraps an Arch-based
base system into it, configures that system from inside a chroot and installs GRUB.

The library is built around an [`InstallPlan`]: an ordered list of eight [`Stage`]s which are
executed strictly in sequence by a single worker. Every external tool is invoked through a
[`CommandRunner`] and every observable event (progress, status, log lines, the terminal outcome)
is published to a [`Feedback`] sink. The `kuns-installer` binary (behind the `cli` feature) is
one consumer of the library; a graphical frontend is another.

```rust,no_run
use std::sync::Arc;
use kuns_installer::{
    feedback::devnull::DevNull, InstallOptions, InstallPlan, InstallSettings, ProcessRunner,
    RunOutcome,
};

# async fn wrapper() -> Result<(), kuns_installer::KunsInstallerError> {
let settings: InstallSettings = serde_json::from_str(r#"{
    "disk": "/dev/sda",
    "hostname": "kuns-os",
    "username": "kunsos",
    "password": "hunter2",
    "root_password": "hunter3"
}"#)?;
settings.validate()?;

let plan = InstallPlan::new(settings, InstallOptions::default());
let handle = plan.spawn(Arc::new(ProcessRunner), Arc::new(DevNull));

match handle.wait().await {
    RunOutcome::Success { message } => println!("{message}"),
    RunOutcome::Failure { message, .. } => eprintln!("{message}"),
}
# Ok(())
# }
```
*/

#[cfg(feature = "cli")]
pub mod cli;
pub mod command;
pub mod disks;
mod error;
pub mod feedback;
pub mod layout;
mod plan;
pub mod runner;
pub mod settings;
pub mod stage;
pub(crate) mod util;

pub use command::InstallCommand;
pub use error::KunsInstallerError;
pub use feedback::Feedback;
pub use layout::{MountTopology, PartitionLayout};
pub use plan::{InstallHandle, InstallPlan, RunOutcome};
pub use runner::{CommandRunner, ProcessRunner, Strictness};
pub use settings::{InstallOptions, InstallSettings, Secret};
pub use stage::{Stage, StageKind};
