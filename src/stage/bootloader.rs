use std::path::PathBuf;

use tracing::{span, Span};

use crate::{
    layout::PartitionLayout,
    stage::{Stage, StageContext, StageDescription, StageError, StageKind, StatefulStage},
    util::write_atomic,
    InstallCommand,
};

/// The directory name GRUB uses below `EFI/` on the EFI system partition
pub const BOOTLOADER_ID: &str = "KunsOS";
/// The standalone recovery configuration, relative to the target root
pub const STANDALONE_CONFIG: &str = "/boot/grub/grub-standalone.cfg";

/**
Install GRUB for both UEFI and legacy BIOS firmware, generate its configuration, and leave behind
a fallback EFI binary and a standalone recovery configuration

A failed UEFI or BIOS installation alone never aborts the stage, if both fail a warning is logged
and configuration generation still proceeds.
*/
#[derive(Debug, Clone)]
pub struct Bootloader {
    disk: PathBuf,
}

impl Bootloader {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn plan(disk: impl Into<PathBuf>) -> StatefulStage<Self> {
        Self { disk: disk.into() }.into()
    }

    fn parted(&self) -> InstallCommand {
        InstallCommand::new("parted")
            .arg("-s")
            .arg(self.disk.display().to_string())
    }

    /// Install GRUB both ways, returning which of (UEFI, BIOS) succeeded
    #[tracing::instrument(level = "debug", skip_all)]
    async fn install_grub(&self, ctx: &StageContext<'_>) -> (bool, bool) {
        let root = ctx.topology().root();
        ctx.log("Installing GRUB for both EFI and BIOS...");

        let efi = ctx
            .attempt(InstallCommand::chroot(root, "grub-install").args([
                "--target=x86_64-efi".to_string(),
                "--efi-directory=/boot".to_string(),
                format!("--bootloader-id={BOOTLOADER_ID}"),
                "--no-nvram".to_string(),
                "--removable".to_string(),
            ]))
            .await;
        let bios = ctx
            .attempt(
                InstallCommand::chroot(root, "grub-install")
                    .arg("--target=i386-pc")
                    .arg(self.disk.display().to_string()),
            )
            .await;

        if efi {
            ctx.log("EFI GRUB installation successful");
        }
        if bios {
            ctx.log("BIOS GRUB installation successful");
        }
        if !efi && !bios {
            tracing::warn!(
                disk = %self.disk.display(),
                "Both EFI and BIOS GRUB installation failed"
            );
            ctx.log("WARNING: Both EFI and BIOS installation failed!");
        }
        (efi, bios)
    }

    /// The kernel argument selecting the root filesystem, by UUID when it can be looked up
    async fn root_argument(&self, ctx: &StageContext<'_>, layout: &PartitionLayout) -> String {
        let uuid = ctx
            .capture(InstallCommand::new("blkid").args([
                "-s".to_string(),
                "UUID".to_string(),
                "-o".to_string(),
                "value".to_string(),
                layout.root_partition.display().to_string(),
            ]))
            .await
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        match uuid {
            Some(uuid) => format!("UUID={uuid}"),
            None => {
                ctx.log(format!(
                    "Could not determine the UUID of {}, referencing it by device path",
                    layout.root_partition.display()
                ));
                layout.root_partition.display().to_string()
            },
        }
    }
}

#[async_trait::async_trait]
impl Stage for Bootloader {
    fn stage_kind() -> StageKind {
        StageKind::Bootloader
    }
    fn kind(&self) -> StageKind {
        Self::stage_kind()
    }
    fn tracing_synopsis(&self) -> String {
        format!("Install GRUB on `{}`", self.disk.display())
    }

    fn tracing_span(&self) -> Span {
        span!(
            tracing::Level::DEBUG,
            "bootloader",
            disk = tracing::field::display(self.disk.display()),
        )
    }

    fn execute_description(&self) -> Vec<StageDescription> {
        vec![StageDescription::new(
            self.tracing_synopsis(),
            vec![
                "Install GRUB for UEFI firmware at the removable media path".to_string(),
                "Install GRUB for legacy BIOS firmware".to_string(),
                "Generate `/boot/grub/grub.cfg`".to_string(),
                format!("Write a recovery configuration to `{STANDALONE_CONFIG}`"),
            ],
        )]
    }

    #[tracing::instrument(level = "debug", skip_all, fields(disk = %self.disk.display()))]
    async fn execute(&mut self, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        let layout = ctx.layout().map_err(Self::error)?.clone();
        let root = ctx.topology().root().to_path_buf();

        ctx.log("Setting boot flag on EFI partition...");
        ctx.best_effort(self.parted().args(["set", "1", "boot", "on"]))
            .await;

        ctx.log("Creating EFI boot directory...");
        ctx.must_succeed(InstallCommand::chroot(&root, "mkdir").args(["-p", "/boot/EFI"]))
            .await
            .map_err(Self::error)?;

        self.install_grub(ctx).await;

        ctx.log("Generating GRUB configuration...");
        ctx.must_succeed(
            InstallCommand::chroot(&root, "grub-mkconfig").args(["-o", "/boot/grub/grub.cfg"]),
        )
        .await
        .map_err(Self::error)?;

        ctx.log("Creating fallback boot entries...");
        ctx.best_effort(InstallCommand::chroot(&root, "mkdir").args(["-p", "/boot/EFI/BOOT"]))
            .await;
        ctx.best_effort(InstallCommand::chroot(&root, "cp").args([
            format!("/boot/EFI/{BOOTLOADER_ID}/grubx64.efi"),
            "/boot/EFI/BOOT/BOOTX64.EFI".to_string(),
        ]))
        .await;

        let root_argument = self.root_argument(ctx, &layout).await;
        write_atomic(
            &ctx.topology().target_path(STANDALONE_CONFIG),
            &standalone_config(&root_argument),
        )
        .await
        .map_err(Self::error)?;

        ctx.log("Making disk bootable...");
        ctx.best_effort(self.parted().args(["set", "1", "legacy_boot", "on"]))
            .await;

        Ok(())
    }
}

/// A minimal GRUB configuration booting the installed kernel directly
///
/// The EFI system partition is mounted at `/boot`, so the kernel and initramfs live at the top
/// of the first partition.
fn standalone_config(root_argument: &str) -> String {
    format!(
        "\
        set root='hd0,gpt1'\n\
        linux /vmlinuz-linux root={root_argument} rw\n\
        initrd /initramfs-linux.img\n\
        boot\n\
        "
    )
}
