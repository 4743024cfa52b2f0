use std::collections::BTreeSet;

use tracing::{span, Span};

use crate::{
    stage::{Stage, StageContext, StageDescription, StageError, StageKind, StatefulStage},
    InstallCommand,
};

/// Kernel, bootloader tools, and core utilities
pub const BASE_PACKAGES: &[&str] = &[
    "base",
    "base-devel",
    "linux",
    "linux-firmware",
    "networkmanager",
    "grub",
    "efibootmgr",
    "dosfstools",
    "mtools",
    "os-prober",
    "sudo",
    "nano",
    "vim",
];

/// The Kuns OS desktop and its default applications
pub const DESKTOP_PACKAGES: &[&str] = &[
    "enlightenment",
    "terminology",
    "lightdm",
    "lightdm-gtk-greeter",
    "firefox",
    "dolphin",
    "kate",
    "konsole",
    "gwenview",
    "nautilus",
    "gnome-calculator",
    "gnome-screenshot",
    "flatpak",
    "noto-fonts",
    "noto-fonts-cjk",
    "ttf-dejavu",
    "ttf-liberation",
];

/// The union of [`BASE_PACKAGES`], [`DESKTOP_PACKAGES`] and `selected`
pub fn package_set<'a>(selected: impl IntoIterator<Item = &'a String>) -> BTreeSet<String> {
    BASE_PACKAGES
        .iter()
        .chain(DESKTOP_PACKAGES)
        .map(|v| v.to_string())
        .chain(selected.into_iter().cloned())
        .collect()
}

/**
Bootstrap the base system, the desktop, and the user's selection into the mounted root with a
single `pacstrap` invocation
*/
#[derive(Debug, Clone)]
pub struct BaseInstall {
    packages: BTreeSet<String>,
}

impl BaseInstall {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn plan(selected: &BTreeSet<String>) -> StatefulStage<Self> {
        Self {
            packages: package_set(selected),
        }
        .into()
    }

    pub fn packages(&self) -> &BTreeSet<String> {
        &self.packages
    }
}

#[async_trait::async_trait]
impl Stage for BaseInstall {
    fn stage_kind() -> StageKind {
        StageKind::BaseInstall
    }
    fn kind(&self) -> StageKind {
        Self::stage_kind()
    }
    fn tracing_synopsis(&self) -> String {
        format!("Install {} packages with `pacstrap`", self.packages.len())
    }

    fn tracing_span(&self) -> Span {
        span!(
            tracing::Level::DEBUG,
            "base_install",
            packages = self.packages.len(),
        )
    }

    fn execute_description(&self) -> Vec<StageDescription> {
        vec![StageDescription::new(
            self.tracing_synopsis(),
            vec![self
                .packages
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(" ")],
        )]
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn execute(&mut self, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        let Self { packages } = self;

        ctx.log(format!(
            "Installing packages: {}",
            packages.iter().cloned().collect::<Vec<_>>().join(" ")
        ));
        ctx.must_succeed(
            InstallCommand::new("pacstrap")
                .arg(ctx.topology().root().display().to_string())
                .args(packages.iter()),
        )
        .await
        .map_err(Self::error)?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn package_set_is_a_union() {
        let selected = BTreeSet::from(["code".to_string(), "vim".to_string(), "gimp".to_string()]);
        let packages = package_set(&selected);
        assert_eq!(
            packages.len(),
            BASE_PACKAGES.len() + DESKTOP_PACKAGES.len() + 2,
            "`vim` is already a base package"
        );
        assert!(packages.contains("code"));
        assert!(packages.contains("linux"));
        assert!(packages.contains("lightdm"));
    }

    #[test]
    fn defaults_do_not_overlap() {
        let base = BASE_PACKAGES.iter().collect::<BTreeSet<_>>();
        assert_eq!(base.len(), BASE_PACKAGES.len());
        assert!(DESKTOP_PACKAGES.iter().all(|v| !base.contains(v)));
    }
}
