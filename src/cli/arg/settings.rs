use std::{path::PathBuf, time::Duration};

use clap::ArgAction;
use eyre::{eyre, WrapErr};

use crate::{settings::DEFAULT_MOUNT_POINT, InstallOptions, InstallSettings, Secret};

/// Settings of the system to install, from flags, the environment or a JSON file
#[derive(Debug, Clone, clap::Args)]
pub struct SettingsArgs {
    /// A JSON file holding the settings, flags override its values
    #[clap(long, env = "KUNS_INSTALLER_CONFIG")]
    pub config: Option<PathBuf>,

    /// The disk to install to, all of its data is erased (e.g. `/dev/sda`, `/dev/nvme0n1`)
    #[clap(long, env = "KUNS_INSTALLER_DISK")]
    pub disk: Option<PathBuf>,

    /// The hostname of the installed system
    #[clap(long, env = "KUNS_INSTALLER_HOSTNAME")]
    pub hostname: Option<String>,

    /// The regular user to create, member of `wheel`
    #[clap(long, env = "KUNS_INSTALLER_USERNAME")]
    pub username: Option<String>,

    /// The password of the regular user
    #[clap(long, env = "KUNS_INSTALLER_PASSWORD", hide_env_values = true)]
    pub password: Option<Secret>,

    /// The password of `root`
    #[clap(long, env = "KUNS_INSTALLER_ROOT_PASSWORD", hide_env_values = true)]
    pub root_password: Option<Secret>,

    /// The console keymap (e.g. `us`, `de-latin1`)
    #[clap(long, env = "KUNS_INSTALLER_KEYMAP")]
    pub keymap: Option<String>,

    /// The timezone, as a path below `/usr/share/zoneinfo` (e.g. `Europe/Berlin`)
    #[clap(long, env = "KUNS_INSTALLER_TIMEZONE")]
    pub timezone: Option<String>,

    /// The system locale (e.g. `de_DE.UTF-8`)
    #[clap(long, env = "KUNS_INSTALLER_LOCALE")]
    pub locale: Option<String>,

    /// Additional package(s) to install, pass multiple times for multiple packages
    #[clap(
        long = "package",
        action = ArgAction::Append,
        env = "KUNS_INSTALLER_PACKAGES",
        value_delimiter = ','
    )]
    pub packages: Vec<String>,

    /// Where the target is mounted while installing
    #[clap(long, env = "KUNS_INSTALLER_MOUNT_POINT", default_value = DEFAULT_MOUNT_POINT)]
    pub mount_point: PathBuf,

    /// Seconds to wait for the kernel to expose new partitions
    #[clap(long, env = "KUNS_INSTALLER_PARTITION_SETTLE_TIMEOUT", default_value = "3")]
    pub partition_settle_timeout: u64,

    /// Leave the target mounted if the installation fails
    #[clap(
        long,
        env = "KUNS_INSTALLER_NO_CLEANUP_ON_FAILURE",
        action(ArgAction::SetTrue),
        default_value = "false"
    )]
    pub no_cleanup_on_failure: bool,
}

impl SettingsArgs {
    /// Merge the settings file (if any) with the flags, then validate the result
    pub async fn settings(&self) -> eyre::Result<InstallSettings> {
        let Self {
            config,
            disk,
            hostname,
            username,
            password,
            root_password,
            keymap,
            timezone,
            locale,
            packages,
            ..
        } = self;

        let mut settings = match (config, disk) {
            (Some(config), _) => InstallSettings::from_file(config)
                .await
                .wrap_err_with(|| format!("Loading settings from `{}`", config.display()))?,
            (None, Some(disk)) => InstallSettings::new(disk),
            (None, None) => {
                return Err(eyre!(
                    "No target disk given, pass `--disk` (see `kuns-installer list-disks`) or `--config`"
                ))
            },
        };

        if let Some(disk) = disk {
            settings.disk(disk);
        }
        if let Some(hostname) = hostname {
            settings.hostname(hostname);
        }
        if let Some(username) = username {
            settings.username(username);
        }
        if let Some(password) = password {
            settings.password(password.clone());
        }
        if let Some(root_password) = root_password {
            settings.root_password(root_password.clone());
        }
        if let Some(keymap) = keymap {
            settings.keymap(keymap);
        }
        if let Some(timezone) = timezone {
            settings.timezone(timezone);
        }
        if let Some(locale) = locale {
            settings.locale(locale);
        }
        settings.packages(packages.iter().cloned());

        settings.validate()?;
        Ok(settings)
    }

    pub fn options(&self) -> InstallOptions {
        let mut options = InstallOptions::default();
        options
            .mount_point(&self.mount_point)
            .settle_timeout(Duration::from_secs(self.partition_settle_timeout))
            .cleanup_on_failure(!self.no_cleanup_on_failure);
        options
    }
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct Harness {
        #[clap(flatten)]
        settings: SettingsArgs,
    }

    #[tokio::test]
    async fn flags_override_config_file() -> eyre::Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        let config = temp_dir.path().join("settings.json");
        tokio::fs::write(
            &config,
            r#"{ "disk": "/dev/sda", "hostname": "from-file", "packages": ["htop"] }"#,
        )
        .await?;

        let harness = Harness::try_parse_from([
            "harness".into(),
            "--config".into(),
            config.display().to_string(),
            "--hostname".into(),
            "from-flag".into(),
            "--package".into(),
            "git".into(),
        ])?;
        let settings = harness.settings.settings().await?;

        assert_eq!(settings.target_disk(), std::path::Path::new("/dev/sda"));
        assert_eq!(settings.hostname, "from-flag");
        assert_eq!(
            settings.selected_packages().iter().collect::<Vec<_>>(),
            ["git", "htop"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn disk_is_required() -> eyre::Result<()> {
        let harness = Harness::try_parse_from(["harness", "--hostname", "box"])?;
        assert!(harness.settings.settings().await.is_err());
        Ok(())
    }

    #[test]
    fn options_from_flags() -> eyre::Result<()> {
        let harness = Harness::try_parse_from([
            "harness",
            "--mount-point",
            "/target",
            "--partition-settle-timeout",
            "10",
            "--no-cleanup-on-failure",
        ])?;
        let mut expected = InstallOptions::default();
        expected
            .mount_point("/target")
            .settle_timeout(Duration::from_secs(10))
            .cleanup_on_failure(false);
        assert_eq!(harness.settings.options(), expected);
        Ok(())
    }
}
