use std::path::Path;

use tracing::{span, Span};

use crate::{
    settings::{InstallSettings, Secret, DEFAULT_LOCALE},
    stage::{Stage, StageContext, StageDescription, StageError, StageKind, StatefulStage},
    util::{uncomment_lines, write_atomic, LineState},
    InstallCommand,
};

/// The sudoers rule letting members of `wheel` run any command
pub const SUDOERS_WHEEL_RULE: &str = "%wheel ALL=(ALL:ALL) ALL";
/// Supplementary group granting administrative rights
pub const ADMIN_GROUP: &str = "wheel";
/// Services enabled for the next boot
pub const ENABLED_SERVICES: &[(&str, &str)] =
    &[("NetworkManager", "NetworkManager"), ("LightDM", "lightdm")];

/**
Configure the installed system from inside a chroot: clock, locale, keyboard, hostname, accounts,
sudo and services

Sub-steps run in order and the stage aborts on the first failure.
*/
#[derive(Debug, Clone)]
pub struct Configure {
    hostname: String,
    username: String,
    password: Secret,
    root_password: Secret,
    keymap: String,
    timezone: String,
    locale: String,
}

impl Configure {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn plan(settings: &InstallSettings) -> StatefulStage<Self> {
        Self {
            hostname: settings.hostname.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            root_password: settings.root_password.clone(),
            keymap: settings.keymap.clone(),
            timezone: settings.timezone.clone(),
            locale: settings.locale.clone(),
        }
        .into()
    }

    fn creates_user(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn set_timezone(&self, ctx: &StageContext<'_>) -> Result<(), StageError> {
        let root = ctx.topology().root();
        ctx.log(format!("Setting timezone to {}", self.timezone));
        ctx.must_succeed(InstallCommand::chroot(root, "ln").args([
            "-sf".to_string(),
            format!("/usr/share/zoneinfo/{}", self.timezone),
            "/etc/localtime".to_string(),
        ]))
        .await
        .map_err(Self::error)?;
        ctx.must_succeed(InstallCommand::chroot(root, "hwclock").arg("--systohc"))
            .await
            .map_err(Self::error)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn set_locale(&self, ctx: &StageContext<'_>) -> Result<(), StageError> {
        ctx.log(format!("Setting locale to {}", self.locale));
        let locale_gen = ctx.topology().target_path("/etc/locale.gen");

        let mut locales = vec![self.locale.as_str()];
        if self.locale != DEFAULT_LOCALE {
            locales.push(DEFAULT_LOCALE);
        }
        for locale in locales {
            if !enable_locale(&locale_gen, locale).await? {
                ctx.log(format!(
                    "Locale {locale} is not listed in /etc/locale.gen, it will not be generated"
                ));
            }
        }

        ctx.must_succeed(InstallCommand::chroot(ctx.topology().root(), "locale-gen"))
            .await
            .map_err(Self::error)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn write_config_files(&self, ctx: &StageContext<'_>) -> Result<(), StageError> {
        let Self {
            hostname,
            keymap,
            locale,
            ..
        } = self;
        let files = [
            ("/etc/locale.conf", format!("LANG={locale}\n")),
            ("/etc/vconsole.conf", format!("KEYMAP={keymap}\n")),
            ("/etc/hostname", format!("{hostname}\n")),
            ("/etc/hosts", hosts_file(hostname)),
        ];
        for (path, body) in files {
            write_atomic(&ctx.topology().target_path(path), &body)
                .await
                .map_err(Self::error)?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(username = %self.username))]
    async fn set_up_accounts(&self, ctx: &StageContext<'_>) -> Result<(), StageError> {
        let root = ctx.topology().root();

        if !self.root_password.is_empty() {
            ctx.log("Setting root password...");
            ctx.must_succeed(set_password(root, "root", &self.root_password))
                .await
                .map_err(Self::error)?;
        }

        if self.creates_user() {
            ctx.log(format!("Creating user {}...", self.username));
            ctx.must_succeed(InstallCommand::chroot(root, "useradd").args([
                "-m",
                "-G",
                ADMIN_GROUP,
                "-s",
                "/bin/bash",
                self.username.as_str(),
            ]))
            .await
            .map_err(Self::error)?;
            ctx.must_succeed(set_password(root, &self.username, &self.password))
                .await
                .map_err(Self::error)?;
        }

        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn configure_sudo(&self, ctx: &StageContext<'_>) -> Result<(), StageError> {
        ctx.log("Configuring sudo...");
        let sudoers = ctx.topology().target_path("/etc/sudoers");
        let enabled = uncomment_lines(&sudoers, |line| {
            if line == SUDOERS_WHEEL_RULE {
                return LineState::Enabled;
            }
            match line.strip_prefix('#').map(str::trim_start) {
                Some(SUDOERS_WHEEL_RULE) => LineState::Commented(SUDOERS_WHEEL_RULE.to_string()),
                _ => LineState::Unrelated,
            }
        })
        .await
        .map_err(Self::error)?;
        if !enabled {
            ctx.log(format!(
                "No `{SUDOERS_WHEEL_RULE}` rule found in /etc/sudoers, leaving it unchanged"
            ));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn enable_services(&self, ctx: &StageContext<'_>) -> Result<(), StageError> {
        for (name, unit) in ENABLED_SERVICES {
            ctx.log(format!("Enabling {name}..."));
            ctx.must_succeed(
                InstallCommand::chroot(ctx.topology().root(), "systemctl").args(["enable", unit]),
            )
            .await
            .map_err(Self::error)?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Stage for Configure {
    fn stage_kind() -> StageKind {
        StageKind::Configure
    }
    fn kind(&self) -> StageKind {
        Self::stage_kind()
    }
    fn tracing_synopsis(&self) -> String {
        format!("Configure `{}`", self.hostname)
    }

    fn tracing_span(&self) -> Span {
        span!(
            tracing::Level::DEBUG,
            "configure",
            hostname = %self.hostname,
            username = %self.username,
            timezone = %self.timezone,
            locale = %self.locale,
            keymap = %self.keymap,
        )
    }

    fn execute_description(&self) -> Vec<StageDescription> {
        let mut explanation = vec![
            format!("Set the timezone to `{}`", self.timezone),
            format!("Generate the `{}` locale", self.locale),
            format!("Set the keyboard layout to `{}`", self.keymap),
            format!("Set the hostname to `{}`", self.hostname),
        ];
        if !self.root_password.is_empty() {
            explanation.push("Set the root password".to_string());
        }
        if self.creates_user() {
            explanation.push(format!(
                "Create user `{}` in group `{ADMIN_GROUP}`",
                self.username
            ));
        }
        explanation.push(format!("Allow `{ADMIN_GROUP}` to use sudo"));
        explanation.extend(
            ENABLED_SERVICES
                .iter()
                .map(|(name, _)| format!("Enable {name}")),
        );
        vec![StageDescription::new(self.tracing_synopsis(), explanation)]
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn execute(&mut self, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        self.set_timezone(ctx).await?;
        self.set_locale(ctx).await?;
        self.write_config_files(ctx).await?;
        self.set_up_accounts(ctx).await?;
        self.configure_sudo(ctx).await?;
        self.enable_services(ctx).await?;
        Ok(())
    }
}

fn hosts_file(hostname: &str) -> String {
    format!(
        "\
        127.0.0.1\tlocalhost\n\
        ::1\t\tlocalhost\n\
        127.0.1.1\t{hostname}.localdomain\t{hostname}\n\
        "
    )
}

/// `chpasswd` reads `user:password` lines from standard input, so nothing secret is on the command line
fn set_password(root: &Path, user: &str, password: &Secret) -> InstallCommand {
    InstallCommand::chroot(root, "chpasswd").stdin(format!("{user}:{}\n", password.expose()))
}

async fn enable_locale(locale_gen: &Path, locale: &str) -> Result<bool, StageError> {
    uncomment_lines(locale_gen, |line| {
        let is_locale = |entry: &str| entry.split_whitespace().next() == Some(locale);
        if is_locale(line) {
            return LineState::Enabled;
        }
        match line.strip_prefix('#') {
            // `#  en_US ISO-8859-1` style lines are documentation
            Some(entry) if !entry.starts_with(char::is_whitespace) && is_locale(entry) => {
                LineState::Commented(entry.to_string())
            },
            _ => LineState::Unrelated,
        }
    })
    .await
    .map_err(Configure::error)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hosts_file_lists_hostname() {
        assert_eq!(
            hosts_file("kuns-os"),
            "127.0.0.1\tlocalhost\n::1\t\tlocalhost\n127.0.1.1\tkuns-os.localdomain\tkuns-os\n"
        );
    }

    #[test]
    fn passwords_go_through_stdin() {
        let command = set_password(Path::new("/mnt"), "kunsos", &Secret::new("hunter2"));
        assert_eq!(command.to_string(), "arch-chroot /mnt chpasswd");
        assert_eq!(command.get_stdin(), Some("kunsos:hunter2\n"));
    }

    #[tokio::test]
    async fn enables_only_exact_locale() -> eyre::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let locale_gen = temp_dir.path().join("locale.gen");
        tokio::fs::write(
            &locale_gen,
            "#  en_US.UTF-8 UTF-8\n#en_US ISO-8859-1\n#en_US.UTF-8 UTF-8\n#ko_KR.UTF-8 UTF-8\n",
        )
        .await?;

        assert!(enable_locale(&locale_gen, "en_US.UTF-8").await?);
        assert_eq!(
            tokio::fs::read_to_string(&locale_gen).await?,
            "#  en_US.UTF-8 UTF-8\n#en_US ISO-8859-1\nen_US.UTF-8 UTF-8\n#ko_KR.UTF-8 UTF-8\n"
        );
        assert!(!enable_locale(&locale_gen, "xx_XX.UTF-8").await?);
        Ok(())
    }
}
