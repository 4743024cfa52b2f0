/*! Configurable knobs and their related errors

[`InstallSettings`] is the single validated configuration value a frontend hands to an
[`InstallPlan`](crate::InstallPlan). [`InstallOptions`] carries the knobs of the orchestrator itself
which are not a property of the system being installed.
*/
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::KunsInstallerError;

/// Default [`hostname`](InstallSettings::hostname)
pub const DEFAULT_HOSTNAME: &str = "kuns-os";
/// Default [`username`](InstallSettings::username)
pub const DEFAULT_USERNAME: &str = "kunsos";
/// Default [`keymap`](InstallSettings::keymap)
pub const DEFAULT_KEYMAP: &str = "us";
/// Default [`timezone`](InstallSettings::timezone)
pub const DEFAULT_TIMEZONE: &str = "UTC";
/// Default [`locale`](InstallSettings::locale), also always enabled as a fallback
pub const DEFAULT_LOCALE: &str = "en_US.UTF-8";
/// Default [`mount_point`](InstallOptions::mount_point)
pub const DEFAULT_MOUNT_POINT: &str = "/mnt";

const MAX_USERNAME_LEN: usize = 32;
const MAX_HOSTNAME_LEN: usize = 253;
const MAX_HOSTNAME_LABEL_LEN: usize = 63;

/// A string which must never end up in logs, such as a password
#[derive(Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.is_empty() {
            true => write!(f, "<empty>"),
            false => write!(f, "********"),
        }
    }
}

impl FromStr for Secret {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

/** The configuration of the system to install

Assembled once before the run starts and read-only afterwards. An empty
[`password`](InstallSettings::password) or [`root_password`](InstallSettings::root_password) skips
the corresponding account setup.
*/
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct InstallSettings {
    pub(crate) disk: PathBuf,
    #[serde(default = "default_hostname")]
    pub(crate) hostname: String,
    #[serde(default = "default_username")]
    pub(crate) username: String,
    #[serde(default)]
    pub(crate) password: Secret,
    #[serde(default)]
    pub(crate) root_password: Secret,
    #[serde(default = "default_keymap")]
    pub(crate) keymap: String,
    #[serde(default = "default_timezone")]
    pub(crate) timezone: String,
    #[serde(default = "default_locale")]
    pub(crate) locale: String,
    #[serde(default)]
    pub(crate) packages: BTreeSet<String>,
}

fn default_hostname() -> String {
    DEFAULT_HOSTNAME.into()
}
fn default_username() -> String {
    DEFAULT_USERNAME.into()
}
fn default_keymap() -> String {
    DEFAULT_KEYMAP.into()
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.into()
}
fn default_locale() -> String {
    DEFAULT_LOCALE.into()
}

impl InstallSettings {
    /// Settings targeting `disk` with every other field at its default
    pub fn new(disk: impl Into<PathBuf>) -> Self {
        Self {
            disk: disk.into(),
            hostname: default_hostname(),
            username: default_username(),
            password: Secret::default(),
            root_password: Secret::default(),
            keymap: default_keymap(),
            timezone: default_timezone(),
            locale: default_locale(),
            packages: BTreeSet::new(),
        }
    }

    /// Read settings from a JSON file
    #[tracing::instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, KunsInstallerError> {
        let path = path.as_ref();
        let buf = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| KunsInstallerError::ReadSettings(path.to_path_buf(), e))?;
        Ok(serde_json::from_str(&buf)?)
    }

    pub fn disk(&mut self, disk: impl Into<PathBuf>) -> &mut Self {
        self.disk = disk.into();
        self
    }

    pub fn hostname(&mut self, hostname: impl Into<String>) -> &mut Self {
        self.hostname = hostname.into();
        self
    }

    pub fn username(&mut self, username: impl Into<String>) -> &mut Self {
        self.username = username.into();
        self
    }

    pub fn password(&mut self, password: impl Into<Secret>) -> &mut Self {
        self.password = password.into();
        self
    }

    pub fn root_password(&mut self, root_password: impl Into<Secret>) -> &mut Self {
        self.root_password = root_password.into();
        self
    }

    pub fn keymap(&mut self, keymap: impl Into<String>) -> &mut Self {
        self.keymap = keymap.into();
        self
    }

    pub fn timezone(&mut self, timezone: impl Into<String>) -> &mut Self {
        self.timezone = timezone.into();
        self
    }

    pub fn locale(&mut self, locale: impl Into<String>) -> &mut Self {
        self.locale = locale.into();
        self
    }

    pub fn packages(&mut self, packages: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.packages.extend(packages.into_iter().map(Into::into));
        self
    }

    pub fn target_disk(&self) -> &Path {
        &self.disk
    }

    pub fn selected_packages(&self) -> &BTreeSet<String> {
        &self.packages
    }

    /// Check every field is shaped so it can be passed to an external tool as a single argument
    ///
    /// Empty passwords are accepted here, see [`require_credentials`](Self::require_credentials).
    pub fn validate(&self) -> Result<(), InstallSettingsError> {
        if !self.disk.is_absolute() {
            return Err(InstallSettingsError::DiskNotAbsolute(self.disk.clone()));
        }
        if self.disk.to_str().is_none() {
            return Err(InstallSettingsError::DiskNotUtf8(self.disk.clone()));
        }
        if !is_valid_hostname(&self.hostname) {
            return Err(InstallSettingsError::InvalidHostname(self.hostname.clone()));
        }
        if !is_valid_username(&self.username) {
            return Err(InstallSettingsError::InvalidUsername(self.username.clone()));
        }
        if !is_valid_timezone(&self.timezone) {
            return Err(InstallSettingsError::InvalidTimezone(self.timezone.clone()));
        }
        if !is_valid_token(&self.keymap, |c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
        }) {
            return Err(InstallSettingsError::InvalidKeymap(self.keymap.clone()));
        }
        if !is_valid_token(&self.locale, |c| {
            c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@')
        }) {
            return Err(InstallSettingsError::InvalidLocale(self.locale.clone()));
        }
        for package in &self.packages {
            if !is_valid_package(package) {
                return Err(InstallSettingsError::InvalidPackage(package.clone()));
            }
        }
        for (field, secret) in [
            ("password", &self.password),
            ("root_password", &self.root_password),
        ] {
            if secret.expose().contains(['\n', '\r', '\0']) {
                return Err(InstallSettingsError::InvalidPassword(field));
            }
        }
        Ok(())
    }

    /// Interactive frontends require both the user and the root password to be set
    pub fn require_credentials(&self) -> Result<(), InstallSettingsError> {
        if self.password.is_empty() {
            return Err(InstallSettingsError::MissingPassword("password"));
        }
        if self.root_password.is_empty() {
            return Err(InstallSettingsError::MissingPassword("root_password"));
        }
        Ok(())
    }

    /// The user-visible settings, passwords redacted
    pub fn describe(&self) -> Vec<(&'static str, String)> {
        let Self {
            disk,
            hostname,
            username,
            password,
            root_password,
            keymap,
            timezone,
            locale,
            packages,
        } = self;
        vec![
            ("disk", disk.display().to_string()),
            ("hostname", hostname.clone()),
            ("username", username.clone()),
            ("password", password.to_string()),
            ("root_password", root_password.to_string()),
            ("keymap", keymap.clone()),
            ("timezone", timezone.clone()),
            ("locale", locale.clone()),
            (
                "packages",
                packages.iter().cloned().collect::<Vec<_>>().join(" "),
            ),
        ]
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

fn is_valid_token(value: &str, allowed: impl Fn(char) -> bool) -> bool {
    !value.is_empty() && !value.starts_with('-') && value.chars().all(allowed)
}

fn is_valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    hostname.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_HOSTNAME_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

fn is_valid_username(username: &str) -> bool {
    let mut chars = username.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    username.len() <= MAX_USERNAME_LEN
        && (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
}

fn is_valid_timezone(timezone: &str) -> bool {
    is_valid_token(timezone, |c| {
        c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '+' | '-')
    }) && timezone
        .split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

fn is_valid_package(package: &str) -> bool {
    !package.starts_with('.')
        && is_valid_token(package, |c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '@' | '.' | '_' | '+' | '-')
        })
}

/** Knobs of the orchestrator itself
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    pub(crate) mount_point: PathBuf,
    pub(crate) settle_timeout: Duration,
    pub(crate) cleanup_on_failure: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from(DEFAULT_MOUNT_POINT),
            settle_timeout: Duration::from_secs(3),
            cleanup_on_failure: true,
        }
    }
}

impl InstallOptions {
    /// Where the root filesystem of the target is mounted, the EFI partition is nested at `<mount_point>/boot`
    pub fn mount_point(&mut self, mount_point: impl Into<PathBuf>) -> &mut Self {
        self.mount_point = mount_point.into();
        self
    }

    /// How long to wait for the kernel to expose freshly created partition device nodes
    pub fn settle_timeout(&mut self, settle_timeout: Duration) -> &mut Self {
        self.settle_timeout = settle_timeout;
        self
    }

    /// Unmount the target after a failure once mounting has been attempted
    pub fn cleanup_on_failure(&mut self, cleanup_on_failure: bool) -> &mut Self {
        self.cleanup_on_failure = cleanup_on_failure;
        self
    }
}

/// An error originating from [`InstallSettings`]
#[non_exhaustive]
#[derive(thiserror::Error, Debug, strum::IntoStaticStr)]
pub enum InstallSettingsError {
    #[error("Target disk `{0}` must be an absolute path")]
    DiskNotAbsolute(PathBuf),
    #[error("Target disk `{0}` must be valid UTF-8")]
    DiskNotUtf8(PathBuf),
    #[error("`{0}` is not a valid hostname")]
    InvalidHostname(String),
    #[error("`{0}` is not a valid username, use lowercase letters, digits, `_` and `-`")]
    InvalidUsername(String),
    #[error("`{0}` is not a valid timezone")]
    InvalidTimezone(String),
    #[error("`{0}` is not a valid keymap")]
    InvalidKeymap(String),
    #[error("`{0}` is not a valid locale")]
    InvalidLocale(String),
    #[error("`{0}` is not a valid package name")]
    InvalidPackage(String),
    #[error("`{0}` may not contain line breaks or NUL bytes")]
    InvalidPassword(&'static str),
    #[error("`{0}` must not be empty")]
    MissingPassword(&'static str),
}
