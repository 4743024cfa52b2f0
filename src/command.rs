/*! External commands as argument vectors

Nothing the installer runs goes through a shell, values from [`InstallSettings`](crate::InstallSettings)
are always passed as single arguments.
*/
use std::{fmt, path::Path};

/// The chroot-execution wrapper used for every in-target command
pub const CHROOT_WRAPPER: &str = "arch-chroot";

/** A program, its arguments, and optionally data fed to its standard input

The standard input payload typically carries credentials, it is never rendered by
[`Display`](fmt::Display) or [`Debug`].
*/
#[derive(Clone, PartialEq, Eq)]
pub struct InstallCommand {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
}

impl InstallCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    /// Run `program` inside the system mounted at `root`
    pub fn chroot(root: &Path, program: impl Into<String>) -> Self {
        Self::new(CHROOT_WRAPPER)
            .arg(root.display().to_string())
            .arg(program)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    /// The program actually run inside the chroot, if this is a chrooted command
    pub fn chrooted_program(&self) -> Option<&str> {
        match self.program == CHROOT_WRAPPER {
            true => self.args.get(1).map(String::as_str),
            false => None,
        }
    }

    pub(crate) fn to_tokio(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for InstallCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

impl fmt::Debug for InstallCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn quote(value: &str) -> String {
    if !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '\\' | '$' | '`'))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chroot_wraps_program() {
        let command = InstallCommand::chroot(Path::new("/mnt"), "locale-gen");
        assert_eq!(command.program(), "arch-chroot");
        assert_eq!(command.get_args(), ["/mnt", "locale-gen"]);
        assert_eq!(command.chrooted_program(), Some("locale-gen"));
        assert_eq!(command.to_string(), "arch-chroot /mnt locale-gen");
    }

    #[test]
    fn display_quotes_awkward_arguments() {
        let command = InstallCommand::new("echo").args(["two words", "it's", ""]);
        assert_eq!(command.to_string(), r"echo 'two words' 'it'\''s' ''");
    }

    #[test]
    fn stdin_is_never_rendered() {
        let command = InstallCommand::chroot(Path::new("/mnt"), "chpasswd").stdin("root:hunter2\n");
        assert_eq!(command.get_stdin(), Some("root:hunter2\n"));
        assert!(!command.to_string().contains("hunter2"));
        assert!(!format!("{command:?}").contains("hunter2"));
    }
}
