/*! Running external tools

A [`CommandRunner`] turns an [`InstallCommand`] into a verdict while streaming every line the
process prints to a [`Feedback`] sink. It never returns an error: failing to spawn or read from a
process is logged and reported as a failed command.
*/
use std::process::{ExitStatus, Stdio};

use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, Lines};

use crate::{feedback::Feedback, InstallCommand};

/// Whether a nonzero exit status counts as a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// A nonzero exit status is logged and reported as a failure
    MustSucceed,
    /// The command is reported as successful whatever its exit status
    BestEffort,
}

/// Executes external commands on behalf of the stages
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /** Run `command`, forwarding its combined output to `feedback` line by line

    Returns `true` if the process exited successfully, or for any outcome when `strictness` is
    [`Strictness::BestEffort`].
    */
    async fn run(
        &self,
        command: &InstallCommand,
        strictness: Strictness,
        feedback: &dyn Feedback,
    ) -> bool;

    /** Run `command` and return its standard output

    Standard error is still forwarded to `feedback`. Returns `None` if the command could not be
    run or exited unsuccessfully.
    */
    async fn capture(&self, command: &InstallCommand, feedback: &dyn Feedback) -> Option<String>;
}

/// Runs commands as child processes of the installer
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait::async_trait]
impl CommandRunner for ProcessRunner {
    #[tracing::instrument(level = "debug", skip_all, fields(command = %command))]
    async fn run(
        &self,
        command: &InstallCommand,
        strictness: Strictness,
        feedback: &dyn Feedback,
    ) -> bool {
        feedback.log(&format!("Executing: {command}"));
        let status = match spawn_and_stream(command, feedback, None).await {
            Ok(status) => status,
            Err(err) => {
                tracing::debug!(%err, "Command execution error");
                feedback.log(&format!("Command execution error: {err}"));
                return false;
            },
        };

        if strictness == Strictness::MustSucceed && !status.success() {
            feedback.log(&format!(
                "Command failed with return code {}",
                describe_status(status)
            ));
            return false;
        }

        true
    }

    #[tracing::instrument(level = "debug", skip_all, fields(command = %command))]
    async fn capture(&self, command: &InstallCommand, feedback: &dyn Feedback) -> Option<String> {
        feedback.log(&format!("Executing: {command}"));
        let mut stdout = String::new();
        match spawn_and_stream(command, feedback, Some(&mut stdout)).await {
            Ok(status) if status.success() => Some(stdout),
            Ok(status) => {
                feedback.log(&format!(
                    "Command failed with return code {}",
                    describe_status(status)
                ));
                None
            },
            Err(err) => {
                tracing::debug!(%err, "Command execution error");
                feedback.log(&format!("Command execution error: {err}"));
                None
            },
        }
    }
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => code.to_string(),
        None => format!("none ({status})"),
    }
}

/// Spawn `command` and pump its output until it exits
///
/// If `captured_stdout` is set standard output is collected there instead of being logged.
async fn spawn_and_stream(
    command: &InstallCommand,
    feedback: &dyn Feedback,
    mut captured_stdout: Option<&mut String>,
) -> std::io::Result<ExitStatus> {
    let mut child = command
        .to_tokio()
        .process_group(0)
        .stdin(match command.get_stdin() {
            Some(_) => Stdio::piped(),
            None => Stdio::null(),
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let mut group = ProcessGroup::new(child.id());

    if let (Some(input), Some(mut stdin)) = (command.get_stdin(), child.stdin.take()) {
        stdin.write_all(input.as_bytes()).await?;
        stdin.shutdown().await?;
    }

    let mut stdout = child.stdout.take().map(|v| BufReader::new(v).lines());
    let mut stderr = child.stderr.take().map(|v| BufReader::new(v).lines());

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            line = next_line(&mut stdout), if stdout.is_some() => match line? {
                Some(line) => match captured_stdout.as_deref_mut() {
                    Some(buf) => {
                        buf.push_str(&line);
                        buf.push('\n');
                    },
                    None => forward(&line, feedback),
                },
                None => stdout = None,
            },
            line = next_line(&mut stderr), if stderr.is_some() => match line? {
                Some(line) => forward(&line, feedback),
                None => stderr = None,
            },
        }
    }

    let status = child.wait().await;
    group.disarm();
    status
}

/// Kills the process group led by a child when dropped, unless the child was waited for
///
/// The child is spawned with `process_group(0)`, so its group id is its pid. Killing the group
/// also takes down whatever the child started, like the `pacman` processes of `pacstrap`.
struct ProcessGroup(Option<Pid>);

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self(pid.and_then(|pid| i32::try_from(pid).ok()).map(Pid::from_raw))
    }

    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pgid) = self.0.take() {
            tracing::debug!(%pgid, "Killing process group");
            if let Err(err) = killpg(pgid, Signal::SIGKILL) {
                tracing::debug!(%pgid, %err, "Killing process group failed");
            }
        }
    }
}

async fn next_line<R>(lines: &mut Option<Lines<BufReader<R>>>) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => Ok(None),
    }
}

fn forward(line: &str, feedback: &dyn Feedback) {
    let line = line.trim();
    if !line.is_empty() {
        tracing::trace!(line, "Output");
        feedback.log(line);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::feedback::{channel::ChannelFeedback, InstallEvent};

    fn logged(mut receiver: tokio::sync::mpsc::UnboundedReceiver<InstallEvent>) -> Vec<String> {
        let mut lines = vec![];
        while let Ok(event) = receiver.try_recv() {
            if let InstallEvent::Log { line } = event {
                lines.push(line);
            }
        }
        lines
    }

    #[tokio::test]
    async fn streams_stdout_and_stderr() {
        let (feedback, receiver) = ChannelFeedback::new();
        let command = InstallCommand::new("sh").args(["-c", "echo out; echo; echo '  err  ' >&2"]);
        assert!(ProcessRunner.run(&command, Strictness::MustSucceed, &feedback).await);

        let lines = logged(receiver);
        assert_eq!(lines[0], "Executing: sh -c 'echo out; echo; echo '\\''  err  '\\'' >&2'");
        assert!(lines.contains(&"out".to_string()));
        assert!(lines.contains(&"err".to_string()));
        assert_eq!(lines.len(), 3, "empty lines are dropped: {lines:?}");
    }

    #[tokio::test]
    async fn nonzero_exit_fails_only_when_strict() {
        let (feedback, receiver) = ChannelFeedback::new();
        let command = InstallCommand::new("sh").args(["-c", "exit 3"]);
        assert!(!ProcessRunner.run(&command, Strictness::MustSucceed, &feedback).await);
        assert!(ProcessRunner.run(&command, Strictness::BestEffort, &feedback).await);

        let lines = logged(receiver);
        assert!(lines.contains(&"Command failed with return code 3".to_string()));
    }

    #[tokio::test]
    async fn spawn_failure_is_a_failed_command() {
        let (feedback, receiver) = ChannelFeedback::new();
        let command = InstallCommand::new("/nonexistent/kuns-installer-test-binary");
        assert!(!ProcessRunner.run(&command, Strictness::MustSucceed, &feedback).await);
        assert!(!ProcessRunner.run(&command, Strictness::BestEffort, &feedback).await);

        let lines = logged(receiver);
        assert!(lines
            .iter()
            .any(|line| line.starts_with("Command execution error:")));
    }

    #[tokio::test]
    async fn capture_returns_stdout() {
        let (feedback, receiver) = ChannelFeedback::new();
        let command = InstallCommand::new("sh").args(["-c", "echo UUID=1234; echo noise >&2"]);
        let stdout = ProcessRunner.capture(&command, &feedback).await;
        assert_eq!(stdout.as_deref(), Some("UUID=1234\n"));
        assert!(logged(receiver).contains(&"noise".to_string()));

        let (feedback, _receiver) = ChannelFeedback::new();
        let command = InstallCommand::new("sh").args(["-c", "echo partial; exit 1"]);
        assert_eq!(ProcessRunner.capture(&command, &feedback).await, None);
    }

    /// Whether `pid` is still running, zombies count as dead
    fn is_running(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn dropping_a_run_kills_the_process_group() -> eyre::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let pid_file = temp_dir.path().join("grandchild.pid");
        let (feedback, _receiver) = ChannelFeedback::new();
        let command = InstallCommand::new("sh").args([
            "-c".to_string(),
            format!("sleep 30 & echo $! > {}; wait", pid_file.display()),
        ]);

        let started = async {
            loop {
                if let Ok(pid) = tokio::fs::read_to_string(&pid_file).await {
                    if let Ok(pid) = pid.trim().parse::<i32>() {
                        return pid;
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        };

        let grandchild = tokio::select! {
            _ = ProcessRunner.run(&command, Strictness::MustSucceed, &feedback) => {
                panic!("`sleep 30` finished before being cancelled")
            },
            pid = started => pid,
        };

        let mut attempts = 0;
        while is_running(grandchild) && attempts < 200 {
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            attempts += 1;
        }
        assert!(!is_running(grandchild), "grandchild {grandchild} survived");
        Ok(())
    }

    #[tokio::test]
    async fn stdin_is_fed() {
        let (feedback, receiver) = ChannelFeedback::new();
        let command = InstallCommand::new("cat").stdin("root:hunter2\n");
        assert!(ProcessRunner.run(&command, Strictness::MustSucceed, &feedback).await);
        assert!(logged(receiver).contains(&"root:hunter2".to_string()));
    }
}
