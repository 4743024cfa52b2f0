use std::sync::Arc;

use owo_colors::OwoColorize;
use tokio::{
    sync::broadcast::{
        self,
        error::{RecvError, TryRecvError},
        Receiver, Sender,
    },
    task::JoinHandle,
};

use crate::{
    feedback::{Feedback, FinishOnce},
    layout::{MountTopology, PartitionLayout},
    runner::CommandRunner,
    settings::{InstallOptions, InstallSettings},
    stage::{
        BaseInstall, Bootloader, Cleanup, Configure, DiskPrep, Filesystems, Fstab, Mount, Stage,
        StageContext, StageDescription, StageError, StageErrorKind, StageKind, StageState,
        StatefulStage,
    },
    KunsInstallerError,
};

/// Status published once every stage completed
pub const SUCCESS_STATUS: &str = "Installation completed successfully!";
/// Terminal message of a successful run
pub const SUCCESS_MESSAGE: &str = "Kuns OS installation completed successfully!";
/// Terminal message of a cancelled run
pub const CANCELLED_MESSAGE: &str = "Installation cancelled by user";

/// The terminal result of a run, exactly one is produced per run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success {
        message: String,
    },
    /// `stage` is `None` only if the worker running the plan died
    Failure {
        stage: Option<StageKind>,
        message: String,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            RunOutcome::Success { message } | RunOutcome::Failure { message, .. } => message,
        }
    }

    pub fn failed_stage(&self) -> Option<StageKind> {
        match self {
            RunOutcome::Success { .. } => None,
            RunOutcome::Failure { stage, .. } => *stage,
        }
    }
}

/**
The eight [`Stage`]s of an installation, along with the settings they were planned from, which
can be carried out to drive an install
*/
#[derive(Debug)]
pub struct InstallPlan {
    settings: InstallSettings,
    options: InstallOptions,
    topology: MountTopology,
    stages: Vec<StatefulStage<Box<dyn Stage>>>,
    layout: Option<PartitionLayout>,
}

impl InstallPlan {
    #[tracing::instrument(level = "debug", skip_all, fields(disk = %settings.disk.display()))]
    pub fn new(settings: InstallSettings, options: InstallOptions) -> Self {
        let stages = vec![
            DiskPrep::plan(settings.disk.clone(), options.settle_timeout).boxed(),
            Filesystems::plan(settings.disk.clone()).boxed(),
            Mount::plan().boxed(),
            BaseInstall::plan(&settings.packages).boxed(),
            Fstab::plan().boxed(),
            Configure::plan(&settings).boxed(),
            Bootloader::plan(settings.disk.clone()).boxed(),
            Cleanup::plan().boxed(),
        ];

        Self {
            topology: MountTopology::new(options.mount_point.clone()),
            settings,
            options,
            stages,
            layout: None,
        }
    }

    pub fn settings(&self) -> &InstallSettings {
        &self.settings
    }

    pub fn topology(&self) -> &MountTopology {
        &self.topology
    }

    pub fn stages(&self) -> &[StatefulStage<Box<dyn Stage>>] {
        &self.stages
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub fn describe_install(&self, explain: bool) -> String {
        let Self {
            settings,
            topology,
            stages,
            ..
        } = self;

        let plan_settings = settings
            .describe()
            .into_iter()
            .map(|(k, v)| format!("* {k}: {v}", k = k.bold()))
            .collect::<Vec<_>>();

        format!(
            "\
            Kuns OS install plan (v{version})\n\
            \n\
            Configured settings:\n\
            {plan_settings}\n\
            \n\
            Planned stages (mounted at `{mount_point}`):\n\
            {stages}\n\
            \n\
            {warning}\n\
        ",
            version = env!("CARGO_PKG_VERSION"),
            plan_settings = plan_settings.join("\n"),
            mount_point = topology.root().display(),
            stages = stages
                .iter()
                .flat_map(|v| v.describe_execute())
                .map(|desc| {
                    let StageDescription {
                        description,
                        explanation,
                    } = desc;

                    let mut buf = String::default();
                    buf.push_str(&format!("* {description}"));
                    if explain {
                        for line in explanation {
                            buf.push_str(&format!("\n  {line}"));
                        }
                    }
                    buf
                })
                .collect::<Vec<_>>()
                .join("\n"),
            warning = format!(
                "All data on `{}` will be permanently deleted!",
                settings.disk.display()
            )
            .red()
            .bold(),
        )
    }

    /**
    Run every stage in order, publishing progress, status and log lines to `feedback`

    Exactly one [`finished`](Feedback::finished) event is published. The first failing stage ends
    the run; if mounting was already attempted the target is unmounted again (unless disabled with
    [`InstallOptions::cleanup_on_failure`]). A message on `cancel_channel` ends the run at the next
    opportunity, killing the command in flight.
    */
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn install(
        &mut self,
        runner: &dyn CommandRunner,
        feedback: &dyn Feedback,
        cancel_channel: impl Into<Option<Receiver<()>>>,
    ) -> RunOutcome {
        let feedback = FinishOnce::new(feedback);
        let mut cancel_channel = cancel_channel.into();

        feedback.status("Starting installation...");
        feedback.progress(0);

        let outcome = self.run_stages(runner, &feedback, &mut cancel_channel).await;

        match &outcome {
            RunOutcome::Success { message } => {
                tracing::info!("{message}");
                feedback.status(SUCCESS_STATUS);
                feedback.finished(true, message);
            },
            RunOutcome::Failure { message, .. } => {
                tracing::error!("{message}");
                feedback.finished(false, message);
            },
        }

        outcome
    }

    async fn run_stages(
        &mut self,
        runner: &dyn CommandRunner,
        feedback: &dyn Feedback,
        cancel_channel: &mut Option<Receiver<()>>,
    ) -> RunOutcome {
        let Self {
            stages,
            topology,
            options,
            layout,
            ..
        } = self;

        let mut ctx = StageContext::new(runner, feedback, topology);
        if let Some(layout) = layout.clone() {
            ctx.set_layout(layout);
        }

        let mut mount_attempted = false;
        let mut failure = None;

        // This is **deliberately sequential**.
        // Each stage relies on the side effects of the previous one being complete.
        for stage in stages.iter_mut() {
            let kind = stage.kind();

            if let Some(cancel_channel) = cancel_channel.as_mut() {
                if is_cancelled(cancel_channel) {
                    failure = Some(StageError::new(kind, StageErrorKind::Cancelled));
                    break;
                }
            }

            if stage.state() != StageState::Completed {
                feedback.status(kind.status());
                tracing::info!("Step: {}", stage.tracing_synopsis());
            }
            mount_attempted |= kind >= StageKind::Mount;

            let result = tokio::select! {
                result = stage.try_execute(&mut ctx) => result,
                _ = cancelled(cancel_channel) => {
                    Err(StageError::new(kind, StageErrorKind::Cancelled))
                },
            };

            match result {
                Ok(()) => feedback.progress(kind.checkpoint()),
                Err(err) => {
                    failure = Some(err);
                    break;
                },
            }
        }

        *layout = ctx.layout().ok().cloned();

        let Some(err) = failure else {
            return RunOutcome::Success {
                message: SUCCESS_MESSAGE.to_string(),
            };
        };

        let kind = err.stage();
        let message = match err.kind() {
            StageErrorKind::Cancelled => CANCELLED_MESSAGE.to_string(),
            reason => format!("{}: {reason}", kind.failure_message()),
        };
        tracing::error!(stage = %kind, error = ?err, "Stage failed");
        feedback.log(&format!("Installation error: {message}"));

        if options.cleanup_on_failure && mount_attempted && kind != StageKind::Cleanup {
            Cleanup::unmount(&ctx).await;
            // Everything written to the target stays on its partitions, only the mounts are gone
            for stage in stages.iter_mut().filter(|v| v.kind() == StageKind::Mount) {
                stage.reset();
            }
        }

        RunOutcome::Failure {
            stage: Some(kind),
            message,
        }
    }

    /**
    Run the plan on a dedicated worker task

    The caller stays free to request cancellation through [`InstallHandle::cancel`]. A worker which
    dies without reporting is turned into a [`RunOutcome::Failure`] by [`InstallHandle::wait`].
    */
    pub fn spawn(
        mut self,
        runner: Arc<dyn CommandRunner>,
        feedback: Arc<dyn Feedback>,
    ) -> InstallHandle {
        let feedback = Arc::new(FinishOnce::new(feedback));
        let worker_feedback = feedback.clone();
        let (cancel, cancel_channel) = broadcast::channel(1);

        let join = tokio::spawn(async move {
            self.install(runner.as_ref(), worker_feedback.as_ref(), cancel_channel)
                .await
        });

        InstallHandle {
            join,
            feedback,
            cancel,
        }
    }
}

/// Whether a cancellation was requested, without waiting
fn is_cancelled(cancel_channel: &mut Receiver<()>) -> bool {
    match cancel_channel.try_recv() {
        Ok(()) | Err(TryRecvError::Lagged(_)) => true,
        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => false,
    }
}

/// Resolves once a cancellation is requested, never if there is no one left to request it
async fn cancelled(cancel_channel: &mut Option<Receiver<()>>) {
    if let Some(cancel_channel) = cancel_channel {
        loop {
            match cancel_channel.recv().await {
                Ok(()) | Err(RecvError::Lagged(_)) => return,
                Err(RecvError::Closed) => break,
            }
        }
    }
    std::future::pending::<()>().await
}

/// A plan running on its own worker, see [`InstallPlan::spawn`]
pub struct InstallHandle {
    join: JoinHandle<RunOutcome>,
    feedback: Arc<FinishOnce<Arc<dyn Feedback>>>,
    cancel: Sender<()>,
}

impl InstallHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Ask the worker to stop, killing the command in flight
    pub fn cancel(&self) {
        if self.cancel.send(()).is_err() {
            tracing::debug!("Installation already ended, nothing to cancel");
        }
    }

    /// A sender to request cancellation from elsewhere, for example a signal handler
    pub fn cancel_sender(&self) -> Sender<()> {
        self.cancel.clone()
    }

    /// Wait for the run to end
    pub async fn wait(self) -> RunOutcome {
        let Self { join, feedback, .. } = self;
        match join.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                let detail = join_error.to_string();
                let err = KunsInstallerError::Worker(join_error);
                tracing::error!(error = ?err, "{detail}");
                let message = format!("Installation error: {err}: {detail}");
                feedback.log(&message);
                feedback.finished(false, &message);
                RunOutcome::Failure {
                    stage: None,
                    message,
                }
            },
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::*;

    #[test]
    fn plans_stages_in_order() {
        let plan = InstallPlan::new(
            InstallSettings::new("/dev/sda"),
            InstallOptions::default(),
        );
        let kinds = plan.stages().iter().map(|v| v.kind()).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                StageKind::DiskPrep,
                StageKind::Filesystems,
                StageKind::Mount,
                StageKind::BaseInstall,
                StageKind::Fstab,
                StageKind::Configure,
                StageKind::Bootloader,
                StageKind::Cleanup,
            ]
        );
        assert_eq!(plan.topology().root(), Path::new("/mnt"));
    }

    #[test]
    fn describe_install_redacts_passwords() {
        let mut settings = InstallSettings::new("/dev/nvme0n1");
        settings.password("hunter2").root_password("hunter3");
        let plan = InstallPlan::new(settings, InstallOptions::default());
        let description = plan.describe_install(true);
        assert!(description.contains("/dev/nvme0n1p1"));
        assert!(description.contains("Set the root password"));
        assert!(!description.contains("hunter"));
    }

    #[tokio::test]
    async fn closed_cancel_channel_never_cancels() {
        let (sender, mut receiver) = tokio::sync::broadcast::channel::<()>(1);
        drop(sender);
        assert!(!is_cancelled(&mut receiver));
        let mut channel = Some(receiver);
        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            cancelled(&mut channel),
        )
        .await;
        assert!(timed_out.is_err());
    }
}
