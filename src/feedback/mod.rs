/*! Observers of an installation run

An [`InstallPlan`](crate::InstallPlan) publishes everything it does to a [`Feedback`] sink: the
progress percentage, a human-readable status for the current stage, every line of subprocess
output, and finally exactly one terminal outcome.
*/
pub mod channel;
pub mod console;
pub mod devnull;

use std::sync::atomic::{AtomicBool, Ordering};

/// A subscriber to the events of an installation run
pub trait Feedback: Send + Sync {
    /// Overall progress, `0..=100`, never decreasing during a run
    fn progress(&self, percent: u8);
    /// A description of the stage being worked on
    fn status(&self, text: &str);
    /// One line of subprocess or diagnostic output, delivered as soon as it is read
    fn log(&self, line: &str);
    /// The terminal outcome, delivered exactly once per run
    fn finished(&self, success: bool, message: &str);
}

impl<F> Feedback for &F
where
    F: Feedback + ?Sized,
{
    fn progress(&self, percent: u8) {
        (**self).progress(percent)
    }
    fn status(&self, text: &str) {
        (**self).status(text)
    }
    fn log(&self, line: &str) {
        (**self).log(line)
    }
    fn finished(&self, success: bool, message: &str) {
        (**self).finished(success, message)
    }
}

impl<F> Feedback for std::sync::Arc<F>
where
    F: Feedback + ?Sized,
{
    fn progress(&self, percent: u8) {
        (**self).progress(percent)
    }
    fn status(&self, text: &str) {
        (**self).status(text)
    }
    fn log(&self, line: &str) {
        (**self).log(line)
    }
    fn finished(&self, success: bool, message: &str) {
        (**self).finished(success, message)
    }
}

/// A [`Feedback`] event as a value, for sinks which forward events elsewhere
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InstallEvent {
    Progress { percent: u8 },
    Status { text: String },
    Log { line: String },
    Finished { success: bool, message: String },
}

impl InstallEvent {
    /// Deliver this event to `feedback`
    pub fn dispatch(&self, feedback: &dyn Feedback) {
        match self {
            InstallEvent::Progress { percent } => feedback.progress(*percent),
            InstallEvent::Status { text } => feedback.status(text),
            InstallEvent::Log { line } => feedback.log(line),
            InstallEvent::Finished { success, message } => feedback.finished(*success, message),
        }
    }
}

/// Wraps a [`Feedback`] so at most one [`finished`](Feedback::finished) event reaches it
pub struct FinishOnce<F> {
    inner: F,
    finished: AtomicBool,
}

impl<F> FinishOnce<F>
where
    F: Feedback,
{
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            finished: AtomicBool::new(false),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl<F> Feedback for FinishOnce<F>
where
    F: Feedback,
{
    fn progress(&self, percent: u8) {
        self.inner.progress(percent)
    }

    fn status(&self, text: &str) {
        self.inner.status(text)
    }

    fn log(&self, line: &str) {
        self.inner.log(line)
    }

    fn finished(&self, success: bool, message: &str) {
        if self.finished.swap(true, Ordering::SeqCst) {
            tracing::warn!(success, message, "Dropping duplicate terminal event");
            return;
        }
        self.inner.finished(success, message)
    }
}

#[cfg(test)]
mod test {
    use super::{channel::ChannelFeedback, *};

    #[tokio::test]
    async fn finish_once_drops_duplicates() {
        let (feedback, mut receiver) = ChannelFeedback::new();
        let feedback = FinishOnce::new(feedback);
        feedback.progress(15);
        feedback.finished(false, "Disk preparation failed");
        feedback.finished(true, "never delivered");
        assert!(feedback.is_finished());
        drop(feedback);

        let mut events = vec![];
        while let Some(event) = receiver.recv().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                InstallEvent::Progress { percent: 15 },
                InstallEvent::Finished {
                    success: false,
                    message: "Disk preparation failed".into()
                },
            ]
        );
    }

    #[test]
    fn events_serialize_tagged() -> eyre::Result<()> {
        let event = InstallEvent::Log {
            line: "Executing: partprobe".into(),
        };
        assert_eq!(
            serde_json::to_string(&event)?,
            r#"{"event":"log","line":"Executing: partprobe"}"#
        );
        Ok(())
    }
}
