use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::{Feedback, InstallEvent};

/** Forwards every event as an [`InstallEvent`] over a channel

This is the adapter a presentation layer subscribes with: the installation runs on its own worker
and the frontend drains the receiver on its own thread.
*/
#[derive(Clone, Debug)]
pub struct ChannelFeedback {
    sender: UnboundedSender<InstallEvent>,
}

impl ChannelFeedback {
    pub fn new() -> (Self, UnboundedReceiver<InstallEvent>) {
        let (sender, receiver) = unbounded_channel();
        (Self { sender }, receiver)
    }

    fn send(&self, event: InstallEvent) {
        // A frontend which stopped listening doesn't stop the installation
        if self.sender.send(event).is_err() {
            tracing::trace!("Feedback receiver dropped");
        }
    }
}

impl Feedback for ChannelFeedback {
    fn progress(&self, percent: u8) {
        self.send(InstallEvent::Progress { percent })
    }

    fn status(&self, text: &str) {
        self.send(InstallEvent::Status { text: text.into() })
    }

    fn log(&self, line: &str) {
        self.send(InstallEvent::Log { line: line.into() })
    }

    fn finished(&self, success: bool, message: &str) {
        self.send(InstallEvent::Finished {
            success,
            message: message.into(),
        })
    }
}
