use std::sync::atomic::{AtomicU8, Ordering};

use owo_colors::OwoColorize;

use super::Feedback;

/// Renders status and progress on standard error and routes subprocess output through `tracing`
#[derive(Debug, Default)]
pub struct Console {
    percent: AtomicU8,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Feedback for Console {
    fn progress(&self, percent: u8) {
        self.percent.store(percent, Ordering::SeqCst);
        tracing::debug!(percent, "Progress");
    }

    fn status(&self, text: &str) {
        let percent = self.percent.load(Ordering::SeqCst);
        eprintln!(
            "{} {}",
            format!("[{percent:>3}%]").dimmed(),
            text.bold()
        );
    }

    fn log(&self, line: &str) {
        tracing::info!("{line}");
    }

    fn finished(&self, success: bool, message: &str) {
        match success {
            true => eprintln!("{}", message.green().bold()),
            false => eprintln!("{}", message.red().bold()),
        }
    }
}
