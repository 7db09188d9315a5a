use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// Snapshot of a running transfer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub transferred: u64,
    /// `None` when the server did not announce a usable size
    pub total: Option<u64>,
    pub elapsed: Duration,
    /// Bytes per second over the last chunk
    pub rate: f64,
}

impl TransferProgress {
    pub fn is_indeterminate(&self) -> bool {
        self.total.is_none()
    }

    pub fn fraction(&self) -> Option<f64> {
        self.total
            .map(|total| (self.transferred as f64 / total as f64).min(1.0))
    }
}

/// Receives progress of sequential downloads, one transfer at a time.
pub trait ProgressSink: Send {
    fn start(&mut self, label: &str, total: Option<u64>);

    /// Called once per chunk written to disk
    fn advance(&mut self, progress: &TransferProgress);

    fn finish(&mut self, progress: &TransferProgress);

    fn abandon(&mut self, _reason: &str) {}
}

/// Terminal progress display backed by indicatif
pub struct ProgressTracker {
    hidden: bool,
    current: Option<ProgressBar>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            hidden: !console::user_attended_stderr(),
            current: None,
        }
    }

    /// A tracker that never draws, for non-interactive runs
    pub fn hidden() -> Self {
        Self {
            hidden: true,
            current: None,
        }
    }

    fn new_bar(&self, total: Option<u64>) -> ProgressBar {
        let pb = match total {
            Some(size) => {
                let pb = ProgressBar::new(size);
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("    {percent:>3}% [{bar:35.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("█▓▒░"),
                );
                pb
            }
            None => {
                let pb = ProgressBar::new_spinner();
                pb.set_style(
                    ProgressStyle::default_spinner()
                        .template("    {spinner:.green} [{elapsed_precise}] {bytes} {bytes_per_sec} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                pb.enable_steady_tick(Duration::from_millis(100));
                pb
            }
        };
        if self.hidden {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }
        pb
    }
}

impl ProgressSink for ProgressTracker {
    fn start(&mut self, label: &str, total: Option<u64>) {
        let pb = self.new_bar(total);
        pb.set_message(label.to_string());
        self.current = Some(pb);
    }

    fn advance(&mut self, progress: &TransferProgress) {
        if let Some(pb) = &self.current {
            pb.set_position(progress.transferred);
        }
    }

    fn finish(&mut self, progress: &TransferProgress) {
        if let Some(pb) = self.current.take() {
            pb.set_position(progress.transferred);
            pb.finish_and_clear();
        }
    }

    fn abandon(&mut self, reason: &str) {
        if let Some(pb) = self.current.take() {
            pb.abandon_with_message(reason.to_string());
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}
