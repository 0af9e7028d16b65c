//! # Progress Rendering Module
//!
//! Terminal side of the batch event channel.
//!
//! ## Modes:
//! - **Bar**: `indicatif` progress bar driven by `progress` events, log lines
//!   printed above the bar, summary as the final message
//! - **Json**: every event written to stdout as one JSON object per line
//!
//! ## Visual feedback:
//! ```text
//! ⠋ [00:02:15] [========================================] 150/150 (100%) photo.jpg: 45.2% saved
//! ```

use crate::error::Result;
use crate::events::{BatchEvent, FileDisposition, FileOutcome};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// How events are presented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Progress bar; `show_logs` prints log lines above it
    Bar { show_logs: bool },
    /// One JSON object per event on stdout
    Json,
}

/// Renders batch events for the CLI
pub struct ProgressManager {
    mode: RenderMode,
    bar: Option<ProgressBar>,
}

impl ProgressManager {
    pub fn new(mode: RenderMode) -> Self {
        Self { mode, bar: None }
    }

    fn create_bar(total_files: u64) -> ProgressBar {
        let bar = ProgressBar::new(total_files);

        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));
        bar
    }

    /// Present one event
    pub fn handle(&mut self, event: &BatchEvent) -> Result<()> {
        let show_logs = match self.mode {
            RenderMode::Json => {
                println!("{}", event.to_json_line()?);
                return Ok(());
            }
            RenderMode::Bar { show_logs } => show_logs,
        };

        match event {
            BatchEvent::Started { kind, total_files, .. } => {
                let bar = Self::create_bar(*total_files as u64);
                bar.set_message(kind.as_str());
                self.bar = Some(bar);
            }
            BatchEvent::Progress { current, .. } => {
                if let Some(ref bar) = self.bar {
                    bar.set_position(*current as u64);
                }
            }
            BatchEvent::Log { message } => {
                if show_logs {
                    self.println(message);
                }
            }
            BatchEvent::FileComplete(outcome) => {
                if let Some(ref bar) = self.bar {
                    bar.set_message(outcome_message(outcome));
                }
            }
            BatchEvent::Complete(summary) => match self.bar.take() {
                Some(bar) => bar.finish_with_message(summary.format_summary()),
                None => println!("{}", summary.format_summary()),
            },
        }

        Ok(())
    }

    fn println(&self, message: &str) {
        match self.bar {
            Some(ref bar) => bar.println(message),
            None => println!("{}", message),
        }
    }
}

/// Short status line for a finished file
pub fn outcome_message(outcome: &FileOutcome) -> String {
    let name = outcome.file_name();
    match outcome.disposition {
        FileDisposition::Compressed => format!("{}: {:.1}% saved", name, outcome.reduction_percent()),
        FileDisposition::Copied if outcome.gave_up => format!("{}: kept original", name),
        FileDisposition::Copied => format!("{}: no savings", name),
        FileDisposition::Skipped => format!("{}: skipped", name),
        FileDisposition::Failed => format!("{}: failed", name),
    }
}
