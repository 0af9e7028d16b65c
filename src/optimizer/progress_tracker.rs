//! # Progress Tracking Module
//!
//! Worker-side half of the event channel: turns per-file outcomes into
//! `progress` / `file_complete` events, keeps the running [`BatchSummary`] and
//! mirrors every log line into `tracing`.

use crate::events::{BatchEvent, BatchKind, BatchSummary, FileDisposition, FileOutcome};
use crate::profile::Profile;
use crate::utils::format_bytes;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

const RULE: &str = "============================================================";

pub struct ProgressTracker {
    events: UnboundedSender<BatchEvent>,
    summary: BatchSummary,
    current: usize,
}

impl ProgressTracker {
    pub fn new(events: UnboundedSender<BatchEvent>) -> Self {
        Self {
            events,
            summary: BatchSummary::default(),
            current: 0,
        }
    }

    fn send(&self, event: BatchEvent) {
        // a closed receiver only means nobody is watching
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    pub fn start(&mut self, kind: BatchKind, input: &Path, output_dir: &Path, total_files: usize, profile: Profile) {
        self.summary = BatchSummary::new(total_files);
        self.current = 0;
        self.send(BatchEvent::Started {
            kind,
            input: input.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            total_files,
            profile,
        });
    }

    /// Log line for the shell, mirrored into `tracing`
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!(target: "shrinkify::batch", "{}", message);
        self.send(BatchEvent::log(message));
    }

    pub fn add_videos_copied(&mut self, count: usize) {
        self.summary.videos_copied += count;
    }

    pub fn file_done(&mut self, outcome: FileOutcome) {
        self.summary.record(&outcome);
        self.current += 1;

        match outcome.disposition {
            FileDisposition::Compressed => {
                if let Some(final_size) = outcome.final_size {
                    self.log(format!(
                        "[DONE] {} -> {} (Saved {:.1}%)",
                        format_bytes(outcome.original_size),
                        format_bytes(final_size),
                        outcome.reduction_percent()
                    ));
                }
            }
            FileDisposition::Copied | FileDisposition::Skipped => {
                if let Some(final_size) = outcome.final_size {
                    self.log(format!("[STAT] Kept original size: {}", format_bytes(final_size)));
                }
            }
            FileDisposition::Failed => {
                self.log(format!(
                    "[FAIL] {}: {}",
                    outcome.file_name(),
                    outcome.error.as_deref().unwrap_or("no usable output")
                ));
            }
        }

        self.send(BatchEvent::FileComplete(outcome));
        self.send(BatchEvent::progress(self.current, self.summary.total_files));
    }

    pub fn summary(&self) -> &BatchSummary {
        &self.summary
    }

    /// Close the books and write the final report to the log
    pub fn finish(&mut self, elapsed: Duration) -> BatchSummary {
        self.summary.elapsed_seconds = elapsed.as_secs_f64();
        let s = &self.summary;

        let mut lines = vec![
            RULE.to_string(),
            "[COMPLETE] Optimization finished".to_string(),
            format!("[TIME] Total duration: {:.1}s", s.elapsed_seconds),
            format!(
                "[STAT] Total: {} | Compressed: {} | Copied: {} | Skipped: {} | Failed: {}",
                s.total_files, s.compressed, s.copied, s.skipped, s.failed
            ),
        ];
        if s.gave_up > 0 {
            lines.push(format!("[STAT] Kept original after all retries: {}", s.gave_up));
        }
        if s.videos_copied > 0 {
            lines.push(format!("[STAT] Videos moved: {}", s.videos_copied));
        }
        lines.push(format!(
            "[SIZE] {} -> {}",
            format_bytes(s.total_original_bytes),
            format_bytes(s.total_new_bytes)
        ));
        lines.push(format!(
            "[SAVED] {} ({:.1}% reduction)",
            format_bytes(s.saved_bytes()),
            s.reduction_percent()
        ));
        if !s.encoder_counts.is_empty() {
            lines.push(format!("[ENGINES] {}", s.format_encoders()));
        }
        lines.push(RULE.to_string());

        for line in lines {
            self.log(line);
        }

        self.summary.clone()
    }

    /// Final event. Sent after the orchestrator is idle again.
    pub fn complete(&self, summary: BatchSummary) {
        self.send(BatchEvent::Complete(summary));
    }
}
