//! # Batch Events Module
//!
//! Messages the batch worker sends to whatever shell is presenting the run,
//! plus the per-file and per-batch result records they carry.
//!
//! ## Message types (`"type"` field when serialized):
//! - `started`: batch accepted, file count known
//! - `progress`: `current / total` after each file
//! - `log`: one human readable log line
//! - `file_complete`: terminal disposition of one file
//! - `complete`: final [`BatchSummary`]
//!
//! Events for one batch travel over a single ordered channel, so log lines of
//! one file always arrive before its `file_complete`.

use crate::error::Result;
use crate::profile::Profile;
use crate::toolchain::EncoderTag;
use crate::utils::{format_bytes, reduction_percent};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    Images,
    Videos,
    SingleImage,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Images => "image batch",
            BatchKind::Videos => "video batch",
            BatchKind::SingleImage => "single image",
        }
    }
}

/// Terminal outcome of one input file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileDisposition {
    /// Output is smaller than the source
    Compressed,
    /// No gain achieved, the original was copied or remuxed
    Copied,
    /// Under the size threshold, copied or remuxed without planning
    Skipped,
    /// No usable output could be produced by the engine
    Failed,
}

/// Measurement of one encode attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptResult {
    pub original_size: u64,
    /// Absent when the attempt produced no usable output
    pub new_size: Option<u64>,
    pub encoder: EncoderTag,
    /// Quality (images) or CRF (videos) used
    pub quality_param: u8,
    pub reduction_percent: f64,
    pub attempt_number: u32,
    pub elapsed_seconds: f64,
}

impl AttemptResult {
    pub fn new(
        original_size: u64,
        new_size: Option<u64>,
        encoder: EncoderTag,
        quality_param: u8,
        attempt_number: u32,
        elapsed: Duration,
    ) -> Self {
        Self {
            original_size,
            new_size,
            encoder,
            quality_param,
            reduction_percent: new_size.map_or(0.0, |n| reduction_percent(original_size, n)),
            attempt_number,
            elapsed_seconds: elapsed.as_secs_f64(),
        }
    }

    pub fn shrank(&self) -> bool {
        self.new_size.is_some_and(|n| n < self.original_size)
    }
}

/// Everything known about one finished file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub output: Option<PathBuf>,
    pub disposition: FileDisposition,
    pub original_size: u64,
    /// Size of the artifact left in the output slot, if any
    pub final_size: Option<u64>,
    pub encoder: Option<EncoderTag>,
    pub quality_param: Option<u8>,
    pub attempts: u32,
    /// The retry budget ran out and the original was kept
    pub gave_up: bool,
    pub error: Option<String>,
}

impl FileOutcome {
    pub fn new(path: PathBuf, disposition: FileDisposition, original_size: u64) -> Self {
        Self {
            path,
            output: None,
            disposition,
            original_size,
            final_size: None,
            encoder: None,
            quality_param: None,
            attempts: 0,
            gave_up: false,
            error: None,
        }
    }

    pub fn with_output(mut self, output: PathBuf, final_size: u64) -> Self {
        self.output = Some(output);
        self.final_size = Some(final_size);
        self
    }

    pub fn with_encoder(mut self, encoder: EncoderTag) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality_param = Some(quality);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn gave_up(mut self) -> Self {
        self.gave_up = true;
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    pub fn reduction_percent(&self) -> f64 {
        self.final_size
            .map_or(0.0, |n| reduction_percent(self.original_size, n))
    }
}

/// Aggregate of one batch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub total_files: usize,
    /// `compressed + copied`
    pub processed: usize,
    pub compressed: usize,
    pub copied: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Copied files that exhausted the retry budget
    pub gave_up: usize,
    /// Videos moved to `your_videos/` during an image batch
    pub videos_copied: usize,
    pub total_original_bytes: u64,
    pub total_new_bytes: u64,
    pub encoder_counts: BTreeMap<String, usize>,
    pub elapsed_seconds: f64,
}

impl BatchSummary {
    pub fn new(total_files: usize) -> Self {
        Self {
            total_files,
            ..Default::default()
        }
    }

    pub fn record(&mut self, outcome: &FileOutcome) {
        match outcome.disposition {
            FileDisposition::Compressed => {
                self.processed += 1;
                self.compressed += 1;
            }
            FileDisposition::Copied => {
                self.processed += 1;
                self.copied += 1;
            }
            FileDisposition::Skipped => self.skipped += 1,
            FileDisposition::Failed => self.failed += 1,
        }

        if outcome.gave_up {
            self.gave_up += 1;
        }

        // every input counts; a file with no artifact saved nothing
        self.total_original_bytes += outcome.original_size;
        self.total_new_bytes += outcome.final_size.unwrap_or(outcome.original_size);

        if let Some(encoder) = outcome.encoder {
            *self.encoder_counts.entry(encoder.label().to_string()).or_default() += 1;
        }
    }

    /// Every input file has exactly one disposition
    pub fn is_complete(&self) -> bool {
        self.processed + self.skipped + self.failed == self.total_files
    }

    pub fn saved_bytes(&self) -> u64 {
        self.total_original_bytes.saturating_sub(self.total_new_bytes)
    }

    pub fn reduction_percent(&self) -> f64 {
        reduction_percent(self.total_original_bytes, self.total_new_bytes)
    }

    pub fn format_summary(&self) -> String {
        format!(
            "Total: {} | Compressed: {} | Copied: {} | Skipped: {} | Failed: {} | Saved: {} ({:.1}%) in {:.1}s",
            self.total_files,
            self.compressed,
            self.copied,
            self.skipped,
            self.failed,
            format_bytes(self.saved_bytes()),
            self.reduction_percent(),
            self.elapsed_seconds
        )
    }

    pub fn format_encoders(&self) -> String {
        self.encoder_counts
            .iter()
            .map(|(name, count)| format!("{}: {}", name, count))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Worker → shell message
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    Started {
        kind: BatchKind,
        input: PathBuf,
        output_dir: PathBuf,
        total_files: usize,
        profile: Profile,
    },
    Progress {
        current: usize,
        total: usize,
        percentage: f64,
    },
    Log {
        message: String,
    },
    FileComplete(FileOutcome),
    Complete(BatchSummary),
}

impl BatchEvent {
    pub fn progress(current: usize, total: usize) -> Self {
        let percentage = if total > 0 {
            (current as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        Self::Progress {
            current,
            total,
            percentage,
        }
    }

    pub fn log(message: impl Into<String>) -> Self {
        Self::Log {
            message: message.into(),
        }
    }

    /// One JSON object, no trailing newline
    pub fn to_json_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
