//! # Task Optimizer Module
//!
//! Per-file jobs run by the batch worker.
//!
//! - **Image**: probe, resolve the profile, search the quality against the
//!   byte budget, encode once through the image chain. A result that is not
//!   smaller is replaced by a verbatim copy of the original.
//! - **Video**: optional container normalization and 1080p intermediate, then
//!   up to [`MAX_VIDEO_ATTEMPTS`] encodes with an escalated plan on every
//!   retry. When the budget runs out the original is copied or remuxed into
//!   the output slot.
//!
//! Every job ends in exactly one [`FileOutcome`]; errors never escape.

use crate::config::Config;
use crate::error::{OptimizeError, Result};
use crate::events::{AttemptResult, FileDisposition, FileOutcome};
use crate::file_manager::FileManager;
use crate::media_probe::{load_image, probe_video, ImageMetadata, VideoMetadata};
use crate::optimizer::path_resolver::PathResolver;
use crate::optimizer::progress_tracker::ProgressTracker;
use crate::planner::{self, EncodingPlan};
use crate::profile::resolve_image;
use crate::quality_search::{find_quality_blocking, SearchParams};
use crate::toolchain::{output_size, EncoderTag, LibraryEncoder, Toolchain};
use crate::utils::format_bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempPath;
use tracing::{debug, warn};

/// Encode attempts per video before the original is kept
pub const MAX_VIDEO_ATTEMPTS: u32 = 3;

/// Worker for single files of one batch
pub struct TaskOptimizer {
    config: Config,
    toolchain: Arc<Toolchain>,
    output_dir: PathBuf,
    temp_dir: PathBuf,
}

impl TaskOptimizer {
    pub fn new(config: Config, toolchain: Arc<Toolchain>, output_dir: PathBuf, temp_dir: PathBuf) -> Self {
        Self {
            config,
            toolchain,
            output_dir,
            temp_dir,
        }
    }

    /// Batch image job: quality searched against the profile's byte budget
    pub async fn process_image(&self, path: &Path, tracker: &ProgressTracker) -> FileOutcome {
        self.guarded(path, tracker, |original_size| self.optimize_image(path, original_size, None, tracker))
            .await
    }

    /// Single image job at a fixed user quality
    pub async fn process_single_image(&self, path: &Path, quality: u8, tracker: &ProgressTracker) -> FileOutcome {
        self.guarded(path, tracker, |original_size| {
            self.optimize_image(path, original_size, Some(quality), tracker)
        })
        .await
    }

    pub async fn process_video(&self, path: &Path, tracker: &ProgressTracker) -> FileOutcome {
        self.guarded(path, tracker, |original_size| self.optimize_video(path, original_size, tracker))
            .await
    }

    /// Run a job and turn any error into a `Failed` outcome
    async fn guarded<'a, F, Fut>(&'a self, path: &'a Path, tracker: &'a ProgressTracker, job: F) -> FileOutcome
    where
        F: FnOnce(u64) -> Fut,
        Fut: std::future::Future<Output = Result<FileOutcome>> + 'a,
    {
        let original_size = match FileManager::file_size(path).await {
            Ok(size) => size,
            Err(e) => return self.fail(path, 0, OptimizeError::analysis(path, e), tracker).await,
        };

        match job(original_size).await {
            Ok(outcome) => outcome,
            Err(e) => self.fail(path, original_size, e, tracker).await,
        }
    }

    /// Failed file: log it and leave the original in the output if possible
    async fn fail(&self, path: &Path, original_size: u64, error: OptimizeError, tracker: &ProgressTracker) -> FileOutcome {
        tracker.log(format!("[ERR] {}", error));
        let outcome = FileOutcome::new(path.to_path_buf(), FileDisposition::Failed, original_size).with_error(&error);

        let copied = match PathResolver::copy_target(path, &self.output_dir) {
            Ok(target) => FileManager::copy_file(path, &target).await.map(|size| (target, size)),
            Err(e) => Err(e),
        };

        match copied {
            Ok((target, size)) => outcome.with_output(target, size),
            Err(e) => {
                warn!("Could not copy {} after failure: {}", path.display(), e);
                outcome
            }
        }
    }

    // ---- Images ----

    async fn optimize_image(
        &self,
        path: &Path,
        original_size: u64,
        fixed_quality: Option<u8>,
        tracker: &ProgressTracker,
    ) -> Result<FileOutcome> {
        let (meta, decoded) = load_image(path).await?;
        log_image_scan(&meta, tracker);

        let dest = PathResolver::image_output_path(path, &self.output_dir)?;
        let library = Arc::new(LibraryEncoder::new(decoded, meta.format));

        let (quality, lossy_png_allowed) = match fixed_quality {
            Some(quality) => {
                tracker.log(format!("[DECISION] Quality {} (user defined)", quality));
                (quality, true)
            }
            None => {
                let quality = self.search_image_quality(&meta, &dest, &library, tracker).await;
                (quality, self.config.image_profile.allows_lossy_png())
            }
        };

        let started = Instant::now();
        let encoder = self
            .toolchain
            .encode_image(&library, path, &dest, quality, lossy_png_allowed)
            .await?;
        let result = AttemptResult::new(
            original_size,
            output_size(&dest).await,
            encoder,
            quality,
            1,
            started.elapsed(),
        );
        debug!("Image attempt: {:?}", result);

        match result.new_size {
            Some(new_size) if result.shrank() => {
                tracker.log(format!("[ENGINE] {}", encoder));
                Ok(FileOutcome::new(path.to_path_buf(), FileDisposition::Compressed, original_size)
                    .with_output(dest, new_size)
                    .with_encoder(encoder)
                    .with_quality(quality)
                    .with_attempts(1))
            }
            Some(new_size) => {
                let not_reduced = OptimizeError::SizeNotReduced { original_size, new_size };
                tracker.log(format!("[WARN] {}. Keeping original.", not_reduced));
                self.copy_original(path, &dest, original_size, quality).await
            }
            None => {
                tracker.log("[WARN] No usable output. Keeping original.");
                self.copy_original(path, &dest, original_size, quality).await
            }
        }
    }

    /// Zero-gain image result: the original goes to the output verbatim
    async fn copy_original(&self, path: &Path, dest: &Path, original_size: u64, quality: u8) -> Result<FileOutcome> {
        let target = PathResolver::copy_target(path, &self.output_dir)?;
        if dest != target {
            remove_output(dest).await;
        }
        let size = FileManager::copy_file(path, &target).await?;
        Ok(FileOutcome::new(path.to_path_buf(), FileDisposition::Copied, original_size)
            .with_output(target, size)
            .with_encoder(EncoderTag::Copy)
            .with_quality(quality)
            .with_attempts(1))
    }

    async fn search_image_quality(
        &self,
        meta: &ImageMetadata,
        dest: &Path,
        library: &Arc<LibraryEncoder>,
        tracker: &ProgressTracker,
    ) -> u8 {
        let profile = resolve_image(self.config.image_profile, meta.complexity);
        let target_bytes = profile.target_bytes(meta.file_size);
        tracker.log(format!(
            "[TARGET] {} profile: -{:.0}% -> {} (quality {}-{})",
            self.config.image_profile.as_str(),
            profile.reduction * 100.0,
            format_bytes(target_bytes),
            profile.quality_floor,
            profile.quality_ceiling
        ));

        let suffix = dest
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let params = SearchParams {
            target_bytes,
            floor: profile.quality_floor,
            ceiling: profile.quality_ceiling,
            has_quality_axis: meta.format.has_quality_axis(),
            scratch_dir: self.temp_dir.clone(),
            suffix,
        };

        let outcome = find_quality_blocking(Arc::clone(library), params).await;
        if outcome.hit_target {
            tracker.log(format!(
                "[DECISION] Quality {} ({} probes)",
                outcome.quality, outcome.iterations
            ));
        } else {
            tracker.log(format!("[DECISION] Quality {} (target not reachable)", outcome.quality));
        }
        outcome.quality
    }

    // ---- Videos ----

    async fn optimize_video(&self, path: &Path, original_size: u64, tracker: &ProgressTracker) -> Result<FileOutcome> {
        let dest = PathResolver::video_output_path(path, &self.output_dir, &self.config)?;
        tracker.log(format!("[SIZE] {}", format_bytes(original_size)));

        if self.config.skip_small_videos && original_size < self.config.small_video_threshold {
            tracker.log(format!(
                "[SKIP] Below {}, no compression needed",
                format_bytes(self.config.small_video_threshold)
            ));
            return self.keep_original(path, &dest, original_size, FileDisposition::Skipped, tracker).await;
        }

        // intermediates are deleted when this vector drops, on every exit path
        let mut intermediates: Vec<TempPath> = Vec::new();
        let mut encode_input = path.to_path_buf();

        if let Some((ext, mode)) = PathResolver::pre_conversion(path, &self.config) {
            let temp = PathResolver::temp_file(&self.temp_dir, path, "conv", &ext)?;
            tracker.log(format!("[CONVERT] Remuxing to {}", ext));
            match self.toolchain.remux(path, &temp, mode).await {
                Ok(_) => {
                    encode_input = temp.to_path_buf();
                    intermediates.push(temp);
                }
                Err(e) => tracker.log(format!("[WARN] Conversion failed, using original: {}", e)),
            }
        }

        let meta = probe_video(&encode_input, &self.toolchain).await?;
        log_video_scan(&meta, tracker);

        let mut plan = planner::plan(&meta, self.config.video_profile);

        if plan.should_downscale {
            let ext = encode_input
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            let temp = PathResolver::temp_file(&self.temp_dir, path, "1080p", &ext)?;
            tracker.log("[RESIZE] Source above 4K, creating 1080p intermediate");
            match self.toolchain.downscale(&encode_input, &temp, plan.is_portrait).await {
                Ok(_) => {
                    encode_input = temp.to_path_buf();
                    intermediates.push(temp);
                }
                Err(e) => tracker.log(format!("[WARN] Downscale failed, encoding full resolution: {}", e)),
            }
        }

        for attempt in 1..=MAX_VIDEO_ATTEMPTS {
            if attempt > 1 {
                plan = plan.escalate(&meta);
                tracker.log(format!("[RETRY] Shot {}/{}", attempt, MAX_VIDEO_ATTEMPTS));
            }
            tracker.log(format!("[SETT] {}", plan.describe()));
            tracker.log("[BUSY] Encoding...");

            let started = Instant::now();
            let Some(encoder) = self.encode_attempt(&encode_input, &dest, &meta, &plan, tracker).await else {
                return self.give_up(path, &dest, original_size, attempt, tracker).await;
            };

            let result = AttemptResult::new(
                original_size,
                output_size(&dest).await,
                encoder,
                plan.crf,
                attempt,
                started.elapsed(),
            );
            debug!("Video attempt: {:?}", result);

            let Some(new_size) = result.new_size else {
                tracker.log("[WARN] Encoder left no usable output");
                return self.give_up(path, &dest, original_size, attempt, tracker).await;
            };

            if result.shrank() {
                tracker.log(format!("[ENGINE] {} in {:.1}s", encoder, result.elapsed_seconds));
                return Ok(FileOutcome::new(path.to_path_buf(), FileDisposition::Compressed, original_size)
                    .with_output(dest, new_size)
                    .with_encoder(encoder)
                    .with_quality(plan.crf)
                    .with_attempts(attempt));
            }

            let not_reduced = OptimizeError::SizeNotReduced { original_size, new_size };
            tracker.log(format!("[WARN] Shot {}: {}", attempt, not_reduced));
            remove_output(&dest).await;
        }

        self.give_up(path, &dest, original_size, MAX_VIDEO_ATTEMPTS, tracker).await
    }

    /// One attempt: hardware path first, then a single CPU retry
    async fn encode_attempt(
        &self,
        input: &Path,
        dest: &Path,
        meta: &VideoMetadata,
        plan: &EncodingPlan,
        tracker: &ProgressTracker,
    ) -> Option<EncoderTag> {
        let first = match self.toolchain.encode_video(input, dest, meta.has_audio, plan, false).await {
            Ok(tag) => return Some(tag),
            Err(e) => e,
        };

        if self.toolchain.hw_accel().await.is_none() {
            tracker.log(format!("[ERR] Encode failed: {}", first));
            remove_output(dest).await;
            return None;
        }

        tracker.log(format!("[WARN] Hardware encode failed ({}), retrying on CPU", first));
        match self.toolchain.encode_video(input, dest, meta.has_audio, plan, true).await {
            Ok(tag) => Some(tag),
            Err(e) => {
                tracker.log(format!("[ERR] CPU encode failed: {}", e));
                remove_output(dest).await;
                None
            }
        }
    }

    async fn give_up(
        &self,
        path: &Path,
        dest: &Path,
        original_size: u64,
        attempts: u32,
        tracker: &ProgressTracker,
    ) -> Result<FileOutcome> {
        tracker.log(format!("[GIVEUP] No savings after {} shot(s). Keeping original.", attempts));
        remove_output(dest).await;
        let outcome = self
            .keep_original(path, dest, original_size, FileDisposition::Copied, tracker)
            .await?;
        Ok(outcome.with_attempts(attempts).gave_up())
    }

    /// Put the original into the output slot, remuxed when the container changes
    async fn keep_original(
        &self,
        path: &Path,
        dest: &Path,
        original_size: u64,
        disposition: FileDisposition,
        tracker: &ProgressTracker,
    ) -> Result<FileOutcome> {
        let outcome = FileOutcome::new(path.to_path_buf(), disposition, original_size);

        if PathResolver::changes_container(path, dest) {
            let target_ext = PathResolver::video_output_extension(path, &self.config);
            let mode = PathResolver::remux_mode(path, &target_ext);
            match self.toolchain.remux(path, dest, mode).await {
                Ok(size) => {
                    return Ok(outcome.with_output(dest.to_path_buf(), size).with_encoder(EncoderTag::Remux));
                }
                Err(e) => {
                    tracker.log(format!("[WARN] Remux failed, copying as is: {}", e));
                    remove_output(dest).await;
                }
            }
        }

        let target = PathResolver::copy_target(path, &self.output_dir)?;
        let size = FileManager::copy_file(path, &target).await?;
        Ok(outcome.with_output(target, size).with_encoder(EncoderTag::Copy))
    }
}

fn log_image_scan(meta: &ImageMetadata, tracker: &ProgressTracker) {
    tracker.log(format!(
        "[SCAN] {}x{} | {} | {}",
        meta.width,
        meta.height,
        meta.format.as_str(),
        meta.pixel_mode
    ));
    tracker.log(format!(
        "[SIZE] {} | {:.3} B/px | complexity {}",
        format_bytes(meta.file_size),
        meta.bytes_per_pixel,
        meta.complexity.as_str()
    ));
}

fn log_video_scan(meta: &VideoMetadata, tracker: &ProgressTracker) {
    let audio = match (&meta.audio_codec, meta.has_audio) {
        (Some(codec), true) => format!("{} {}k", codec, meta.audio_bitrate / 1000),
        (None, true) => format!("{}k", meta.audio_bitrate / 1000),
        _ => "none".to_string(),
    };
    tracker.log(format!(
        "[SCAN] {}x{} @ {:.2} fps | {} | {} kb/s | audio {}",
        meta.width,
        meta.height,
        meta.fps,
        meta.codec,
        meta.bitrate / 1000,
        audio
    ));
}

async fn remove_output(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}
