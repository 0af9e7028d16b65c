//! # Batch Orchestrator
//!
//! Accepts batch requests (image directory, video directory, single image)
//! and runs each on one background task.
//!
//! ## State
//! The orchestrator is either `Idle` or `Running(kind)`. A request made while
//! a batch is running is rejected with [`OptimizeError::Busy`], never queued.
//! The running state is released before the final `complete` event is sent,
//! so a shell may submit the next batch as soon as it sees that event.
//!
//! ## Flow
//! 1. Validate directories and create `output/_temp_work`
//! 2. Partition the input by extension
//! 3. Process files strictly one after another
//! 4. Remove the work directory if it is empty and report
//!
//! Per-file problems end up as counters and log lines. Only setup failures
//! (`FatalBatch`) make the batch itself fail.

use crate::config::Config;
use crate::error::{OptimizeError, Result};
use crate::events::{BatchEvent, BatchKind, BatchSummary};
use crate::file_manager::FileManager;
use crate::optimizer::path_resolver::PathResolver;
use crate::optimizer::progress_tracker::ProgressTracker;
use crate::optimizer::task_optimizer::TaskOptimizer;
use crate::tool_resolver::{Tool, ToolPathResolver};
use crate::toolchain::{SystemRunner, Toolchain};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Whether a batch worker is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Running(BatchKind),
}

/// One submitted unit of work
#[derive(Debug, Clone)]
enum BatchRequest {
    Images { input: PathBuf, output: PathBuf },
    Videos { input: PathBuf, output: PathBuf },
    SingleImage { path: PathBuf, output: PathBuf, quality: u8 },
}

impl BatchRequest {
    fn kind(&self) -> BatchKind {
        match self {
            BatchRequest::Images { .. } => BatchKind::Images,
            BatchRequest::Videos { .. } => BatchKind::Videos,
            BatchRequest::SingleImage { .. } => BatchKind::SingleImage,
        }
    }
}

/// Resets the orchestrator to `Idle` when the worker is done, even on panic
struct RunningGuard {
    state: Arc<Mutex<OrchestratorState>>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        *lock_state(&self.state) = OrchestratorState::Idle;
    }
}

fn lock_state(state: &Mutex<OrchestratorState>) -> MutexGuard<'_, OrchestratorState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Receiving end of a running batch
pub struct BatchHandle {
    events: UnboundedReceiver<BatchEvent>,
    task: JoinHandle<Result<BatchSummary>>,
}

impl BatchHandle {
    /// Next event, `None` once the worker has finished
    pub async fn next_event(&mut self) -> Option<BatchEvent> {
        self.events.recv().await
    }

    /// Wait for the worker; remaining events are dropped
    pub async fn wait(self) -> Result<BatchSummary> {
        self.task
            .await
            .map_err(|e| OptimizeError::FatalBatch(format!("batch worker stopped unexpectedly: {}", e)))?
    }
}

/// Entry point for every batch operation
#[derive(Clone)]
pub struct BatchOrchestrator {
    config: Config,
    toolchain: Arc<Toolchain>,
    state: Arc<Mutex<OrchestratorState>>,
}

impl BatchOrchestrator {
    pub fn new(config: Config, toolchain: Arc<Toolchain>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            toolchain,
            state: Arc::new(Mutex::new(OrchestratorState::Idle)),
        })
    }

    /// Orchestrator running the real external tools found on this system
    pub fn with_system_tools(config: Config) -> Result<Self> {
        let tools = ToolPathResolver::new(config.tools_dir.as_deref()).resolve_all();
        let toolchain = Toolchain::new(tools, Arc::new(SystemRunner), config.use_hardware_accel);
        Self::new(config, Arc::new(toolchain))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> OrchestratorState {
        *lock_state(&self.state)
    }

    pub fn is_busy(&self) -> bool {
        self.state() != OrchestratorState::Idle
    }

    pub fn run_images(&self, input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Result<BatchHandle> {
        self.submit(BatchRequest::Images {
            input: input.into(),
            output: output.into(),
        })
    }

    pub fn run_videos(&self, input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Result<BatchHandle> {
        self.submit(BatchRequest::Videos {
            input: input.into(),
            output: output.into(),
        })
    }

    /// Compress one image at a fixed quality (default `single_quality`)
    pub fn run_single_image(
        &self,
        path: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        quality: Option<u8>,
    ) -> Result<BatchHandle> {
        let quality = quality.unwrap_or(self.config.single_quality);
        if !(1..=100).contains(&quality) {
            return Err(OptimizeError::Config(format!(
                "quality must be between 1 and 100, got {}",
                quality
            )));
        }

        self.submit(BatchRequest::SingleImage {
            path: path.into(),
            output: output.into(),
            quality,
        })
    }

    fn acquire(&self, kind: BatchKind) -> Result<RunningGuard> {
        let mut state = lock_state(&self.state);
        if let OrchestratorState::Running(active) = *state {
            info!("Rejecting {} request, {} in progress", kind.as_str(), active.as_str());
            return Err(OptimizeError::Busy);
        }
        *state = OrchestratorState::Running(kind);
        Ok(RunningGuard {
            state: Arc::clone(&self.state),
        })
    }

    fn submit(&self, request: BatchRequest) -> Result<BatchHandle> {
        let guard = self.acquire(request.kind())?;
        let (tx, events) = mpsc::unbounded_channel();
        let orchestrator = self.clone();

        let task = tokio::spawn(async move {
            let mut tracker = ProgressTracker::new(tx);
            let result = orchestrator.execute(&request, &mut tracker).await;
            drop(guard);

            match result {
                Ok(summary) => {
                    tracker.complete(summary.clone());
                    Ok(summary)
                }
                Err(e) => {
                    error!("{} aborted: {}", request.kind().as_str(), e);
                    tracker.log(format!("[FATAL] {}", e));
                    tracker.complete(tracker.summary().clone());
                    Err(e)
                }
            }
        });

        Ok(BatchHandle { events, task })
    }

    async fn execute(&self, request: &BatchRequest, tracker: &mut ProgressTracker) -> Result<BatchSummary> {
        match request {
            BatchRequest::Images { input, output } => self.image_batch(input, output, tracker).await,
            BatchRequest::Videos { input, output } => self.video_batch(input, output, tracker).await,
            BatchRequest::SingleImage { path, output, quality } => {
                self.single_image(path, output, *quality, tracker).await
            }
        }
    }

    fn task_optimizer(&self, output: &Path, temp_dir: PathBuf) -> TaskOptimizer {
        TaskOptimizer::new(
            self.config.clone(),
            Arc::clone(&self.toolchain),
            output.to_path_buf(),
            temp_dir,
        )
    }

    async fn image_batch(&self, input: &Path, output: &Path, tracker: &mut ProgressTracker) -> Result<BatchSummary> {
        let started = Instant::now();
        let temp_dir = FileManager::prepare_output_dirs(input, output).await?;
        let partition = FileManager::partition_directory(input)?;
        let total = partition.images.len();

        tracker.start(BatchKind::Images, input, output, total, self.config.image_profile);
        tracker.log(format!(
            "[START] {} image(s) | profile {}",
            total,
            self.config.image_profile.as_str()
        ));
        if total == 0 {
            tracker.log(format!("[WARN] No images found in {}", input.display()));
        } else {
            let missing: Vec<String> = self
                .toolchain
                .tools()
                .missing()
                .into_iter()
                .filter(|t| matches!(t, Tool::Cjpeg | Tool::Oxipng | Tool::Pngquant))
                .map(|t| t.to_string())
                .collect();
            if !missing.is_empty() {
                tracker.log(format!("[WARN] Not available: {}, using fallback encoders", missing.join(", ")));
            }
        }

        if self.config.copy_videos_in_image_batch && !partition.videos.is_empty() {
            let copied = self.copy_videos_out(&partition.videos, output, tracker).await;
            tracker.add_videos_copied(copied);
        }

        let task = self.task_optimizer(output, temp_dir.clone());
        for (index, path) in partition.images.iter().enumerate() {
            tracker.log(format!("[IMAGE] Processing [{}/{}]: {}", index + 1, total, display_name(path)));
            let outcome = task.process_image(path, tracker).await;
            tracker.file_done(outcome);
        }

        FileManager::remove_dir_if_empty(&temp_dir).await;
        Ok(tracker.finish(started.elapsed()))
    }

    /// Copy videos met in an image batch to `your_videos/`, returning the count
    async fn copy_videos_out(&self, videos: &[PathBuf], output: &Path, tracker: &ProgressTracker) -> usize {
        let target_dir = PathResolver::video_copy_dir(output);
        tracker.log(format!("[VIDEO] Copying {} video(s) to {}", videos.len(), target_dir.display()));

        let mut copied = 0;
        for video in videos {
            let result = match PathResolver::copy_target(video, &target_dir) {
                Ok(target) => FileManager::copy_file(video, &target).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => copied += 1,
                Err(e) => tracker.log(format!("[WARN] Could not copy {}: {}", display_name(video), e)),
            }
        }
        copied
    }

    async fn video_batch(&self, input: &Path, output: &Path, tracker: &mut ProgressTracker) -> Result<BatchSummary> {
        let started = Instant::now();
        let temp_dir = FileManager::prepare_output_dirs(input, output).await?;
        let partition = FileManager::partition_directory(input)?;
        let total = partition.videos.len();

        tracker.start(BatchKind::Videos, input, output, total, self.config.video_profile);
        tracker.log(format!(
            "[START] {} video(s) | profile {}",
            total,
            self.config.video_profile.as_str()
        ));

        if total == 0 {
            tracker.log(format!("[WARN] No videos found in {}", input.display()));
        } else {
            for tool in [Tool::Ffmpeg, Tool::Ffprobe] {
                if let Err(e) = self.toolchain.tools().require(tool) {
                    tracker.log(format!("[WARN] {}", e));
                }
            }
            match self.toolchain.hw_accel().await {
                Some(accel) => tracker.log(format!("[HW] Using {}", accel.encoder_name())),
                None => tracker.log("[HW] CPU encoding (libx264)"),
            }
        }

        let task = self.task_optimizer(output, temp_dir.clone());
        for (index, path) in partition.videos.iter().enumerate() {
            tracker.log(format!("[VIDEO] Processing [{}/{}]: {}", index + 1, total, display_name(path)));
            let outcome = task.process_video(path, tracker).await;
            tracker.file_done(outcome);
        }

        FileManager::remove_dir_if_empty(&temp_dir).await;
        Ok(tracker.finish(started.elapsed()))
    }

    async fn single_image(
        &self,
        path: &Path,
        output: &Path,
        quality: u8,
        tracker: &mut ProgressTracker,
    ) -> Result<BatchSummary> {
        let started = Instant::now();
        if !path.is_file() || !FileManager::is_image(path) {
            return Err(OptimizeError::FatalBatch(format!(
                "not a supported image file: {}",
                path.display()
            )));
        }

        let parent = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let temp_dir = FileManager::prepare_output_dirs(parent, output).await?;

        tracker.start(BatchKind::SingleImage, path, output, 1, self.config.image_profile);
        tracker.log(format!("[IMAGE] Processing: {}", display_name(path)));

        let task = self.task_optimizer(output, temp_dir.clone());
        let outcome = task.process_single_image(path, quality, tracker).await;
        tracker.file_done(outcome);

        FileManager::remove_dir_if_empty(&temp_dir).await;
        Ok(tracker.finish(started.elapsed()))
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FileDisposition;
    use crate::optimizer::path_resolver::{TEMP_WORK_DIR, VIDEO_COPY_DIR};
    use crate::tool_resolver::ToolSet;
    use crate::toolchain::testing::*;
    use image::{Rgb, RgbImage};
    use std::time::Duration;
    use tempfile::TempDir;

    const PROBE_720P: &str = r#"{
        "streams": [
            {"codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720,
             "r_frame_rate": "25/1", "bit_rate": "3000000"}
        ],
        "format": {"duration": "4.0", "bit_rate": "3000000"}
    }"#;

    struct Dirs {
        _root: TempDir,
        input: PathBuf,
        output: PathBuf,
    }

    fn dirs() -> Dirs {
        let root = TempDir::new().unwrap();
        let input = root.path().join("in");
        let output = root.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        Dirs {
            _root: root,
            input,
            output,
        }
    }

    /// ffmpeg that always writes `encode_size` bytes; remuxes copy 1:1 in size
    fn orchestrator(config: Config, encode_size: usize) -> (BatchOrchestrator, Arc<ScriptedRunner>) {
        let runner = Arc::new(ScriptedRunner::new(move |inv| match inv.program_name().as_str() {
            "ffprobe" => stdout(PROBE_720P),
            "ffmpeg" if inv.args.iter().any(|a| a == "-encoders") => ok(),
            "ffmpeg" => {
                write_last_arg(inv, encode_size);
                ok()
            }
            _ => fail(),
        }));
        let toolchain = Arc::new(Toolchain::new(tools_with_all(), runner.clone(), false));
        (BatchOrchestrator::new(config, toolchain).unwrap(), runner)
    }

    fn small_threshold() -> Config {
        Config {
            small_video_threshold: 1000,
            ..Config::default()
        }
    }

    async fn collect(mut handle: BatchHandle) -> (Vec<BatchEvent>, Result<BatchSummary>) {
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        (events, handle.wait().await)
    }

    fn outcomes(events: &[BatchEvent]) -> Vec<crate::events::FileOutcome> {
        events
            .iter()
            .filter_map(|e| match e {
                BatchEvent::FileComplete(outcome) => Some(outcome.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_second_batch_is_rejected_while_running() {
        let d = dirs();
        std::fs::write(d.input.join("a.mp4"), vec![0u8; 10]).unwrap();
        let (orchestrator, _) = orchestrator(small_threshold(), 1);

        let handle = orchestrator.run_videos(&d.input, &d.output).unwrap();
        assert_eq!(orchestrator.state(), OrchestratorState::Running(BatchKind::Videos));
        assert!(matches!(
            orchestrator.run_images(&d.input, &d.output),
            Err(OptimizeError::Busy)
        ));

        let (events, result) = collect(handle).await;
        assert!(result.is_ok());
        assert!(matches!(events.last(), Some(BatchEvent::Complete(_))));
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);

        // idle again, so the next request goes through
        let again = orchestrator.run_videos(&d.input, &d.output).unwrap();
        assert!(again.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_small_video_is_copied_byte_identical() {
        let d = dirs();
        let payload: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(d.input.join("short.mov"), &payload).unwrap();
        let (orchestrator, runner) = orchestrator(small_threshold(), 1);

        let (events, result) = collect(orchestrator.run_videos(&d.input, &d.output).unwrap()).await;
        let summary = result.unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.compressed, 0);
        assert_eq!(outcomes(&events)[0].disposition, FileDisposition::Skipped);
        assert_eq!(std::fs::read(d.output.join("short.mov")).unwrap(), payload);
        assert!(runner.calls().iter().all(|inv| !inv.args.iter().any(|a| a == "-c:v")));
    }

    #[tokio::test]
    async fn test_video_batch_accounting() {
        let d = dirs();
        std::fs::write(d.input.join("a_small.mp4"), vec![1u8; 100]).unwrap();
        std::fs::write(d.input.join("b_big.mp4"), vec![1u8; 5000]).unwrap();
        std::fs::write(d.input.join("c_big.mkv"), vec![1u8; 6000]).unwrap();
        std::fs::write(d.input.join("notes.txt"), b"ignored").unwrap();

        // every encode yields 5500 bytes: b gives up, c shrinks
        let (orchestrator, _) = orchestrator(small_threshold(), 5500);
        let (events, result) = collect(orchestrator.run_videos(&d.input, &d.output).unwrap()).await;
        let summary = result.unwrap();

        assert_eq!(summary.total_files, 3);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.compressed, 1);
        assert_eq!(summary.copied, 1);
        assert_eq!(summary.gave_up, 1);
        assert_eq!(summary.failed, 0);
        assert!(summary.is_complete());
        assert_eq!(summary.total_original_bytes, 11_100);
        assert_eq!(summary.total_new_bytes, 100 + 5000 + 5500);

        let progress: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                BatchEvent::Progress { current, .. } => Some(*current),
                _ => None,
            })
            .collect();
        assert_eq!(progress, [1, 2, 3]);
        assert!(!d.output.join(TEMP_WORK_DIR).exists());
    }

    #[tokio::test]
    async fn test_missing_input_is_fatal() {
        let d = dirs();
        let (orchestrator, _) = orchestrator(Config::default(), 1);

        let (events, result) =
            collect(orchestrator.run_images(d.input.join("nope"), &d.output).unwrap()).await;
        assert!(matches!(result, Err(OptimizeError::FatalBatch(_))));
        assert!(matches!(events.last(), Some(BatchEvent::Complete(s)) if s.processed == 0));
        assert!(events
            .iter()
            .any(|e| matches!(e, BatchEvent::Log { message } if message.starts_with("[FATAL]"))));
        assert!(!orchestrator.is_busy());
    }

    #[tokio::test]
    async fn test_image_batch_end_to_end() {
        let d = dirs();
        let img = RgbImage::from_fn(48, 48, |x, y| Rgb([(x * 5) as u8, (y * 5) as u8, ((x + y) * 2) as u8]));
        img.save(d.input.join("a.png")).unwrap();
        img.save(d.input.join("b.bmp")).unwrap();
        std::fs::write(d.input.join("clip.mp4"), vec![9u8; 64]).unwrap();

        let toolchain = Arc::new(Toolchain::new(
            ToolSet::new(),
            Arc::new(ScriptedRunner::new(|_| fail())),
            false,
        ));
        let orchestrator = BatchOrchestrator::new(Config::default(), toolchain).unwrap();

        let (events, result) = collect(orchestrator.run_images(&d.input, &d.output).unwrap()).await;
        let summary = result.unwrap();

        assert_eq!(summary.total_files, 2);
        assert_eq!(summary.failed, 0);
        assert!(summary.is_complete());
        assert_eq!(summary.videos_copied, 1);
        assert!(d.output.join(VIDEO_COPY_DIR).join("clip.mp4").exists());
        // an uncompressed bitmap always shrinks as JPEG
        assert!(d.output.join("b.jpg").exists());
        assert!(d.output.join("a.png").exists());
        assert!(matches!(events.first(), Some(BatchEvent::Started { total_files: 2, .. })));

        for outcome in outcomes(&events) {
            let final_size = outcome.final_size.unwrap();
            assert!(final_size <= outcome.original_size);
            if final_size == outcome.original_size {
                assert_eq!(outcome.encoder, Some(crate::toolchain::EncoderTag::Copy));
            }
        }
    }

    #[tokio::test]
    async fn test_single_image_request() {
        let d = dirs();
        let src = d.input.join("scan.bmp");
        RgbImage::from_pixel(32, 32, Rgb([200, 10, 10])).save(&src).unwrap();
        let (orchestrator, _) = orchestrator(Config::default(), 1);

        assert!(matches!(
            orchestrator.run_single_image(&src, &d.output, Some(0)),
            Err(OptimizeError::Config(_))
        ));

        let handle = orchestrator.run_single_image(&src, &d.output, None).unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(30), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.total_files, 1);
        assert_eq!(summary.compressed, 1);
        assert!(d.output.join("scan.jpg").exists());
    }
}
