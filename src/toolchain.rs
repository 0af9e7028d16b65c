//! # Encoder Toolchain Module
//!
//! Capability-indexed fallback chains over interchangeable encoders.
//!
//! ## Chains
//!
//! | Input | Order |
//! |-------|-------|
//! | JPEG  | cjpeg (mozjpeg) → image library |
//! | PNG   | pngquant (lossy profiles, quality < 95) → oxipng → image library |
//! | WebP  | image library (lossy libwebp at the searched quality) |
//! | other | image library |
//! | video | h264_nvenc / h264_qsv / h264_amf → libx264 |
//!
//! Every external invocation goes through the [`ToolRunner`] seam with a fully
//! specified argument vector. A link succeeds only when the tool exits zero
//! *and* its output exists with a non-zero size; anything else moves on to the
//! next link. The chain never looks at *why* a tool failed.
//!
//! The hardware encoder is picked once per toolchain from the encoder list
//! advertised by `ffmpeg -encoders` (NVENC, then QSV, then AMF).

use crate::args;
use crate::error::{OptimizeError, Result};
use crate::media_probe::ImageKind;
use crate::planner::EncodingPlan;
use crate::quality_search::ScratchEncoder;
use crate::tool_resolver::{Tool, ToolSet};
use crate::utils::path_arg;
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ColorType, DynamicImage, ImageEncoder, ImageFormat};
use serde::Serialize;
use std::borrow::Cow;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Ceiling for the one-time `ffmpeg -encoders` capability query
const CAPABILITY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One fully specified external tool call
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// File name of the program, for log lines
    pub fn program_name(&self) -> String {
        self.program
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

/// What a tool reported back
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Seam between the engine and external processes
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<ToolOutput>;
}

/// Runs tools as child processes
pub struct SystemRunner;

#[async_trait]
impl ToolRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ToolOutput> {
        debug!("Running {:?} {:?}", invocation.program, invocation.args);

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match invocation.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| {
                    OptimizeError::encode(
                        invocation.program_name(),
                        format!("timed out after {}s", limit.as_secs()),
                    )
                })??,
            None => cmd.output().await?,
        };

        Ok(ToolOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Hardware H.264 encoder families, in detection priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HwAccel {
    Nvenc,
    Qsv,
    Amf,
}

impl HwAccel {
    pub const PRIORITY: [HwAccel; 3] = [HwAccel::Nvenc, HwAccel::Qsv, HwAccel::Amf];

    pub fn encoder_name(&self) -> &'static str {
        match self {
            HwAccel::Nvenc => "h264_nvenc",
            HwAccel::Qsv => "h264_qsv",
            HwAccel::Amf => "h264_amf",
        }
    }

    /// First advertised hardware encoder wins
    pub fn detect_from_encoders(encoder_list: &str) -> Option<HwAccel> {
        Self::PRIORITY
            .into_iter()
            .find(|accel| encoder_list.contains(accel.encoder_name()))
    }

    fn tag(&self) -> EncoderTag {
        match self {
            HwAccel::Nvenc => EncoderTag::Nvenc,
            HwAccel::Qsv => EncoderTag::Qsv,
            HwAccel::Amf => EncoderTag::Amf,
        }
    }
}

/// Which encoder produced an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderTag {
    MozJpeg,
    PngQuant,
    OxiPng,
    ImageLibrary,
    Copy,
    Remux,
    Nvenc,
    Qsv,
    Amf,
    X264,
}

impl EncoderTag {
    pub fn label(&self) -> &'static str {
        match self {
            EncoderTag::MozJpeg => "mozjpeg",
            EncoderTag::PngQuant => "pngquant",
            EncoderTag::OxiPng => "oxipng",
            EncoderTag::ImageLibrary => "image",
            EncoderTag::Copy => "copy",
            EncoderTag::Remux => "remux",
            EncoderTag::Nvenc => "h264_nvenc",
            EncoderTag::Qsv => "h264_qsv",
            EncoderTag::Amf => "h264_amf",
            EncoderTag::X264 => "libx264",
        }
    }

    fn tool(&self) -> Option<Tool> {
        match self {
            EncoderTag::MozJpeg => Some(Tool::Cjpeg),
            EncoderTag::PngQuant => Some(Tool::Pngquant),
            EncoderTag::OxiPng => Some(Tool::Oxipng),
            EncoderTag::Remux | EncoderTag::Nvenc | EncoderTag::Qsv | EncoderTag::Amf | EncoderTag::X264 => {
                Some(Tool::Ffmpeg)
            }
            EncoderTag::ImageLibrary | EncoderTag::Copy => None,
        }
    }
}

impl fmt::Display for EncoderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Ordered image encoder chain for a format. The image library is always last.
pub fn image_chain(kind: ImageKind, quality: u8, lossy_png_allowed: bool) -> Vec<EncoderTag> {
    match kind {
        ImageKind::Jpeg => vec![EncoderTag::MozJpeg, EncoderTag::ImageLibrary],
        ImageKind::Png => {
            let mut chain = Vec::with_capacity(3);
            if lossy_png_allowed && quality < 95 {
                chain.push(EncoderTag::PngQuant);
            }
            chain.push(EncoderTag::OxiPng);
            chain.push(EncoderTag::ImageLibrary);
            chain
        }
        _ => vec![EncoderTag::ImageLibrary],
    }
}

/// pngquant quality window `min-max`. The lower bound is clamped to 1.
pub fn pngquant_quality_range(quality: u8) -> String {
    let max = quality.clamp(1, 100);
    let min = max.saturating_sub(15).max(1);
    format!("{}-{}", min, max)
}

/// How a stream-copy remux treats the input streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemuxMode {
    /// `-c copy -map 0`, keep every stream
    AllStreams,
    /// `-c copy -bsf:a aac_adtstoasc`, MPEG-TS into MP4
    TsToMp4,
}

/// Full ffmpeg argument vector for one video encode attempt
pub fn video_encode_args(
    input: &Path,
    output: &Path,
    has_audio: bool,
    plan: &EncodingPlan,
    accel: Option<HwAccel>,
) -> Vec<String> {
    let mut argv = args!["-y", "-i", path_arg(input)];

    match accel {
        Some(HwAccel::Nvenc) => argv.extend(args!["-c:v", "h264_nvenc", "-preset", "p4", "-cq", plan.crf]),
        Some(HwAccel::Qsv) => argv.extend(args![
            "-c:v", "h264_qsv", "-preset", plan.preset, "-global_quality", plan.crf
        ]),
        Some(HwAccel::Amf) => argv.extend(args![
            "-c:v", "h264_amf", "-quality", "balanced", "-qp_i", plan.crf
        ]),
        None => argv.extend(args!["-c:v", "libx264", "-crf", plan.crf, "-preset", plan.preset]),
    }

    if plan.max_bitrate > 0 {
        argv.extend(args!["-maxrate", plan.max_bitrate, "-bufsize", plan.buf_size]);
    }

    if plan.use_fps_filter {
        argv.extend(args!["-r", plan.target_fps]);
    }

    argv.extend(args!["-movflags", "+faststart", "-pix_fmt", "yuv420p"]);

    if has_audio {
        argv.extend(args!["-c:a", "aac", "-b:a", format!("{}k", plan.audio_bitrate_kbps)]);
    } else {
        argv.push("-an".to_string());
    }

    argv.push(path_arg(output));
    argv
}

/// Size of a usable tool output: the file exists and is non-empty
pub async fn output_size(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Some(meta.len()),
        _ => None,
    }
}

async fn discard(path: &Path) {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("Failed to remove partial output {}: {}", path.display(), e);
        }
    }
}

/// Format the in-process encoder writes for a given input kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LibraryCodec {
    Jpeg,
    Png,
    Webp,
    Native(ImageFormat),
}

/// Generic in-process encoder built on the `image` crate.
///
/// The source is decoded once and re-encoded as many times as needed, which
/// is what the quality search relies on. It is the final link of every image
/// chain and is expected to succeed on any decodable input.
pub struct LibraryEncoder {
    image: DynamicImage,
    kind: ImageKind,
}

impl LibraryEncoder {
    pub fn new(image: DynamicImage, kind: ImageKind) -> Self {
        Self { image, kind }
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    fn codec(&self) -> LibraryCodec {
        match self.kind {
            ImageKind::Jpeg | ImageKind::Bmp => LibraryCodec::Jpeg,
            ImageKind::Png => LibraryCodec::Png,
            ImageKind::Webp => LibraryCodec::Webp,
            ImageKind::Gif => LibraryCodec::Native(ImageFormat::Gif),
            ImageKind::Tiff => LibraryCodec::Native(ImageFormat::Tiff),
        }
    }

    /// Encode the decoded image to `dst` at `quality` (ignored by lossless codecs)
    pub fn encode_to(&self, dst: &Path, quality: u8) -> Result<()> {
        let mut writer = BufWriter::new(File::create(dst)?);

        match self.codec() {
            LibraryCodec::Jpeg => {
                let rgb = self.image.to_rgb8();
                JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100)).write_image(
                    rgb.as_raw(),
                    rgb.width(),
                    rgb.height(),
                    ColorType::Rgb8,
                )?;
            }
            LibraryCodec::Png => {
                let encoder =
                    PngEncoder::new_with_quality(&mut writer, CompressionType::Best, FilterType::Adaptive);
                if self.image.color().has_alpha() {
                    let rgba = self.image.to_rgba8();
                    encoder.write_image(rgba.as_raw(), rgba.width(), rgba.height(), ColorType::Rgba8)?;
                } else {
                    let rgb = self.image.to_rgb8();
                    encoder.write_image(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)?;
                }
            }
            LibraryCodec::Webp => {
                // libwebp only takes 8-bit RGB or RGBA frames
                let frame = match &self.image {
                    DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => Cow::Borrowed(&self.image),
                    other if other.color().has_alpha() => Cow::Owned(DynamicImage::ImageRgba8(other.to_rgba8())),
                    other => Cow::Owned(DynamicImage::ImageRgb8(other.to_rgb8())),
                };
                let encoder = webp::Encoder::from_image(&frame).map_err(|e| OptimizeError::encode("webp", e))?;
                writer.write_all(&encoder.encode(f32::from(quality.clamp(1, 100))))?;
            }
            LibraryCodec::Native(format) => {
                self.image.write_to(&mut writer, format)?;
            }
        }

        writer.flush()?;
        Ok(())
    }
}

impl ScratchEncoder for LibraryEncoder {
    fn encode(&self, quality: u8, dst: &Path) -> Result<()> {
        self.encode_to(dst, quality)
    }
}

/// Encoder chains bound to the tools resolved for this run
pub struct Toolchain {
    tools: ToolSet,
    runner: Arc<dyn ToolRunner>,
    allow_hw: bool,
    hw_accel: OnceCell<Option<HwAccel>>,
}

impl Toolchain {
    pub fn new(tools: ToolSet, runner: Arc<dyn ToolRunner>, allow_hw: bool) -> Self {
        Self {
            tools,
            runner,
            allow_hw,
            hw_accel: OnceCell::new(),
        }
    }

    pub fn tools(&self) -> &ToolSet {
        &self.tools
    }

    pub fn runner(&self) -> &dyn ToolRunner {
        self.runner.as_ref()
    }

    /// Hardware encoder selected for this toolchain, probed on first use
    pub async fn hw_accel(&self) -> Option<HwAccel> {
        *self.hw_accel.get_or_init(|| self.detect_hw_accel()).await
    }

    async fn detect_hw_accel(&self) -> Option<HwAccel> {
        if !self.allow_hw {
            info!("Hardware acceleration disabled by configuration");
            return None;
        }

        let ffmpeg = self.tools.get(Tool::Ffmpeg)?;
        let invocation = Invocation::new(ffmpeg, args!["-hide_banner", "-encoders"])
            .with_timeout(CAPABILITY_PROBE_TIMEOUT);

        match self.runner.run(&invocation).await {
            Ok(output) if !output.success => {
                warn!("ffmpeg -encoders exited with {:?}, using libx264", output.code);
                None
            }
            Ok(output) => {
                let accel = HwAccel::detect_from_encoders(&output.stdout);
                match accel {
                    Some(a) => info!("Hardware encoder available: {}", a.encoder_name()),
                    None => info!("No hardware encoder advertised, using libx264"),
                }
                accel
            }
            Err(e) => {
                warn!("Encoder capability probe failed, using libx264: {}", e);
                None
            }
        }
    }

    /// Run one tool and require exit zero plus a non-empty `output`
    async fn run_to_output(&self, tool: Tool, argv: Vec<String>, output: &Path) -> Result<u64> {
        let program = self.tools.require(tool)?;
        let result = self.runner.run(&Invocation::new(program, argv)).await?;

        if !result.success {
            let reason = match result.code {
                Some(code) => format!("exit status {}", code),
                None => "terminated by signal".to_string(),
            };
            debug!("{} stderr: {}", tool, result.stderr.trim());
            return Err(OptimizeError::encode(tool, reason));
        }

        output_size(output)
            .await
            .ok_or_else(|| OptimizeError::encode(tool, "no output produced"))
    }

    async fn run_image_link(
        &self,
        link: EncoderTag,
        library: &Arc<LibraryEncoder>,
        input: &Path,
        output: &Path,
        quality: u8,
    ) -> Result<u64> {
        match link {
            EncoderTag::MozJpeg => {
                let argv = args![
                    "-quality", quality, "-optimize", "-progressive", "-outfile", path_arg(output), path_arg(input)
                ];
                self.run_to_output(Tool::Cjpeg, argv, output).await
            }
            EncoderTag::PngQuant => {
                let argv = args![
                    "--quality", pngquant_quality_range(quality), "--force", "--output", path_arg(output), path_arg(input)
                ];
                self.run_to_output(Tool::Pngquant, argv, output).await
            }
            EncoderTag::OxiPng => {
                // oxipng optimizes in place
                tokio::fs::copy(input, output).await?;
                let argv = args!["-o", "6", "-i", "0", "--strip", "safe", path_arg(output)];
                self.run_to_output(Tool::Oxipng, argv, output).await
            }
            EncoderTag::ImageLibrary => {
                let encoder = Arc::clone(library);
                let dst = output.to_path_buf();
                tokio::task::spawn_blocking(move || encoder.encode_to(&dst, quality))
                    .await
                    .map_err(|e| OptimizeError::encode("image", e))??;
                output_size(output)
                    .await
                    .ok_or_else(|| OptimizeError::encode("image", "no output produced"))
            }
            other => Err(OptimizeError::encode(other, "not an image encoder")),
        }
    }

    /// Walk the image chain until one link produces a usable output
    pub async fn encode_image(
        &self,
        library: &Arc<LibraryEncoder>,
        input: &Path,
        output: &Path,
        quality: u8,
        lossy_png_allowed: bool,
    ) -> Result<EncoderTag> {
        let chain = image_chain(library.kind(), quality, lossy_png_allowed);
        let mut last_error = None;

        for link in chain {
            if let Some(tool) = link.tool() {
                if !self.tools.is_available(tool) {
                    debug!("Skipping {}: {} not available", link, tool);
                    continue;
                }
            }

            match self.run_image_link(link, library, input, output, quality).await {
                Ok(size) => {
                    debug!("{} produced {} bytes", link, size);
                    return Ok(link);
                }
                Err(e) => {
                    warn!("{} failed for {}: {}, trying next encoder", link, input.display(), e);
                    discard(output).await;
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| OptimizeError::encode("image chain", "no encoder available")))
    }

    /// One video encode. Uses the hardware encoder unless `force_cpu`.
    pub async fn encode_video(
        &self,
        input: &Path,
        output: &Path,
        has_audio: bool,
        plan: &EncodingPlan,
        force_cpu: bool,
    ) -> Result<EncoderTag> {
        let accel = if force_cpu { None } else { self.hw_accel().await };
        let tag = accel.map(|a| a.tag()).unwrap_or(EncoderTag::X264);
        let argv = video_encode_args(input, output, has_audio, plan, accel);

        debug!("Encoding {} with {}", input.display(), tag);
        self.run_to_output(Tool::Ffmpeg, argv, output).await?;
        Ok(tag)
    }

    /// Stream-copy `input` into a new container at `output`
    pub async fn remux(&self, input: &Path, output: &Path, mode: RemuxMode) -> Result<u64> {
        let mut argv = args!["-y", "-i", path_arg(input), "-c", "copy"];
        match mode {
            RemuxMode::AllStreams => argv.extend(args!["-map", "0"]),
            RemuxMode::TsToMp4 => argv.extend(args!["-bsf:a", "aac_adtstoasc"]),
        }
        argv.push(path_arg(output));
        self.run_to_output(Tool::Ffmpeg, argv, output).await
    }

    /// 1080p intermediate for sources above 4K
    pub async fn downscale(&self, input: &Path, output: &Path, is_portrait: bool) -> Result<u64> {
        let scale = if is_portrait { "scale=-2:1920" } else { "scale=1920:-2" };
        let argv = args![
            "-y", "-hwaccel", "auto", "-i", path_arg(input), "-vf", scale,
            "-c:v", "libx264", "-preset", "ultrafast", "-crf", "20", "-c:a", "copy", path_arg(output)
        ];
        self.run_to_output(Tool::Ffmpeg, argv, output).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted stand-in for external tools

    use super::*;
    use std::sync::Mutex;

    type Handler = Box<dyn Fn(&Invocation) -> ToolOutput + Send + Sync>;

    pub struct ScriptedRunner {
        handler: Handler,
        calls: Mutex<Vec<Invocation>>,
    }

    impl ScriptedRunner {
        pub fn new(handler: impl Fn(&Invocation) -> ToolOutput + Send + Sync + 'static) -> Self {
            Self {
                handler: Box::new(handler),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ToolRunner for ScriptedRunner {
        async fn run(&self, invocation: &Invocation) -> Result<ToolOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            Ok((self.handler)(invocation))
        }
    }

    pub fn ok() -> ToolOutput {
        ToolOutput {
            success: true,
            code: Some(0),
            ..Default::default()
        }
    }

    pub fn fail() -> ToolOutput {
        ToolOutput {
            success: false,
            code: Some(1),
            stderr: "scripted failure".to_string(),
            ..Default::default()
        }
    }

    pub fn stdout(text: &str) -> ToolOutput {
        ToolOutput {
            stdout: text.to_string(),
            ..ok()
        }
    }

    /// Value following `flag` in the argument vector
    pub fn arg_after<'a>(invocation: &'a Invocation, flag: &str) -> Option<&'a str> {
        let pos = invocation.args.iter().position(|a| a == flag)?;
        invocation.args.get(pos + 1).map(String::as_str)
    }

    /// Write `size` bytes to the invocation's last argument
    pub fn write_last_arg(invocation: &Invocation, size: usize) {
        let path = invocation.args.last().expect("invocation has an output argument");
        std::fs::write(path, vec![0u8; size]).unwrap();
    }

    pub fn tools_with_all() -> ToolSet {
        Tool::ALL
            .into_iter()
            .fold(ToolSet::new(), |set, tool| set.with(tool, format!("/engine/{}", tool.binary_name())))
    }
}
