//! # Media Probe Module
//!
//! Read-only extraction of intrinsic source metadata.
//!
//! ## Images
//! Dimensions, pixel mode and format come from the `image` crate; the size
//! from the filesystem. `bytes_per_pixel = file_size / (width × height)` drives
//! the complexity class (`> 3.0` high, `> 1.0` medium, else low). A zero-area
//! image has `bytes_per_pixel = 0`.
//!
//! ## Videos
//! `ffprobe -print_format json -show_format -show_streams` with a 30 s ceiling.
//! The first video and first audio stream are used. Fallbacks:
//! - fps: `"num/den"`, 30 when unparsable or `den == 0`
//! - bitrate: stream → container → `size_bits / duration` → 0
//! - audio bitrate: 128 kb/s when the stream does not declare one
//!
//! A missing video stream, a probe error or a timeout is an `Analysis` error.

use crate::args;
use crate::error::{OptimizeError, Result};
use crate::profile::{Complexity, SourceQuality};
use crate::tool_resolver::Tool;
use crate::toolchain::{Invocation, Toolchain};
use crate::utils::path_arg;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Ceiling for one ffprobe call
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
/// Frame rate assumed when the probe reports none
pub const DEFAULT_FPS: f64 = 30.0;
/// Audio bitrate assumed when the stream does not declare one
pub const DEFAULT_AUDIO_BITRATE: u64 = 128_000;

/// Image formats the engine can read and write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Jpeg,
    Png,
    Webp,
    Bmp,
    Gif,
    Tiff,
}

impl ImageKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageKind::Jpeg),
            "png" => Some(ImageKind::Png),
            "webp" => Some(ImageKind::Webp),
            "bmp" => Some(ImageKind::Bmp),
            "gif" => Some(ImageKind::Gif),
            "tif" | "tiff" => Some(ImageKind::Tiff),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageKind::Jpeg => "JPEG",
            ImageKind::Png => "PNG",
            ImageKind::Webp => "WEBP",
            ImageKind::Bmp => "BMP",
            ImageKind::Gif => "GIF",
            ImageKind::Tiff => "TIFF",
        }
    }

    /// Whether encoding this kind has a continuous quality parameter.
    /// BMP counts because it is re-encoded as JPEG.
    pub fn has_quality_axis(&self) -> bool {
        matches!(self, ImageKind::Jpeg | ImageKind::Bmp | ImageKind::Webp)
    }

    /// Extension override for the output file, if the kind changes container
    pub fn output_extension(&self) -> Option<&'static str> {
        match self {
            ImageKind::Bmp => Some("jpg"),
            _ => None,
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intrinsic metadata of one image
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub pixel_mode: String,
    pub format: ImageKind,
    pub file_size: u64,
    pub bytes_per_pixel: f64,
    pub complexity: Complexity,
}

impl ImageMetadata {
    pub fn new(width: u32, height: u32, pixel_mode: String, format: ImageKind, file_size: u64) -> Self {
        let pixels = width as u64 * height as u64;
        let bytes_per_pixel = if pixels > 0 {
            file_size as f64 / pixels as f64
        } else {
            0.0
        };

        Self {
            width,
            height,
            pixel_mode,
            format,
            file_size,
            bytes_per_pixel,
            complexity: Complexity::classify(bytes_per_pixel),
        }
    }
}

/// Probe an image and keep the decoded pixels for the encoders
pub async fn load_image(path: &Path) -> Result<(ImageMetadata, DynamicImage)> {
    let format = ImageKind::from_path(path)
        .ok_or_else(|| OptimizeError::analysis(path, "unsupported image extension"))?;
    let file_size = tokio::fs::metadata(path)
        .await
        .map_err(|e| OptimizeError::analysis(path, e))?
        .len();

    let owned = path.to_path_buf();
    let decoded = tokio::task::spawn_blocking(move || -> std::result::Result<DynamicImage, String> {
        let reader = image::io::Reader::open(&owned).map_err(|e| e.to_string())?;
        let reader = reader.with_guessed_format().map_err(|e| e.to_string())?;
        reader.decode().map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| OptimizeError::analysis(path, e))?
    .map_err(|reason| OptimizeError::analysis(path, reason))?;

    let metadata = ImageMetadata::new(
        decoded.width(),
        decoded.height(),
        format!("{:?}", decoded.color()),
        format,
        file_size,
    );
    debug!(
        "Probed {}: {}x{} {} {:.3} B/px",
        path.display(),
        metadata.width,
        metadata.height,
        metadata.pixel_mode,
        metadata.bytes_per_pixel
    );

    Ok((metadata, decoded))
}

pub async fn probe_image(path: &Path) -> Result<ImageMetadata> {
    load_image(path).await.map(|(metadata, _)| metadata)
}

/// Intrinsic metadata of one video
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: String,
    /// Bits per second, 0 when unknown
    pub bitrate: u64,
    pub duration: f64,
    pub has_audio: bool,
    pub audio_codec: Option<String>,
    pub audio_bitrate: u64,
}

impl VideoMetadata {
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_portrait(&self) -> bool {
        self.height > self.width
    }

    /// Bits per pixel per frame, 0 when the frame area or rate is unknown
    pub fn bits_per_pixel(&self) -> f64 {
        let denominator = self.pixels() as f64 * self.fps;
        if denominator > 0.0 {
            self.bitrate as f64 / denominator
        } else {
            0.0
        }
    }

    pub fn source_quality(&self) -> SourceQuality {
        SourceQuality::classify(self.bits_per_pixel())
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: ProbeFormat,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    bit_rate: Option<String>,
}

impl ProbeStream {
    fn is(&self, kind: &str) -> bool {
        self.codec_type.as_deref() == Some(kind)
    }
}

/// Parse a `"num/den"` frame rate, rounded to two decimals
pub fn parse_frame_rate(raw: &str) -> f64 {
    let parsed = raw.split_once('/').and_then(|(num, den)| {
        let num: i64 = num.trim().parse().ok()?;
        let den: i64 = den.trim().parse().ok()?;
        (den != 0).then(|| num as f64 / den as f64)
    });

    match parsed {
        Some(fps) => (fps * 100.0).round() / 100.0,
        None => DEFAULT_FPS,
    }
}

fn parse_bitrate(raw: Option<&str>) -> u64 {
    raw.and_then(|b| b.trim().parse().ok()).unwrap_or(0)
}

/// Turn ffprobe JSON into [`VideoMetadata`]
pub fn parse_probe_output(path: &Path, json: &str, file_size: u64) -> Result<VideoMetadata> {
    let probe: ProbeOutput =
        serde_json::from_str(json).map_err(|e| OptimizeError::analysis(path, format!("unreadable probe output: {}", e)))?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.is("video"))
        .ok_or_else(|| OptimizeError::analysis(path, "no video stream"))?;
    let audio = probe.streams.iter().find(|s| s.is("audio"));

    let fps = parse_frame_rate(video.r_frame_rate.as_deref().unwrap_or("30/1"));
    let duration: f64 = probe
        .format
        .duration
        .as_deref()
        .and_then(|d| d.trim().parse().ok())
        .unwrap_or(0.0);

    let mut bitrate = parse_bitrate(video.bit_rate.as_deref());
    if bitrate == 0 {
        bitrate = parse_bitrate(probe.format.bit_rate.as_deref());
    }
    if bitrate == 0 && duration > 0.0 {
        bitrate = ((file_size * 8) as f64 / duration) as u64;
    }

    let audio_bitrate = audio
        .map(|a| parse_bitrate(a.bit_rate.as_deref()))
        .filter(|b| *b > 0)
        .unwrap_or(DEFAULT_AUDIO_BITRATE);

    Ok(VideoMetadata {
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        fps,
        codec: video.codec_name.clone().unwrap_or_else(|| "unknown".to_string()),
        bitrate,
        duration,
        has_audio: audio.is_some(),
        audio_codec: audio.and_then(|a| a.codec_name.clone()),
        audio_bitrate,
    })
}

/// Probe a video through ffprobe
pub async fn probe_video(path: &Path, toolchain: &Toolchain) -> Result<VideoMetadata> {
    let ffprobe = toolchain
        .tools()
        .get(Tool::Ffprobe)
        .ok_or_else(|| OptimizeError::analysis(path, "ffprobe not available"))?;
    let file_size = tokio::fs::metadata(path)
        .await
        .map_err(|e| OptimizeError::analysis(path, e))?
        .len();

    let invocation = Invocation::new(
        ffprobe,
        args!["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams", path_arg(path)],
    )
    .with_timeout(PROBE_TIMEOUT);

    let output = toolchain
        .runner()
        .run(&invocation)
        .await
        .map_err(|e| OptimizeError::analysis(path, e))?;

    if !output.success {
        return Err(OptimizeError::analysis(path, "ffprobe exited with an error"));
    }

    parse_probe_output(path, &output.stdout, file_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool_resolver::ToolSet;
    use crate::toolchain::testing::{stdout, ScriptedRunner};
    use image::{Rgb, RgbImage};
    use std::sync::Arc;
    use tempfile::TempDir;

    const SAMPLE_PROBE: &str = r#"{
        "streams": [
            {"codec_type": "audio", "codec_name": "aac", "bit_rate": "192000"},
            {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080,
             "r_frame_rate": "30000/1001", "bit_rate": "8000000"}
        ],
        "format": {"duration": "12.5", "bit_rate": "8200000"}
    }"#;

    #[test]
    fn test_image_metadata_complexity() {
        let meta = ImageMetadata::new(4000, 3000, "Rgb8".into(), ImageKind::Jpeg, 9_000_000);
        assert_eq!(meta.bytes_per_pixel, 0.75);
        assert_eq!(meta.complexity, Complexity::Low);

        let exactly_one = ImageMetadata::new(100, 100, "Rgb8".into(), ImageKind::Png, 10_000);
        assert_eq!(exactly_one.complexity, Complexity::Low);
        let exactly_three = ImageMetadata::new(100, 100, "Rgb8".into(), ImageKind::Png, 30_000);
        assert_eq!(exactly_three.complexity, Complexity::Medium);
    }

    #[test]
    fn test_zero_area_image() {
        let meta = ImageMetadata::new(0, 0, "Rgb8".into(), ImageKind::Png, 512);
        assert_eq!(meta.bytes_per_pixel, 0.0);
        assert_eq!(meta.complexity, Complexity::Low);
    }

    #[test]
    fn test_image_kind_from_path() {
        assert_eq!(ImageKind::from_path(Path::new("a/B.JPEG")), Some(ImageKind::Jpeg));
        assert_eq!(ImageKind::from_path(Path::new("scan.tif")), Some(ImageKind::Tiff));
        assert_eq!(ImageKind::from_path(Path::new("clip.mp4")), None);
        assert_eq!(ImageKind::Bmp.output_extension(), Some("jpg"));
        assert!(!ImageKind::Png.has_quality_axis());
        assert!(ImageKind::Webp.has_quality_axis());
    }

    #[test]
    fn test_frame_rate_parsing() {
        assert_eq!(parse_frame_rate("30000/1001"), 29.97);
        assert_eq!(parse_frame_rate("25/1"), 25.0);
        assert_eq!(parse_frame_rate("25/0"), DEFAULT_FPS);
        assert_eq!(parse_frame_rate("garbage"), DEFAULT_FPS);
    }

    #[test]
    fn test_parse_probe_output() {
        let meta = parse_probe_output(Path::new("a.mp4"), SAMPLE_PROBE, 1_000).unwrap();
        assert_eq!((meta.width, meta.height), (1920, 1080));
        assert_eq!(meta.fps, 29.97);
        assert_eq!(meta.codec, "h264");
        assert_eq!(meta.bitrate, 8_000_000);
        assert_eq!(meta.duration, 12.5);
        assert!(meta.has_audio);
        assert_eq!(meta.audio_codec.as_deref(), Some("aac"));
        assert_eq!(meta.audio_bitrate, 192_000);
    }

    #[test]
    fn test_bitrate_fallback_chain() {
        let container_only = r#"{"streams":[{"codec_type":"video","width":640,"height":480}],
            "format":{"duration":"10","bit_rate":"900000"}}"#;
        let meta = parse_probe_output(Path::new("a.mkv"), container_only, 0).unwrap();
        assert_eq!(meta.bitrate, 900_000);
        assert_eq!(meta.fps, 30.0);
        assert!(!meta.has_audio);
        assert_eq!(meta.audio_bitrate, DEFAULT_AUDIO_BITRATE);

        let estimated = r#"{"streams":[{"codec_type":"video","width":640,"height":480}],
            "format":{"duration":"8"}}"#;
        let meta = parse_probe_output(Path::new("a.mkv"), estimated, 1_000_000).unwrap();
        assert_eq!(meta.bitrate, 1_000_000);

        let unknown = r#"{"streams":[{"codec_type":"video","width":640,"height":480}]}"#;
        let meta = parse_probe_output(Path::new("a.mkv"), unknown, 1_000_000).unwrap();
        assert_eq!(meta.bitrate, 0);
    }

    #[test]
    fn test_missing_video_stream_is_analysis_error() {
        let audio_only = r#"{"streams":[{"codec_type":"audio","codec_name":"mp3"}]}"#;
        let err = parse_probe_output(Path::new("song.mp4"), audio_only, 10).unwrap_err();
        assert!(matches!(err, OptimizeError::Analysis { .. }));
    }

    #[test]
    fn test_source_quality_from_metadata() {
        let meta = parse_probe_output(Path::new("a.mp4"), SAMPLE_PROBE, 1_000).unwrap();
        let meta = VideoMetadata { fps: 30.0, ..meta };
        assert!((meta.bits_per_pixel() - 0.1286).abs() < 0.0001);
        assert_eq!(meta.source_quality(), SourceQuality::Medium);
    }

    #[tokio::test]
    async fn test_probe_video_through_runner() {
        let dir = TempDir::new().unwrap();
        let clip = dir.path().join("clip.mp4");
        std::fs::write(&clip, vec![0u8; 2048]).unwrap();

        let runner = Arc::new(ScriptedRunner::new(|_| stdout(SAMPLE_PROBE)));
        let tools = ToolSet::new().with(Tool::Ffprobe, "/engine/ffprobe");
        let toolchain = Toolchain::new(tools, runner.clone(), false);

        let meta = probe_video(&clip, &toolchain).await.unwrap();
        assert_eq!(meta.width, 1920);
        let call = &runner.calls()[0];
        assert_eq!(call.timeout, Some(PROBE_TIMEOUT));
        assert!(call.args.contains(&"-show_streams".to_string()));
    }

    #[tokio::test]
    async fn test_probe_image_reads_dimensions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tiny.png");
        RgbImage::from_pixel(8, 4, Rgb([10, 20, 30])).save(&path).unwrap();

        let meta = probe_image(&path).await.unwrap();
        assert_eq!((meta.width, meta.height), (8, 4));
        assert_eq!(meta.format, ImageKind::Png);
        assert_eq!(meta.pixel_mode, "Rgb8");
    }

    #[tokio::test]
    async fn test_probe_image_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not an image").unwrap();
        assert!(matches!(probe_image(&path).await, Err(OptimizeError::Analysis { .. })));
    }
}
