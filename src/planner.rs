//! # Video Settings Planner
//!
//! Derives an [`EncodingPlan`] from probed metadata and a profile, and the
//! stricter plan used for each retry.
//!
//! ## Planning steps
//! 1. `bpp = bitrate / (pixels × fps)` classifies the source quality; `auto`
//!    is resolved against it (low → quality, otherwise balanced)
//! 2. CRF from the resolution category; low-quality sources get 3 points of
//!    relief, never below 15
//! 3. downscale when the long edge exceeds 3840
//! 4. fps capped at 30 under `maximum` only
//! 5. audio `min(source, 128k)`, 96k under `maximum`
//! 6. reduction factor from the profile, +0.15 (max 0.95) for low sources
//! 7. bitrate cap `source × factor` with a `2×` buffer when the source bitrate
//!    is known and above 100 kb/s
//!
//! ## Escalation
//! `crf += 4`; an existing cap shrinks to 80 %, otherwise a cap is synthesized
//! from `pixels × fps × target_bpp` (0.07 on attempt 2, 0.05 afterwards).
//! The buffer is always twice the cap.

use crate::media_probe::VideoMetadata;
use crate::profile::{resolve_video, Profile, ResolutionCategory, SourceQuality};
use serde::Serialize;
use tracing::info;

/// CRF relief for low-quality sources
pub const LOW_SOURCE_CRF_RELIEF: u8 = 3;
/// Lowest CRF the relief may reach
pub const LOW_SOURCE_CRF_FLOOR: u8 = 15;
/// Reduction factor boost for low-quality sources
pub const LOW_SOURCE_FACTOR_BOOST: f64 = 0.15;
pub const MAX_REDUCTION_FACTOR: f64 = 0.95;
/// Long edge above which a 1080p intermediate is produced
pub const DOWNSCALE_EDGE: u32 = 3840;
/// Frame rate cap applied under `maximum`
pub const MAXIMUM_PROFILE_FPS: f64 = 30.0;
/// Audio bitrate ceiling
pub const AUDIO_BITRATE_CAP: u64 = 128_000;
/// Audio bitrate forced under `maximum`
pub const MAXIMUM_PROFILE_AUDIO_BITRATE: u64 = 96_000;
/// Source bitrates at or below this are encoded CRF-only
pub const MIN_CAPPABLE_BITRATE: u64 = 100_000;

/// CRF added on every escalation
pub const ESCALATION_CRF_STEP: u8 = 4;
/// Multiplier applied to an existing bitrate cap on escalation
pub const ESCALATION_CAP_SHRINK: f64 = 0.8;
/// Target bits per pixel per frame for a synthesized cap on attempt 2
pub const ESCALATION_BPP_SECOND: f64 = 0.07;
/// Target bits per pixel per frame for a synthesized cap on attempt 3+
pub const ESCALATION_BPP_LATER: f64 = 0.05;
/// Highest CRF x264 accepts
pub const MAX_CRF: u8 = 51;

/// Concrete parameters of one video encode attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodingPlan {
    /// Concrete profile after `auto` resolution
    pub profile: Profile,
    pub crf: u8,
    pub preset: &'static str,
    pub target_fps: f64,
    pub use_fps_filter: bool,
    pub audio_bitrate_kbps: u64,
    /// Bits per second, 0 means CRF-only
    pub max_bitrate: u64,
    pub buf_size: u64,
    pub should_downscale: bool,
    pub is_portrait: bool,
    pub source_quality: SourceQuality,
    /// Source bits per pixel per frame
    pub bpp: f64,
    /// 1-based attempt number this plan is for
    pub attempt: u32,
}

impl EncodingPlan {
    pub fn has_bitrate_cap(&self) -> bool {
        self.max_bitrate > 0
    }

    /// Stricter plan for the next attempt
    pub fn escalate(&self, meta: &VideoMetadata) -> EncodingPlan {
        let attempt = self.attempt + 1;
        let crf = self.crf.saturating_add(ESCALATION_CRF_STEP).min(MAX_CRF);

        let max_bitrate = if self.has_bitrate_cap() {
            (self.max_bitrate as f64 * ESCALATION_CAP_SHRINK) as u64
        } else {
            let target_bpp = if attempt == 2 {
                ESCALATION_BPP_SECOND
            } else {
                ESCALATION_BPP_LATER
            };
            (meta.pixels() as f64 * meta.fps * target_bpp) as u64
        };

        EncodingPlan {
            crf,
            max_bitrate,
            buf_size: max_bitrate * 2,
            attempt,
            ..self.clone()
        }
    }

    pub fn describe(&self) -> String {
        if self.has_bitrate_cap() {
            format!("CRF: {} | Preset: {} | Cap: {}k", self.crf, self.preset, self.max_bitrate / 1000)
        } else {
            format!("CRF: {} | Preset: {}", self.crf, self.preset)
        }
    }
}

/// Derive the first-attempt plan. Pure apart from logging.
pub fn plan(meta: &VideoMetadata, profile: Profile) -> EncodingPlan {
    let bpp = meta.bits_per_pixel();
    let source_quality = SourceQuality::classify(bpp);
    let resolved = resolve_video(profile, source_quality);

    if profile == Profile::Auto {
        info!(
            "[ANALYZE] Source quality {} (bpp {:.3}), auto resolved to {}",
            source_quality.as_str(),
            bpp,
            resolved.name
        );
    }

    let category = ResolutionCategory::classify(meta.width, meta.height);
    let mut crf = resolved.crf.get(category);
    let mut factor = resolved.reduction_factor;

    if source_quality == SourceQuality::Low {
        crf = crf.saturating_sub(LOW_SOURCE_CRF_RELIEF).max(LOW_SOURCE_CRF_FLOOR);
        factor = (factor + LOW_SOURCE_FACTOR_BOOST).min(MAX_REDUCTION_FACTOR);
        info!("[ADJUST] Low quality source: CRF {} and cap factor {:.0}%", crf, factor * 100.0);
    }

    let is_maximum = resolved.name == Profile::Maximum;

    let target_fps = if is_maximum && meta.fps > MAXIMUM_PROFILE_FPS {
        MAXIMUM_PROFILE_FPS
    } else {
        meta.fps
    };

    let audio_bitrate = if is_maximum {
        MAXIMUM_PROFILE_AUDIO_BITRATE
    } else {
        meta.audio_bitrate.min(AUDIO_BITRATE_CAP)
    };

    let (max_bitrate, buf_size) = if meta.bitrate > MIN_CAPPABLE_BITRATE {
        let cap = (meta.bitrate as f64 * factor) as u64;
        (cap, cap * 2)
    } else {
        (0, 0)
    };

    EncodingPlan {
        profile: resolved.name,
        crf,
        preset: resolved.preset,
        target_fps,
        use_fps_filter: target_fps != meta.fps,
        audio_bitrate_kbps: audio_bitrate / 1000,
        max_bitrate,
        buf_size,
        should_downscale: meta.width.max(meta.height) > DOWNSCALE_EDGE,
        is_portrait: meta.is_portrait(),
        source_quality,
        bpp,
        attempt: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(width: u32, height: u32, fps: f64, bitrate: u64) -> VideoMetadata {
        VideoMetadata {
            width,
            height,
            fps,
            codec: "h264".to_string(),
            bitrate,
            duration: 60.0,
            has_audio: true,
            audio_codec: Some("aac".to_string()),
            audio_bitrate: 192_000,
        }
    }

    #[test]
    fn test_balanced_1080p_plan() {
        let p = plan(&meta(1920, 1080, 30.0, 8_000_000), Profile::Balanced);
        assert_eq!(p.source_quality, SourceQuality::Medium);
        assert_eq!(p.profile, Profile::Balanced);
        assert_eq!(p.crf, 20);
        assert_eq!(p.preset, "medium");
        assert_eq!(p.max_bitrate, 5_600_000);
        assert_eq!(p.buf_size, 11_200_000);
        assert_eq!(p.audio_bitrate_kbps, 128);
        assert!(!p.use_fps_filter);
        assert!(!p.should_downscale);
        assert_eq!(p.attempt, 1);
    }

    #[test]
    fn test_single_escalation() {
        let m = meta(1920, 1080, 30.0, 8_000_000);
        let first = plan(&m, Profile::Balanced);
        let second = first.escalate(&m);
        assert_eq!(second.crf, 24);
        assert_eq!(second.max_bitrate, 4_480_000);
        assert_eq!(second.buf_size, 2 * second.max_bitrate);
        assert_eq!(second.attempt, 2);
        // the original plan is untouched
        assert_eq!(first.crf, 20);
    }

    #[test]
    fn test_escalation_synthesizes_cap() {
        let m = meta(1280, 720, 25.0, 50_000);
        let first = plan(&m, Profile::Fast);
        assert_eq!(first.max_bitrate, 0);
        assert_eq!(first.buf_size, 0);

        let second = first.escalate(&m);
        assert_eq!(second.max_bitrate, (1280.0 * 720.0 * 25.0 * 0.07) as u64);
        let third = second.escalate(&m);
        // an existing cap shrinks rather than being re-synthesized
        assert_eq!(third.max_bitrate, (second.max_bitrate as f64 * 0.8) as u64);
        assert_eq!(third.buf_size, third.max_bitrate * 2);

        let third_from_uncapped = EncodingPlan { attempt: 2, ..first.clone() }.escalate(&m);
        assert_eq!(third_from_uncapped.max_bitrate, (1280.0 * 720.0 * 25.0 * 0.05) as u64);
    }

    #[test]
    fn test_low_quality_source_relief() {
        // bpp = 1_000_000 / (1920*1080*30) ≈ 0.016
        let p = plan(&meta(1920, 1080, 30.0, 1_000_000), Profile::Auto);
        assert_eq!(p.source_quality, SourceQuality::Low);
        assert_eq!(p.profile, Profile::Quality);
        assert_eq!(p.crf, 15);
        // 0.85 + 0.15 is capped at 0.95
        assert_eq!(p.max_bitrate, 950_000);
    }

    #[test]
    fn test_maximum_caps_fps_and_audio() {
        let p = plan(&meta(1280, 720, 60.0, 20_000_000), Profile::Maximum);
        assert_eq!(p.target_fps, 30.0);
        assert!(p.use_fps_filter);
        assert_eq!(p.audio_bitrate_kbps, 96);
        assert_eq!(p.crf, 30);
        assert_eq!(p.max_bitrate, 10_000_000);

        let q = plan(&meta(1280, 720, 60.0, 20_000_000), Profile::Quality);
        assert_eq!(q.target_fps, 60.0);
        assert!(!q.use_fps_filter);
    }

    #[test]
    fn test_downscale_and_orientation() {
        let p = plan(&meta(2160, 4096, 30.0, 40_000_000), Profile::Balanced);
        assert!(p.should_downscale);
        assert!(p.is_portrait);

        let q = plan(&meta(3840, 2160, 30.0, 40_000_000), Profile::Balanced);
        assert!(!q.should_downscale);
        assert!(!q.is_portrait);
    }

    #[test]
    fn test_unknown_geometry_does_not_divide_by_zero() {
        let p = plan(&meta(0, 0, 0.0, 5_000_000), Profile::Auto);
        assert_eq!(p.bpp, 0.0);
        assert_eq!(p.source_quality, SourceQuality::Low);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let m = meta(1920, 1080, 29.97, 6_000_000);
        assert_eq!(plan(&m, Profile::Auto), plan(&m, Profile::Auto));
    }

    #[test]
    fn test_crf_never_exceeds_x264_range() {
        let m = meta(640, 480, 30.0, 5_000_000);
        let mut p = plan(&m, Profile::Maximum);
        for _ in 0..10 {
            p = p.escalate(&m);
        }
        assert_eq!(p.crf, MAX_CRF);
    }
}
