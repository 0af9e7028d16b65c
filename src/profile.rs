//! # Profile Policy Module
//!
//! Maps a named profile (`fast|balanced|quality|maximum|auto`) plus a probed
//! signal to concrete encoding parameters.
//!
//! All heuristic constants live here as named tables so they can be tuned and
//! tested on their own:
//! - image complexity thresholds (bytes per pixel)
//! - video source-quality bands (bits per pixel per frame)
//! - image profile table (target reduction, quality floor and ceiling)
//! - video CRF table by resolution category, x264 presets, reduction factors
//!
//! `auto` is resolved against the probed signal *before* any encoding decision
//! and the result is final for that file.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Named compression profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Fast,
    Balanced,
    Quality,
    Maximum,
    #[default]
    Auto,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Fast => "fast",
            Profile::Balanced => "balanced",
            Profile::Quality => "quality",
            Profile::Maximum => "maximum",
            Profile::Auto => "auto",
        }
    }

    /// Profiles allowed to use the palette-quantizing PNG encoder
    pub fn allows_lossy_png(&self) -> bool {
        matches!(self, Profile::Maximum | Profile::Balanced)
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---- Image complexity ----

/// Bytes per pixel above which an image is `high` complexity
pub const COMPLEXITY_HIGH_BPP: f64 = 3.0;
/// Bytes per pixel above which an image is `medium` complexity
pub const COMPLEXITY_MEDIUM_BPP: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    pub fn classify(bytes_per_pixel: f64) -> Self {
        if bytes_per_pixel > COMPLEXITY_HIGH_BPP {
            Complexity::High
        } else if bytes_per_pixel > COMPLEXITY_MEDIUM_BPP {
            Complexity::Medium
        } else {
            Complexity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Low => "low",
            Complexity::Medium => "medium",
            Complexity::High => "high",
        }
    }
}

// ---- Video source quality ----

/// Bits per pixel per frame above which a source is `high` quality
pub const SOURCE_QUALITY_HIGH_BPP: f64 = 0.15;
/// Bits per pixel per frame above which a source is `medium` quality
pub const SOURCE_QUALITY_MEDIUM_BPP: f64 = 0.08;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceQuality {
    Low,
    Medium,
    High,
}

impl SourceQuality {
    pub fn classify(bpp: f64) -> Self {
        if bpp > SOURCE_QUALITY_HIGH_BPP {
            SourceQuality::High
        } else if bpp > SOURCE_QUALITY_MEDIUM_BPP {
            SourceQuality::Medium
        } else {
            SourceQuality::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceQuality::Low => "low",
            SourceQuality::Medium => "medium",
            SourceQuality::High => "high",
        }
    }
}

// ---- Image profiles ----

/// Concrete image compression parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImageProfile {
    pub name: Profile,
    /// Fraction of the original size the search tries to remove
    pub reduction: f64,
    pub quality_floor: u8,
    pub quality_ceiling: u8,
}

impl ImageProfile {
    const fn new(name: Profile, reduction: f64, quality_floor: u8, quality_ceiling: u8) -> Self {
        Self {
            name,
            reduction,
            quality_floor,
            quality_ceiling,
        }
    }

    /// Byte budget the quality search aims for
    pub fn target_bytes(&self, original_size: u64) -> u64 {
        (original_size as f64 * (1.0 - self.reduction)) as u64
    }
}

pub const IMAGE_PROFILES: [ImageProfile; 5] = [
    ImageProfile::new(Profile::Fast, 0.25, 75, 90),
    ImageProfile::new(Profile::Balanced, 0.40, 65, 85),
    ImageProfile::new(Profile::Quality, 0.25, 80, 95),
    ImageProfile::new(Profile::Maximum, 0.60, 45, 75),
    ImageProfile::new(Profile::Auto, 0.35, 60, 90),
];

/// `auto` override for high-complexity images
pub const AUTO_IMAGE_HIGH: ImageProfile = ImageProfile::new(Profile::Auto, 0.30, 70, 92);
/// `auto` override for low-complexity images
pub const AUTO_IMAGE_LOW: ImageProfile = ImageProfile::new(Profile::Auto, 0.50, 55, 85);

/// Resolve the image parameters for a profile and a probed complexity.
/// Only `auto` looks at the complexity.
pub fn resolve_image(profile: Profile, complexity: Complexity) -> ImageProfile {
    if profile == Profile::Auto {
        match complexity {
            Complexity::High => return AUTO_IMAGE_HIGH,
            Complexity::Low => return AUTO_IMAGE_LOW,
            Complexity::Medium => {}
        }
    }

    IMAGE_PROFILES
        .iter()
        .copied()
        .find(|p| p.name == profile)
        .unwrap_or(IMAGE_PROFILES[1])
}

// ---- Video profiles ----

/// Resolution bucket used to look up the CRF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolutionCategory {
    #[serde(rename = "4k")]
    Uhd,
    #[serde(rename = "1080p")]
    FullHd,
    #[serde(rename = "720p")]
    Hd,
    #[serde(rename = "default")]
    Default,
}

impl ResolutionCategory {
    pub fn classify(width: u32, height: u32) -> Self {
        if width >= 3840 || height >= 2160 {
            ResolutionCategory::Uhd
        } else if width >= 1920 || height >= 1080 {
            ResolutionCategory::FullHd
        } else if width >= 1280 || height >= 720 {
            ResolutionCategory::Hd
        } else {
            ResolutionCategory::Default
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionCategory::Uhd => "4k",
            ResolutionCategory::FullHd => "1080p",
            ResolutionCategory::Hd => "720p",
            ResolutionCategory::Default => "default",
        }
    }
}

/// CRF per resolution category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CrfTable {
    pub uhd: u8,
    pub full_hd: u8,
    pub hd: u8,
    pub default: u8,
}

impl CrfTable {
    pub fn get(&self, category: ResolutionCategory) -> u8 {
        match category {
            ResolutionCategory::Uhd => self.uhd,
            ResolutionCategory::FullHd => self.full_hd,
            ResolutionCategory::Hd => self.hd,
            ResolutionCategory::Default => self.default,
        }
    }
}

/// Concrete video compression parameters. `name` is never `Auto`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VideoProfile {
    pub name: Profile,
    pub crf: CrfTable,
    pub preset: &'static str,
    /// Fraction of the source bitrate kept as the bitrate cap
    pub reduction_factor: f64,
}

pub const VIDEO_PROFILES: [VideoProfile; 4] = [
    VideoProfile {
        name: Profile::Fast,
        crf: CrfTable { uhd: 23, full_hd: 23, hd: 23, default: 23 },
        preset: "veryfast",
        reduction_factor: 0.80,
    },
    VideoProfile {
        name: Profile::Balanced,
        crf: CrfTable { uhd: 20, full_hd: 20, hd: 21, default: 22 },
        preset: "medium",
        reduction_factor: 0.70,
    },
    VideoProfile {
        name: Profile::Quality,
        crf: CrfTable { uhd: 18, full_hd: 18, hd: 19, default: 20 },
        preset: "slow",
        reduction_factor: 0.85,
    },
    VideoProfile {
        name: Profile::Maximum,
        crf: CrfTable { uhd: 28, full_hd: 28, hd: 30, default: 30 },
        preset: "slow",
        reduction_factor: 0.50,
    },
];

/// Map `auto` to a concrete profile using the source quality.
/// Medium and high sources both land on `balanced`.
pub fn resolve_auto_video(source_quality: SourceQuality) -> Profile {
    match source_quality {
        SourceQuality::Low => Profile::Quality,
        SourceQuality::Medium | SourceQuality::High => Profile::Balanced,
    }
}

pub fn resolve_video(profile: Profile, source_quality: SourceQuality) -> VideoProfile {
    let concrete = if profile == Profile::Auto {
        resolve_auto_video(source_quality)
    } else {
        profile
    };

    VIDEO_PROFILES
        .iter()
        .copied()
        .find(|p| p.name == concrete)
        .unwrap_or(VIDEO_PROFILES[1])
}
