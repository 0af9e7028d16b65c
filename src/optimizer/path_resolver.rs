//! # Path Resolution Module
//!
//! Centralizes output naming and temporary paths so the image job, the video
//! job and the give-up path agree on where artifacts go.

use crate::config::Config;
use crate::error::{OptimizeError, Result};
use crate::file_manager::FileManager;
use crate::media_probe::ImageKind;
use crate::toolchain::RemuxMode;
use std::path::{Path, PathBuf};
use tempfile::TempPath;

/// Intermediates live here, under the output directory
pub const TEMP_WORK_DIR: &str = "_temp_work";
/// Videos met during an image batch are copied here
pub const VIDEO_COPY_DIR: &str = "your_videos";

pub struct PathResolver;

impl PathResolver {
    fn file_stem(input: &Path) -> Result<String> {
        input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| OptimizeError::analysis(input, "invalid file name"))
    }

    fn dotted_extension(path: &Path) -> String {
        FileManager::extension(path)
            .map(|e| format!(".{}", e))
            .unwrap_or_default()
    }

    /// Same file name under `output_dir`, used whenever the original is kept
    pub fn copy_target(input: &Path, output_dir: &Path) -> Result<PathBuf> {
        let name = input
            .file_name()
            .ok_or_else(|| OptimizeError::analysis(input, "invalid file name"))?;
        Ok(output_dir.join(name))
    }

    /// Where a compressed image is written. BMP sources become `.jpg`.
    pub fn image_output_path(input: &Path, output_dir: &Path) -> Result<PathBuf> {
        match ImageKind::from_path(input).and_then(|k| k.output_extension()) {
            Some(ext) => Ok(output_dir.join(format!("{}.{}", Self::file_stem(input)?, ext))),
            None => Self::copy_target(input, output_dir),
        }
    }

    /// Extension (with dot) of a video output: unified extension first, then
    /// `.ts → .mp4` when TS conversion is on, else unchanged.
    pub fn video_output_extension(input: &Path, config: &Config) -> String {
        let current = Self::dotted_extension(input);
        if let Some(unified) = config.unified_extension() {
            unified
        } else if config.convert_ts_to_mp4 && current == ".ts" {
            ".mp4".to_string()
        } else {
            current
        }
    }

    pub fn video_output_path(input: &Path, output_dir: &Path, config: &Config) -> Result<PathBuf> {
        let ext = Self::video_output_extension(input, config);
        Ok(output_dir.join(format!("{}{}", Self::file_stem(input)?, ext)))
    }

    /// Whether `output` sits in a different container than `input`
    pub fn changes_container(input: &Path, output: &Path) -> bool {
        Self::dotted_extension(input) != Self::dotted_extension(output)
    }

    /// Stream-copy flavour for moving `input` into a `target_ext` container
    pub fn remux_mode(input: &Path, target_ext: &str) -> RemuxMode {
        if Self::dotted_extension(input) == ".ts" && target_ext == ".mp4" {
            RemuxMode::TsToMp4
        } else {
            RemuxMode::AllStreams
        }
    }

    /// Container normalization applied before encoding, if any: TS → MP4
    /// when requested, otherwise the unified extension whenever it is set.
    pub fn pre_conversion(input: &Path, config: &Config) -> Option<(String, RemuxMode)> {
        let current = Self::dotted_extension(input);
        let target = if config.convert_ts_to_mp4 && current == ".ts" {
            config.unified_extension().unwrap_or_else(|| ".mp4".to_string())
        } else {
            config.unified_extension()?
        };
        let mode = Self::remux_mode(input, &target);
        Some((target, mode))
    }

    /// Uniquely named temporary path in `temp_dir`, deleted when dropped
    pub fn temp_file(temp_dir: &Path, input: &Path, label: &str, ext: &str) -> Result<TempPath> {
        let prefix = format!("{}_{}_", Self::file_stem(input)?, label);
        let file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(ext)
            .tempfile_in(temp_dir)?;
        Ok(file.into_temp_path())
    }

    pub fn video_copy_dir(output_dir: &Path) -> PathBuf {
        output_dir.join(VIDEO_COPY_DIR)
    }
}
