//! # Configuration Management Module
//!
//! Run configuration for the compression engine.
//!
//! ## Parameters:
//! - `image_profile` / `video_profile`: named profile, default `auto`
//! - `single_quality`: fixed quality for the single-image operation (1-100, default 85)
//! - `skip_small_videos`: copy videos under `small_video_threshold` instead of encoding
//! - `small_video_threshold`: size in bytes (default 5 MiB)
//! - `use_hardware_accel`: allow NVENC/QSV/AMF when the encoder advertises them
//! - `convert_ts_to_mp4`: normalize `.ts` inputs to `.mp4`
//! - `target_extension`: unify every video output to this extension (`None` = off)
//! - `copy_videos_in_image_batch`: copy videos found in an image batch to `your_videos/`
//! - `tools_dir`: bundled engine directory searched before `PATH`
//!
//! ## Loading:
//! Values come from an optional JSON file (`Config::from_file`), then CLI flags
//! override them. A missing file yields the defaults.

use crate::error::{OptimizeError, Result};
use crate::profile::Profile;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Videos under this size skip heuristic planning
pub const DEFAULT_SMALL_VIDEO_THRESHOLD: u64 = 5 * 1024 * 1024;

/// Configuration for a compression run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Profile for image batches
    pub image_profile: Profile,
    /// Profile for video batches
    pub video_profile: Profile,
    /// Quality used by the single-image operation (1-100)
    pub single_quality: u8,
    /// Copy or remux small videos instead of encoding them
    pub skip_small_videos: bool,
    /// Size threshold in bytes for `skip_small_videos`
    pub small_video_threshold: u64,
    /// Allow hardware-accelerated video encoders
    pub use_hardware_accel: bool,
    /// Normalize `.ts` containers to `.mp4`
    pub convert_ts_to_mp4: bool,
    /// Unify every video output to this extension, e.g. `.mp4`
    pub target_extension: Option<String>,
    /// Copy videos met during an image batch into `your_videos/`
    pub copy_videos_in_image_batch: bool,
    /// Bundled engine directory searched before the system `PATH`
    pub tools_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_profile: Profile::Auto,
            video_profile: Profile::Auto,
            single_quality: 85,
            skip_small_videos: true,
            small_video_threshold: DEFAULT_SMALL_VIDEO_THRESHOLD,
            use_hardware_accel: true,
            convert_ts_to_mp4: false,
            target_extension: None,
            copy_videos_in_image_batch: true,
            tools_dir: None,
        }
    }
}

impl Config {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.single_quality == 0 || self.single_quality > 100 {
            return Err(OptimizeError::Config(
                "single image quality must be between 1 and 100".to_string(),
            ));
        }

        if self.small_video_threshold == 0 {
            return Err(OptimizeError::Config(
                "small video threshold must be greater than 0".to_string(),
            ));
        }

        if let Some(ref ext) = self.target_extension {
            let body = ext.strip_prefix('.').unwrap_or("");
            let valid = !body.is_empty()
                && body.len() <= 5
                && body.chars().all(|c| c.is_ascii_alphanumeric());
            if !valid {
                return Err(OptimizeError::Config(format!(
                    "target extension must look like '.mp4', got '{}'",
                    ext
                )));
            }
        }

        if let Some(ref dir) = self.tools_dir {
            if !dir.is_dir() {
                return Err(OptimizeError::Config(format!(
                    "tools directory does not exist: {}",
                    dir.display()
                )));
            }
        }

        Ok(())
    }

    /// Unified target extension, lowercased, when unification is on
    pub fn unified_extension(&self) -> Option<String> {
        self.target_extension.as_ref().map(|e| e.to_lowercase())
    }

    /// Default location of the run configuration file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("shrinkify").join("config.json"))
    }

    /// Load configuration from a JSON file; a missing file yields the defaults
    pub async fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.image_profile, Profile::Auto);
        assert_eq!(config.video_profile, Profile::Auto);
        assert_eq!(config.single_quality, 85);
        assert!(config.skip_small_videos);
        assert_eq!(config.small_video_threshold, 5 * 1024 * 1024);
        assert!(config.use_hardware_accel);
        assert!(!config.convert_ts_to_mp4);
        assert!(config.target_extension.is_none());
        assert!(config.copy_videos_in_image_batch);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.single_quality = 0;
        assert!(config.validate().is_err());
        config.single_quality = 101;
        assert!(config.validate().is_err());
        config.single_quality = 85;

        config.small_video_threshold = 0;
        assert!(config.validate().is_err());
        config.small_video_threshold = DEFAULT_SMALL_VIDEO_THRESHOLD;

        for bad in ["mp4", ".", ".mp4/x", ".toolong"] {
            config.target_extension = Some(bad.to_string());
            assert!(config.validate().is_err(), "{} should be rejected", bad);
        }

        config.target_extension = Some(".MKV".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(config.unified_extension().as_deref(), Some(".mkv"));
    }

    #[tokio::test]
    async fn test_config_load_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        tokio::fs::write(
            &config_path,
            r#"{ "video_profile": "maximum", "skip_small_videos": false, "target_extension": ".mkv" }"#,
        )
        .await
        .unwrap();

        let config = Config::from_file(&config_path).await.unwrap();
        assert_eq!(config.video_profile, Profile::Maximum);
        assert!(!config.skip_small_videos);
        assert_eq!(config.target_extension.as_deref(), Some(".mkv"));
        // untouched fields keep their defaults
        assert_eq!(config.image_profile, Profile::Auto);
        assert_eq!(config.single_quality, 85);
    }

    #[test]
    fn test_config_missing_file_is_default() {
        let temp_dir = TempDir::new().unwrap();
        let config = tokio_test::block_on(Config::from_file(&temp_dir.path().join("absent.json"))).unwrap();
        assert_eq!(config.single_quality, 85);
    }

    #[tokio::test]
    async fn test_config_invalid_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        tokio::fs::write(&config_path, r#"{ "single_quality": 0 }"#).await.unwrap();
        assert!(Config::from_file(&config_path).await.is_err());
    }
}
