//! # File Management Module
//!
//! Filesystem side of a batch.
//!
//! ## Responsibilities:
//! - Partition an input directory into image and video sets by extension
//!   (top level only, sorted, unsupported extensions ignored)
//! - Validate and prepare the output layout (`output/`, `output/_temp_work/`)
//! - Copy helpers that report the size of what they wrote
//!
//! ## Supported formats:
//! - **Images**: JPG, JPEG, PNG, BMP, GIF, WebP, TIFF
//! - **Videos**: MP4, AVI, MOV, MKV, WMV, FLV, WebM, M4V, MPG, MPEG, 3GP, TS

use crate::error::{OptimizeError, Result};
use crate::optimizer::path_resolver::TEMP_WORK_DIR;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "webp", "tiff", "tif"];
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "avi", "mov", "mkv", "wmv", "flv", "webm", "m4v", "mpg", "mpeg", "3gp", "ts",
];

/// Supported files of one input directory
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MediaPartition {
    pub images: Vec<PathBuf>,
    pub videos: Vec<PathBuf>,
}

impl MediaPartition {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.videos.is_empty()
    }
}

/// Manages file operations and discovery
pub struct FileManager;

impl FileManager {
    /// Lowercased extension without the dot
    pub fn extension(path: &Path) -> Option<String> {
        path.extension().map(|e| e.to_string_lossy().to_lowercase())
    }

    pub fn is_image(path: &Path) -> bool {
        Self::extension(path).is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.as_str()))
    }

    pub fn is_video(path: &Path) -> bool {
        Self::extension(path).is_some_and(|e| VIDEO_EXTENSIONS.contains(&e.as_str()))
    }

    /// Split the top level of `dir` into images and videos
    pub fn partition_directory(dir: &Path) -> Result<MediaPartition> {
        if !dir.is_dir() {
            return Err(OptimizeError::FatalBatch(format!(
                "input directory does not exist: {}",
                dir.display()
            )));
        }

        let mut partition = MediaPartition::default();

        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.into_path();
            if Self::is_image(&path) {
                partition.images.push(path);
            } else if Self::is_video(&path) {
                partition.videos.push(path);
            } else {
                debug!("Ignoring unsupported file: {}", path.display());
            }
        }

        Ok(partition)
    }

    /// Validate the directory pair, create the output tree and return the
    /// temporary work directory.
    pub async fn prepare_output_dirs(input_dir: &Path, output_dir: &Path) -> Result<PathBuf> {
        if !input_dir.is_dir() {
            return Err(OptimizeError::FatalBatch(format!(
                "input directory does not exist: {}",
                input_dir.display()
            )));
        }

        fs::create_dir_all(output_dir).await.map_err(|e| {
            OptimizeError::FatalBatch(format!("cannot create output directory {}: {}", output_dir.display(), e))
        })?;

        let same_dir = match (input_dir.canonicalize(), output_dir.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => input_dir == output_dir,
        };
        if same_dir {
            return Err(OptimizeError::FatalBatch(
                "input and output directories must be different".to_string(),
            ));
        }

        let temp_dir = output_dir.join(TEMP_WORK_DIR);
        fs::create_dir_all(&temp_dir).await.map_err(|e| {
            OptimizeError::FatalBatch(format!("cannot create work directory {}: {}", temp_dir.display(), e))
        })?;

        Ok(temp_dir)
    }

    pub async fn file_size(path: &Path) -> Result<u64> {
        Ok(fs::metadata(path).await?.len())
    }

    /// Copy `src` to `dst`, creating parents, and return the copied size
    pub async fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(fs::copy(src, dst).await?)
    }

    /// Remove a directory only when nothing is left in it
    pub async fn remove_dir_if_empty(dir: &Path) {
        let is_empty = match fs::read_dir(dir).await {
            Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
            Err(_) => return,
        };

        if is_empty {
            if let Err(e) = fs::remove_dir(dir).await {
                warn!("Failed to remove {}: {}", dir.display(), e);
            }
        } else {
            debug!("Keeping non-empty work directory {}", dir.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_detection() {
        assert!(FileManager::is_image(Path::new("a/photo.JPG")));
        assert!(FileManager::is_image(Path::new("scan.tiff")));
        assert!(FileManager::is_video(Path::new("clip.TS")));
        assert!(FileManager::is_video(Path::new("old.3gp")));
        assert!(!FileManager::is_image(Path::new("notes.txt")));
        assert!(!FileManager::is_video(Path::new("noext")));
    }

    #[test]
    fn test_partition_is_sorted_and_flat() {
        let dir = TempDir::new().unwrap();
        for name in ["b.png", "a.jpg", "clip.mp4", "readme.md", "z.ts"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("deep.jpg"), b"x").unwrap();

        let partition = FileManager::partition_directory(dir.path()).unwrap();
        let names = |v: &[PathBuf]| {
            v.iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&partition.images), ["a.jpg", "b.png"]);
        assert_eq!(names(&partition.videos), ["clip.mp4", "z.ts"]);
    }

    #[test]
    fn test_partition_missing_dir_is_fatal() {
        let err = FileManager::partition_directory(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, OptimizeError::FatalBatch(_)));
    }

    #[tokio::test]
    async fn test_prepare_output_dirs() {
        let input = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let output = root.path().join("out");

        let temp = FileManager::prepare_output_dirs(input.path(), &output).await.unwrap();
        assert_eq!(temp, output.join(TEMP_WORK_DIR));
        assert!(temp.is_dir());

        let same = FileManager::prepare_output_dirs(input.path(), input.path()).await;
        assert!(matches!(same, Err(OptimizeError::FatalBatch(_))));
    }

    #[tokio::test]
    async fn test_remove_dir_if_empty() {
        let root = TempDir::new().unwrap();
        let empty = root.path().join("empty");
        let full = root.path().join("full");
        std::fs::create_dir(&empty).unwrap();
        std::fs::create_dir(&full).unwrap();
        std::fs::write(full.join("left.tmp"), b"x").unwrap();

        FileManager::remove_dir_if_empty(&empty).await;
        FileManager::remove_dir_if_empty(&full).await;
        assert!(!empty.exists());
        assert!(full.exists());
    }

    #[tokio::test]
    async fn test_copy_file_creates_parents() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src.bin");
        std::fs::write(&src, vec![7u8; 64]).unwrap();
        let dst = root.path().join("a").join("b").join("dst.bin");
        assert_eq!(FileManager::copy_file(&src, &dst).await.unwrap(), 64);
        assert_eq!(std::fs::read(&dst).unwrap(), vec![7u8; 64]);
    }
}
