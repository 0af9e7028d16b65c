//! # Quality Search Module
//!
//! Binary search over an encoder quality parameter so an image lands at or
//! under a byte budget.
//!
//! - search range `[floor, ceiling]`, at most [`MAX_SEARCH_ITERATIONS`] encodes
//! - a midpoint at or under the target is recorded and the search moves up
//!   (`low = mid + 1`), otherwise it moves down (`high = mid - 1`)
//! - formats without a quality axis return the ceiling without encoding
//! - an encode failure stops the search and the best value so far is returned
//!   (the ceiling when nothing was recorded)
//!
//! Each probe encodes into a uniquely named scratch file under the batch
//! temporary directory, removed right after it is measured.

use crate::error::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Encode budget per image
pub const MAX_SEARCH_ITERATIONS: u32 = 8;

/// Something that can re-encode one source at a given quality
pub trait ScratchEncoder: Send + Sync {
    fn encode(&self, quality: u8, dst: &Path) -> Result<()>;
}

/// Inputs of one search
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub target_bytes: u64,
    pub floor: u8,
    pub ceiling: u8,
    pub has_quality_axis: bool,
    /// Directory for the scratch files
    pub scratch_dir: PathBuf,
    /// Scratch file suffix, e.g. `.jpg`
    pub suffix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchOutcome {
    pub quality: u8,
    pub iterations: u32,
    /// Whether any probe met the byte budget
    pub hit_target: bool,
}

fn probe_size(encoder: &dyn ScratchEncoder, quality: u8, params: &SearchParams) -> Result<u64> {
    let scratch = tempfile::Builder::new()
        .prefix("qsearch_")
        .suffix(&params.suffix)
        .tempfile_in(&params.scratch_dir)?
        .into_temp_path();

    let measured = encoder
        .encode(quality, &scratch)
        .and_then(|_| Ok(std::fs::metadata(&scratch)?.len()));

    if let Err(e) = scratch.close() {
        warn!("Failed to remove scratch file: {}", e);
    }
    measured
}

/// Blocking search. Run it off the async executor.
pub fn find_quality(encoder: &dyn ScratchEncoder, params: &SearchParams) -> SearchOutcome {
    if !params.has_quality_axis {
        debug!("No quality axis, using ceiling {}", params.ceiling);
        return SearchOutcome {
            quality: params.ceiling,
            iterations: 0,
            hit_target: false,
        };
    }

    let mut low = params.floor as i32;
    let mut high = params.ceiling as i32;
    let mut best_quality = params.ceiling;
    let mut best_size = u64::MAX;
    let mut hit_target = false;
    let mut iterations = 0;

    while low <= high && iterations < MAX_SEARCH_ITERATIONS {
        let mid = (low + high) / 2;
        iterations += 1;

        match probe_size(encoder, mid as u8, params) {
            Ok(size) if size <= params.target_bytes => {
                if mid as u8 > best_quality || size < best_size {
                    best_quality = mid as u8;
                    best_size = size;
                }
                hit_target = true;
                debug!("q={} -> {} bytes (fits)", mid, size);
                low = mid + 1;
            }
            Ok(size) => {
                debug!("q={} -> {} bytes (over {})", mid, size, params.target_bytes);
                high = mid - 1;
            }
            Err(e) => {
                warn!("Quality probe at {} failed, stopping search: {}", mid, e);
                break;
            }
        }
    }

    SearchOutcome {
        quality: best_quality,
        iterations,
        hit_target,
    }
}

/// [`find_quality`] on the blocking thread pool
pub async fn find_quality_blocking<E>(encoder: Arc<E>, params: SearchParams) -> SearchOutcome
where
    E: ScratchEncoder + 'static,
{
    let ceiling = params.ceiling;
    match tokio::task::spawn_blocking(move || find_quality(encoder.as_ref(), &params)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("Quality search task failed: {}", e);
            SearchOutcome {
                quality: ceiling,
                iterations: 0,
                hit_target: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OptimizeError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Output size grows linearly with quality: 1000 bytes per point
    struct LinearEncoder {
        calls: AtomicU32,
        fail_after: Option<u32>,
    }

    impl LinearEncoder {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_after: None,
            }
        }

        fn failing_after(n: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_after: Some(n),
            }
        }
    }

    impl ScratchEncoder for LinearEncoder {
        fn encode(&self, quality: u8, dst: &Path) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_after.is_some_and(|n| call >= n) {
                return Err(OptimizeError::encode("fake", "boom"));
            }
            std::fs::write(dst, vec![0u8; quality as usize * 1000])?;
            Ok(())
        }
    }

    fn params(dir: &Path, target: u64, floor: u8, ceiling: u8) -> SearchParams {
        SearchParams {
            target_bytes: target,
            floor,
            ceiling,
            has_quality_axis: true,
            scratch_dir: dir.to_path_buf(),
            suffix: ".jpg".to_string(),
        }
    }

    #[test]
    fn test_finds_highest_quality_under_target() {
        let dir = TempDir::new().unwrap();
        let encoder = LinearEncoder::new();
        let outcome = find_quality(&encoder, &params(dir.path(), 60_000, 45, 75));
        assert_eq!(outcome.quality, 60);
        assert_eq!(outcome.iterations, 5);
        assert!(outcome.hit_target);
    }

    #[test]
    fn test_bounds_and_iteration_budget() {
        let dir = TempDir::new().unwrap();
        for target in [0u64, 1_000, 44_000, 57_500, 70_000, 200_000] {
            let encoder = LinearEncoder::new();
            let outcome = find_quality(&encoder, &params(dir.path(), target, 1, 100));
            assert!((1..=100).contains(&outcome.quality));
            assert!(outcome.iterations <= MAX_SEARCH_ITERATIONS);
            assert_eq!(encoder.calls.load(Ordering::SeqCst), outcome.iterations);
        }
    }

    #[test]
    fn test_unreachable_target_returns_ceiling() {
        let dir = TempDir::new().unwrap();
        let outcome = find_quality(&LinearEncoder::new(), &params(dir.path(), 10, 55, 85));
        assert_eq!(outcome.quality, 85);
        assert!(!outcome.hit_target);
    }

    #[test]
    fn test_lossless_short_circuits() {
        let dir = TempDir::new().unwrap();
        let encoder = LinearEncoder::new();
        let mut p = params(dir.path(), 1, 60, 90);
        p.has_quality_axis = false;
        let outcome = find_quality(&encoder, &p);
        assert_eq!(outcome.quality, 90);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_encode_failure_keeps_best_so_far() {
        let dir = TempDir::new().unwrap();
        // first probe (q=60) fits, second one fails
        let encoder = LinearEncoder::failing_after(1);
        let outcome = find_quality(&encoder, &params(dir.path(), 65_000, 45, 75));
        assert_eq!(outcome.quality, 60);
        assert_eq!(outcome.iterations, 2);

        let encoder = LinearEncoder::failing_after(0);
        let outcome = find_quality(&encoder, &params(dir.path(), 65_000, 45, 75));
        assert_eq!(outcome.quality, 75);
    }

    #[test]
    fn test_scratch_files_are_removed() {
        let dir = TempDir::new().unwrap();
        find_quality(&LinearEncoder::new(), &params(dir.path(), 60_000, 45, 75));
        find_quality(&LinearEncoder::failing_after(2), &params(dir.path(), 60_000, 45, 75));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_blocking_wrapper() {
        let dir = TempDir::new().unwrap();
        let outcome = find_quality_blocking(Arc::new(LinearEncoder::new()), params(dir.path(), 60_000, 45, 75)).await;
        assert_eq!(outcome.quality, 60);
    }
}
