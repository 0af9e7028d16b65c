//! # Error Types Module
//!
//! Error taxonomy for the compression engine.
//!
//! ## Categories:
//! - `Analysis`: metadata unreadable or a required stream is missing. The file
//!   is counted as failed and the batch continues.
//! - `Encode`: a tool exited non-zero or left no usable output. Triggers the
//!   next fallback link or an escalated retry; terminal only once the chain
//!   and the attempts are exhausted.
//! - `SizeNotReduced`: the output is not smaller than the input. Never
//!   surfaces to callers, it is resolved by copying the original.
//! - `ToolMissing`: an external binary is absent. The capability is disabled
//!   for the run.
//! - `FatalBatch`: input/output directories are unusable. Aborts the batch.
//!
//! Per-file errors are converted into counters at the orchestrator boundary;
//! only `FatalBatch`, `Busy` and `Config` reach the caller.

use std::path::PathBuf;

/// Errors produced by the compression engine
#[derive(thiserror::Error, Debug)]
pub enum OptimizeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Analysis failed for {path}: {reason}")]
    Analysis { path: PathBuf, reason: String },

    #[error("{tool} failed: {reason}")]
    Encode { tool: String, reason: String },

    #[error("Output is not smaller than the source ({new_size} >= {original_size} bytes)")]
    SizeNotReduced { original_size: u64, new_size: u64 },

    #[error("Dependency missing: {0}")]
    ToolMissing(String),

    #[error("Batch aborted: {0}")]
    FatalBatch(String),

    #[error("A batch is already running")]
    Busy,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl OptimizeError {
    pub fn analysis(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Analysis {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn encode(tool: impl ToString, reason: impl ToString) -> Self {
        Self::Encode {
            tool: tool.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OptimizeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_context() {
        let err = OptimizeError::analysis("/videos/a.mp4", "no video stream");
        assert_eq!(err.to_string(), "Analysis failed for /videos/a.mp4: no video stream");

        let err = OptimizeError::encode("ffmpeg", "exit status 1");
        assert_eq!(err.to_string(), "ffmpeg failed: exit status 1");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: OptimizeError = io.into();
        assert!(matches!(err, OptimizeError::Io(_)));
    }
}
