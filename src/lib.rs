//! # Shrinkify Library
//!
//! Adaptive compression engine for image and video collections.
//!
//! ## Module layout:
//! - `config`: run configuration and validation
//! - `error`: error taxonomy
//! - `tool_resolver` / `toolchain`: external encoders and their fallback chains
//! - `media_probe`: image and video metadata
//! - `profile` / `planner` / `quality_search`: compression decisions
//! - `events`: worker → shell messages and batch summaries
//! - `file_manager`: input discovery and file helpers
//! - `optimizer`: batch orchestrator and per-file jobs
//! - `progress`: terminal rendering of batch events
//!
//! ## Usage:
//! ```rust,no_run
//! use shrinkify::{BatchOrchestrator, Config};
//!
//! # async fn demo() -> shrinkify::error::Result<()> {
//! let orchestrator = BatchOrchestrator::with_system_tools(Config::default())?;
//! let mut handle = orchestrator.run_images("photos", "photos_small")?;
//! while let Some(event) = handle.next_event().await {
//!     println!("{:?}", event);
//! }
//! let summary = handle.wait().await?;
//! println!("{}", summary.format_summary());
//! # Ok(())
//! # }
//! ```

pub mod utils;

pub mod config;
pub mod error;
pub mod events;
pub mod file_manager;
pub mod media_probe;
pub mod optimizer;
pub mod planner;
pub mod profile;
pub mod progress;
pub mod quality_search;
pub mod tool_resolver;
pub mod toolchain;

pub use config::Config;
pub use error::OptimizeError;
pub use events::{BatchEvent, BatchSummary, FileDisposition, FileOutcome};
pub use optimizer::{BatchHandle, BatchOrchestrator, OrchestratorState};
pub use profile::Profile;
