//! # Optimizer Module
//!
//! Batch execution split into submodules:
//! - `media_optimizer`: batch orchestrator (Idle/Running, batch loops)
//! - `task_optimizer`: per-file image and video jobs
//! - `progress_tracker`: event emission and summary aggregation
//! - `path_resolver`: output and temporary path naming

pub mod media_optimizer;
pub mod path_resolver;
pub mod progress_tracker;
pub mod task_optimizer;

pub use media_optimizer::{BatchHandle, BatchOrchestrator, OrchestratorState};
pub use path_resolver::PathResolver;
pub use progress_tracker::ProgressTracker;
pub use task_optimizer::TaskOptimizer;
