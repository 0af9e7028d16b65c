//! # Shrinkify - Main Entry Point
//!
//! ## Responsibilities:
//! - Command line parsing with `clap`
//! - Logging setup with `tracing` (`RUST_LOG` overrides the default filter)
//! - Loading the JSON run configuration and applying CLI overrides
//! - Submitting a batch and rendering its events until completion
//!
//! ## Usage:
//! ```bash
//! shrinkify images ./photos ./photos_small --profile balanced
//! shrinkify videos ./clips ./clips_small --target-ext .mp4 --no-hw
//! shrinkify image ./scan.png ./out --quality 80
//! shrinkify tools
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use shrinkify::progress::{ProgressManager, RenderMode};
use shrinkify::tool_resolver::ToolPathResolver;
use shrinkify::{BatchHandle, BatchOrchestrator, Config, Profile};

#[derive(Parser)]
#[command(name = "shrinkify", version)]
#[command(about = "Shrink image and video collections with adaptive, retrying compression")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON configuration file (default: user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print events as JSON lines instead of a progress bar
    #[arg(long, global = true)]
    json: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Compress every image of a directory
    Images {
        input: PathBuf,
        output: PathBuf,

        #[arg(short, long, value_enum)]
        profile: Option<Profile>,

        /// Do not copy videos found in the input to `your_videos/`
        #[arg(long)]
        no_video_copy: bool,
    },

    /// Compress every video of a directory
    Videos {
        input: PathBuf,
        output: PathBuf,

        #[arg(short, long, value_enum)]
        profile: Option<Profile>,

        /// Unify every output to this extension, e.g. `.mp4`
        #[arg(long)]
        target_ext: Option<String>,

        /// Convert `.ts` recordings to `.mp4`
        #[arg(long)]
        ts_to_mp4: bool,

        /// Encode small videos too
        #[arg(long)]
        no_skip_small: bool,

        /// Disable hardware encoders
        #[arg(long)]
        no_hw: bool,
    },

    /// Compress a single image at a fixed quality
    Image {
        file: PathBuf,
        output: PathBuf,

        /// Quality (1-100)
        #[arg(short, long)]
        quality: Option<u8>,
    },

    /// Show which external encoders are available
    Tools,
}

fn init_logging(verbose: bool) -> Result<()> {
    let default_filter = if verbose { "shrinkify=debug" } else { "shrinkify=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

async fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match Config::default_path() {
            Some(p) => p,
            None => return Ok(Config::default()),
        },
    };

    debug!("Loading configuration from {}", path.display());
    Config::from_file(&path)
        .await
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

async fn drive(mut handle: BatchHandle, mode: RenderMode) -> Result<()> {
    let mut manager = ProgressManager::new(mode);
    while let Some(event) = handle.next_event().await {
        manager.handle(&event)?;
    }
    handle.wait().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let mut config = load_config(cli.config.as_deref()).await?;

    let mode = if cli.json {
        RenderMode::Json
    } else {
        RenderMode::Bar { show_logs: !cli.verbose }
    };

    match cli.command {
        Command::Tools => {
            let resolver = ToolPathResolver::new(config.tools_dir.as_deref());
            print!("{}", resolver.report());
            Ok(())
        }
        Command::Images {
            input,
            output,
            profile,
            no_video_copy,
        } => {
            if let Some(profile) = profile {
                config.image_profile = profile;
            }
            if no_video_copy {
                config.copy_videos_in_image_batch = false;
            }
            let orchestrator = BatchOrchestrator::with_system_tools(config)?;
            drive(orchestrator.run_images(input, output)?, mode).await
        }
        Command::Videos {
            input,
            output,
            profile,
            target_ext,
            ts_to_mp4,
            no_skip_small,
            no_hw,
        } => {
            if let Some(profile) = profile {
                config.video_profile = profile;
            }
            if target_ext.is_some() {
                config.target_extension = target_ext;
            }
            config.convert_ts_to_mp4 |= ts_to_mp4;
            if no_skip_small {
                config.skip_small_videos = false;
            }
            if no_hw {
                config.use_hardware_accel = false;
            }
            let orchestrator = BatchOrchestrator::with_system_tools(config)?;
            drive(orchestrator.run_videos(input, output)?, mode).await
        }
        Command::Image { file, output, quality } => {
            let orchestrator = BatchOrchestrator::with_system_tools(config)?;
            drive(orchestrator.run_single_image(file, output, quality)?, mode).await
        }
    }
}
