//! # Tool Path Resolver
//!
//! Finds the external encoders and probes the engine relies on:
//! - a bundled engine directory (`Config::tools_dir`, `SHRINKIFY_TOOLS_DIR`,
//!   or `engine/` next to the executable)
//! - the system `PATH`
//!
//! A tool that cannot be found is not an error at this level: its chain links
//! are disabled for the run and the rest of the batch proceeds.

use crate::error::{OptimizeError, Result};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// External binaries used by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tool {
    Ffmpeg,
    Ffprobe,
    Cjpeg,
    Oxipng,
    Pngquant,
}

impl Tool {
    pub const ALL: [Tool; 5] = [Tool::Ffmpeg, Tool::Ffprobe, Tool::Cjpeg, Tool::Oxipng, Tool::Pngquant];

    pub fn binary_name(&self) -> &'static str {
        match self {
            Tool::Ffmpeg => "ffmpeg",
            Tool::Ffprobe => "ffprobe",
            Tool::Cjpeg => "cjpeg",
            Tool::Oxipng => "oxipng",
            Tool::Pngquant => "pngquant",
        }
    }

    fn purpose(&self) -> &'static str {
        match self {
            Tool::Ffmpeg => "video encoding and remuxing",
            Tool::Ffprobe => "video metadata probing",
            Tool::Cjpeg => "JPEG optimizing encoder (mozjpeg)",
            Tool::Oxipng => "lossless PNG re-optimizer",
            Tool::Pngquant => "PNG palette quantizer",
        }
    }

    fn install_hint(&self) -> &'static str {
        match self {
            Tool::Ffmpeg | Tool::Ffprobe => "sudo apt-get install ffmpeg",
            Tool::Cjpeg => "install mozjpeg (provides cjpeg)",
            Tool::Oxipng => "cargo install oxipng",
            Tool::Pngquant => "sudo apt-get install pngquant",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary_name())
    }
}

/// Resolved tool paths for one run
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    paths: BTreeMap<Tool, PathBuf>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool path (used by tests and by the resolver)
    pub fn with(mut self, tool: Tool, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(tool, path.into());
        self
    }

    pub fn get(&self, tool: Tool) -> Option<&Path> {
        self.paths.get(&tool).map(PathBuf::as_path)
    }

    pub fn is_available(&self, tool: Tool) -> bool {
        self.paths.contains_key(&tool)
    }

    pub fn require(&self, tool: Tool) -> Result<&Path> {
        self.get(tool)
            .ok_or_else(|| OptimizeError::ToolMissing(tool.binary_name().to_string()))
    }

    pub fn missing(&self) -> Vec<Tool> {
        Tool::ALL.into_iter().filter(|t| !self.is_available(*t)).collect()
    }
}

/// Tool path resolver for bundled and system installs
pub struct ToolPathResolver {
    tools_dir: Option<PathBuf>,
}

impl ToolPathResolver {
    pub fn new(configured_dir: Option<&Path>) -> Self {
        Self {
            tools_dir: Self::detect_bundled_tools_dir(configured_dir),
        }
    }

    fn detect_bundled_tools_dir(configured_dir: Option<&Path>) -> Option<PathBuf> {
        if let Some(dir) = configured_dir {
            if dir.is_dir() {
                debug!("Using configured tools directory: {:?}", dir);
                return Some(dir.to_path_buf());
            }
            warn!("Configured tools directory not found: {:?}", dir);
        }

        if let Ok(dir) = env::var("SHRINKIFY_TOOLS_DIR") {
            let dir = PathBuf::from(dir);
            if dir.is_dir() {
                debug!("Found tools directory via SHRINKIFY_TOOLS_DIR: {:?}", dir);
                return Some(dir);
            }
        }

        let exe_dir = env::current_exe().ok()?.parent()?.to_path_buf();
        let engine_dir = exe_dir.join("engine");
        if engine_dir.is_dir() {
            debug!("Found bundled engine directory: {:?}", engine_dir);
            return Some(engine_dir);
        }

        debug!("No bundled tools directory, relying on PATH");
        None
    }

    fn bundled_path(tools_dir: &Path, tool: Tool) -> Option<PathBuf> {
        let file_name = format!("{}{}", tool.binary_name(), env::consts::EXE_SUFFIX);
        let candidates = [
            tools_dir.join(&file_name),
            tools_dir.join(env::consts::OS).join(&file_name),
        ];
        candidates.into_iter().find(|p| p.is_file())
    }

    /// Resolve one tool: bundled directory first, then `PATH`
    pub fn resolve(&self, tool: Tool) -> Option<PathBuf> {
        if let Some(ref dir) = self.tools_dir {
            if let Some(path) = Self::bundled_path(dir, tool) {
                debug!("Using bundled {} -> {:?}", tool, path);
                return Some(path);
            }
        }

        match which::which(tool.binary_name()) {
            Ok(path) => {
                debug!("Using system {} -> {:?}", tool, path);
                Some(path)
            }
            Err(_) => None,
        }
    }

    /// Resolve every tool; missing ones are logged and left out
    pub fn resolve_all(&self) -> ToolSet {
        let mut set = ToolSet::new();
        for tool in Tool::ALL {
            match self.resolve(tool) {
                Some(path) => set = set.with(tool, path),
                None => warn!("{} not found, {} disabled for this run", tool, tool.purpose()),
            }
        }
        set
    }

    /// Availability report for the `tools` command
    pub fn report(&self) -> String {
        let mut report = String::from("Tool availability\n");
        match self.tools_dir {
            Some(ref dir) => report.push_str(&format!("Bundled tools dir: {}\n", dir.display())),
            None => report.push_str("Bundled tools dir: none (using PATH)\n"),
        }
        report.push('\n');

        for tool in Tool::ALL {
            match self.resolve(tool) {
                Some(path) => report.push_str(&format!("  [OK]      {:<9} {}\n", tool, path.display())),
                None => report.push_str(&format!(
                    "  [MISSING] {:<9} {} (install: {})\n",
                    tool,
                    tool.purpose(),
                    tool.install_hint()
                )),
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_toolset_require() {
        let set = ToolSet::new().with(Tool::Ffmpeg, "/opt/engine/ffmpeg");
        assert_eq!(set.require(Tool::Ffmpeg).unwrap(), Path::new("/opt/engine/ffmpeg"));
        assert!(matches!(set.require(Tool::Cjpeg), Err(OptimizeError::ToolMissing(ref t)) if t == "cjpeg"));
        assert_eq!(set.missing(), vec![Tool::Ffprobe, Tool::Cjpeg, Tool::Oxipng, Tool::Pngquant]);
    }

    #[test]
    fn test_bundled_dir_takes_precedence() {
        let dir = TempDir::new().unwrap();
        let fake = dir.path().join(format!("pngquant{}", env::consts::EXE_SUFFIX));
        std::fs::write(&fake, b"").unwrap();

        let resolver = ToolPathResolver::new(Some(dir.path()));
        assert_eq!(resolver.resolve(Tool::Pngquant), Some(fake));
    }

    #[test]
    fn test_report_lists_every_tool() {
        let dir = TempDir::new().unwrap();
        let resolver = ToolPathResolver::new(Some(dir.path()));
        let report = resolver.report();
        for tool in Tool::ALL {
            assert!(report.contains(tool.binary_name()));
        }
    }
}
