//! # Utility Functions Module
//!
//! Small helpers shared by the toolchain and the reporting code: argument
//! vector building for external tools, byte formatting and reduction math.

use std::path::Path;

/// Converts any iterable of string-like items into the owned argument vector
/// expected by an external tool invocation.
///
/// ```rust
/// use shrinkify::utils::to_string_vec;
///
/// let crf = 23;
/// let args = to_string_vec(["-crf", &crf.to_string(), "-preset", "slow"]);
/// assert_eq!(args, ["-crf", "23", "-preset", "slow"]);
/// ```
pub fn to_string_vec<T, I>(items: I) -> Vec<String>
where
    T: ToString,
    I: IntoIterator<Item = T>,
{
    items.into_iter().map(|item| item.to_string()).collect()
}

/// Builds a `Vec<String>` from mixed displayable values.
///
/// ```rust
/// use shrinkify::args;
///
/// let quality = 85;
/// let argv = args!["-quality", quality, "-optimize"];
/// assert_eq!(argv, ["-quality", "85", "-optimize"]);
/// ```
#[macro_export]
macro_rules! args {
    [$($item:expr),* $(,)?] => {
        $crate::utils::to_string_vec([$(($item).to_string()),*])
    };
}

/// Lossy path-to-argument conversion for tool command lines
pub fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Human readable byte size (`1.50 MB`)
pub fn format_bytes(size: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = size as f64;
    let mut unit = 0;

    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{:.2} {}", value, UNITS[unit])
}

/// Percentage of `original` removed by shrinking it to `new`.
/// Zero when nothing was saved or the original is empty.
pub fn reduction_percent(original: u64, new: u64) -> f64 {
    if original == 0 || new >= original {
        0.0
    } else {
        (original - new) as f64 / original as f64 * 100.0
    }
}
