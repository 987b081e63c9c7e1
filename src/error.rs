use std::io;

use thiserror::Error;

/// Errors surfaced while loading inputs or persisting artifacts.
///
/// Everything that can go wrong here is detected before clustering begins or
/// while writing result files; the clustering algorithms themselves are total
/// and signal logic bugs by panicking instead.
#[derive(Error, Debug)]
pub enum FlowspecError {
    /// A flow references a label that is not present in the hierarchy file.
    #[error("unknown label '{label}' on line {line}")]
    UnknownLabel { label: String, line: usize },

    /// A flow line produced no path elements.
    #[error("empty flow on line {line}")]
    EmptyFlow { line: usize },

    /// An IPv4 prefix failed to parse.
    #[error("malformed IPv4 prefix '{text}'")]
    BadPrefix { text: String },

    /// The hierarchical labeling file is structurally invalid.
    #[error("invalid label hierarchy: {0}")]
    BadHierarchy(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
