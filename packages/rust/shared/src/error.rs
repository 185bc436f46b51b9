//! Error types for treedump.
//!
//! Library crates use [`TreeDumpError`] via `thiserror`.
//! The cli app wraps this with `color-eyre` for rich diagnostics.

use std::fmt;
use std::path::PathBuf;

/// Identifies the pipeline stage a failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// The single worker streaming raw records from the document source.
    Download,
    /// One of the transform workers, by worker id.
    Transform(usize),
    /// The single worker sorting full batches into the output store.
    SortAndStore,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Download => write!(f, "download"),
            StageKind::Transform(id) => write!(f, "transform-{id}"),
            StageKind::SortAndStore => write!(f, "sort-and-store"),
        }
    }
}

/// Top-level error type for all treedump operations.
#[derive(Debug, thiserror::Error)]
pub enum TreeDumpError {
    /// Configuration loading or validation error. Raised before anything starts.
    #[error("config error: {message}")]
    Config { message: String },

    /// Connectivity or read failure reported by the document source.
    #[error("source error: {0}")]
    Source(String),

    /// Output store error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (malformed record id, invalid path, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// JSON encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The stage was stopped by the coordinator.
    #[error("cancelled")]
    Cancelled,

    /// A pipeline stage failed. Carries the originating cause.
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: StageKind,
        #[source]
        source: Box<TreeDumpError>,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, TreeDumpError>;

impl TreeDumpError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Attribute an error to a pipeline stage. Already attributed errors are
    /// returned as they are.
    pub fn stage(stage: StageKind, err: TreeDumpError) -> Self {
        match err {
            already @ Self::Stage { .. } => already,
            other => Self::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage this error is attributed to, if any.
    pub fn failed_stage(&self) -> Option<StageKind> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// True if this error (or its stage cause) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Stage { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for TreeDumpError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = TreeDumpError::config("transform_threads must be > 0");
        assert_eq!(err.to_string(), "config error: transform_threads must be > 0");

        let err = TreeDumpError::stage(
            StageKind::Download,
            TreeDumpError::Source("connection reset".into()),
        );
        assert_eq!(
            err.to_string(),
            "download stage failed: source error: connection reset"
        );
    }

    #[test]
    fn stage_wrapping_is_idempotent() {
        let inner = TreeDumpError::stage(StageKind::Transform(1), TreeDumpError::Cancelled);
        let outer = TreeDumpError::stage(StageKind::SortAndStore, inner);
        assert_eq!(outer.failed_stage(), Some(StageKind::Transform(1)));
        assert!(outer.is_cancelled());
    }

    #[test]
    fn stage_kind_display() {
        assert_eq!(StageKind::Transform(3).to_string(), "transform-3");
        assert_eq!(StageKind::SortAndStore.to_string(), "sort-and-store");
    }
}
