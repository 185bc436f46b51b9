//! Shared types, error model, and configuration for treedump.
//!
//! This crate is the foundation depended on by all other treedump crates.
//! It provides:
//! - [`TreeDumpError`], the unified error type
//! - Raw record types ([`RawRecord`], [`RawRecordBatch`]) and path helpers
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, FiltersConfig, PipelineConfig, StoreConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from,
};
pub use error::{Result, StageKind, TreeDumpError};
pub use types::{RawRecord, RawRecordBatch, RecordPath, is_hidden_path, path_depth, path_prefix};
