//! Memory budget planning.
//!
//! All buffer sizing happens here, once, before any stage is started. A budget
//! that cannot give every buffer at least [`MIN_ENTRY_BATCH_BUFFER_SIZE_MB`] is
//! rejected as a configuration error.

use sysinfo::System;
use tracing::{debug, info};

use treedump_shared::{Result, TreeDumpError};

const ONE_MB: u64 = 1024 * 1024;

/// Lower clamp for auto-detected working memory.
pub const MIN_AUTODETECT_WORKING_MEMORY_MB: u64 = 128;
/// Upper clamp for auto-detected working memory.
pub const MAX_AUTODETECT_WORKING_MEMORY_MB: u64 = 4000;
/// Memory left to the rest of the process when auto-detecting.
pub const AUTODETECT_RESERVED_MEMORY_MB: u64 = 2048;
/// Smallest usable entry batch buffer.
pub const MIN_ENTRY_BATCH_BUFFER_SIZE_MB: u64 = 32;
/// Largest byte region a single buffer may address.
pub const MAX_BUFFER_SIZE_BYTES: u64 = i32::MAX as u64 - 16;
/// Estimated footprint of one sort key (path string plus offset).
pub const SORT_KEY_ESTIMATED_BYTES: u64 = 256;

/// Sizes derived once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBudget {
    pub total_bytes: u64,
    /// Transform workers + 1.
    pub buffer_count: usize,
    pub per_buffer_bytes: usize,
    /// Sort-key array reserve, per buffer.
    pub sort_keys_reserved_bytes: u64,
    /// Entry cap of one buffer, derived from the sort-key reserve.
    pub max_entries_per_buffer: usize,
}

impl MemoryBudget {
    /// Plan buffers for `transform_threads` workers out of `total_bytes`.
    pub fn plan(total_bytes: u64, transform_threads: usize, sort_buffer_memory_percentage: u32) -> Result<Self> {
        if transform_threads == 0 {
            return Err(TreeDumpError::config("transform thread count must be > 0"));
        }
        if sort_buffer_memory_percentage == 0 || sort_buffer_memory_percentage > 100 {
            return Err(TreeDumpError::config(format!(
                "invalid sort buffer memory percentage: {sort_buffer_memory_percentage}. Must be between 1 and 100"
            )));
        }

        let buffer_count = transform_threads + 1;
        let sort_keys_reserved_bytes =
            estimate_sort_keys_reserve(total_bytes, buffer_count, sort_buffer_memory_percentage);
        let remaining = total_bytes.saturating_sub(sort_keys_reserved_bytes);
        let per_buffer = limit_to_buffer_range(remaining / buffer_count as u64);

        if per_buffer < MIN_ENTRY_BATCH_BUFFER_SIZE_MB * ONE_MB {
            return Err(TreeDumpError::config(format!(
                "entry batch buffer size too small: {}. Must be at least {}. \
                 Increase working_memory_mb or reduce transform_threads",
                format_bytes(per_buffer),
                format_bytes(MIN_ENTRY_BATCH_BUFFER_SIZE_MB * ONE_MB)
            )));
        }

        let max_entries_per_buffer = (sort_keys_reserved_bytes / SORT_KEY_ESTIMATED_BYTES).max(1) as usize;

        debug!(
            total = %format_bytes(total_bytes),
            buffer_count,
            per_buffer = %format_bytes(per_buffer),
            sort_keys_reserved = %format_bytes(sort_keys_reserved_bytes),
            max_entries_per_buffer,
            "memory budget planned"
        );

        Ok(Self {
            total_bytes,
            buffer_count,
            per_buffer_bytes: per_buffer as usize,
            sort_keys_reserved_bytes,
            max_entries_per_buffer,
        })
    }
}

/// Bytes reserved for one buffer's sort-key array.
pub fn estimate_sort_keys_reserve(total_bytes: u64, buffer_count: usize, percentage: u32) -> u64 {
    let approx_buffer_size = limit_to_buffer_range(total_bytes / buffer_count.max(1) as u64);
    approx_buffer_size * u64::from(percentage) / 100
}

/// Clamp a buffer size to what a single buffer can address.
pub fn limit_to_buffer_range(bytes: u64) -> u64 {
    bytes.min(MAX_BUFFER_SIZE_BYTES)
}

/// Working memory in bytes. `0` means auto-detect from available memory.
pub fn resolve_working_memory_bytes(configured_mb: u32) -> u64 {
    if configured_mb > 0 {
        return u64::from(configured_mb) * ONE_MB;
    }
    let mut system = System::new();
    system.refresh_memory();
    let available_mb = system.available_memory() / ONE_MB;
    let mb = clamp_autodetected_mb(available_mb);
    info!(available_mb, working_memory_mb = mb, "auto-detected working memory");
    mb * ONE_MB
}

/// Available memory minus the process reserve, clamped to the autodetect range.
pub fn clamp_autodetected_mb(available_mb: u64) -> u64 {
    available_mb
        .saturating_sub(AUTODETECT_RESERVED_MEMORY_MB)
        .clamp(MIN_AUTODETECT_WORKING_MEMORY_MB, MAX_AUTODETECT_WORKING_MEMORY_MB)
}

/// Human-readable binary byte count.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
