//! K-way merge of sorted segment files.
//!
//! At most [`MERGE_FAN_IN`] segments are open at once. Longer segment lists
//! are merged in passes: consecutive groups are merged into intermediate
//! segments until one group remains, so equal paths keep segment order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use treedump_shared::{Result, TreeDumpError};

use crate::format::{StoredEntry, read_record, write_record};

/// Heap item: the next entry of one segment.
struct Head {
    entry: StoredEntry,
    segment: usize,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    // Reversed: BinaryHeap is a max-heap and we pop the smallest path first.
    // Equal paths come out in segment order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .entry
            .path
            .cmp(&self.entry.path)
            .then_with(|| other.segment.cmp(&self.segment))
    }
}

/// Segments open at once during a merge.
pub(crate) const MERGE_FAN_IN: usize = 64;

/// Merge `segments` into `out`, never opening more than `fan_in` of them at once.
///
/// Intermediate segments are written to `work_dir` and removed as soon as
/// they are merged. Returns the number of entries written to `out`.
pub(crate) fn merge_in_passes<W: Write>(
    segments: &[PathBuf],
    work_dir: &Path,
    fan_in: usize,
    out: &mut W,
) -> Result<u64> {
    let fan_in = fan_in.max(2);
    let mut current = segments.to_vec();
    let mut intermediate = false;
    let mut pass = 0usize;

    while current.len() > fan_in {
        pass += 1;
        let mut next = Vec::with_capacity(current.len().div_ceil(fan_in));
        for (group, inputs) in current.chunks(fan_in).enumerate() {
            let path = work_dir.join(format!("merge-{pass:03}-{group:06}.dat"));
            let file = File::create(&path).map_err(|e| TreeDumpError::io(&path, e))?;
            let mut writer = BufWriter::new(file);
            merge_segments(inputs, &mut writer)?;
            writer.flush().map_err(|e| TreeDumpError::io(&path, e))?;
            if intermediate {
                remove_all(inputs)?;
            }
            next.push(path);
        }
        debug!(pass, inputs = current.len(), outputs = next.len(), "merge pass finished");
        current = next;
        intermediate = true;
    }

    let written = merge_segments(&current, out)?;
    if intermediate {
        remove_all(&current)?;
    }
    Ok(written)
}

fn remove_all(paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        std::fs::remove_file(path).map_err(|e| TreeDumpError::io(path, e))?;
    }
    Ok(())
}

/// Merge the sorted `segments` into `out`. Returns the number of entries written.
pub(crate) fn merge_segments<W: Write>(segments: &[PathBuf], out: &mut W) -> Result<u64> {
    let mut readers = Vec::with_capacity(segments.len());
    for path in segments {
        let file = File::open(path).map_err(|e| TreeDumpError::io(path, e))?;
        readers.push(BufReader::new(file));
    }

    let mut heap = BinaryHeap::with_capacity(readers.len());
    for (segment, reader) in readers.iter_mut().enumerate() {
        if let Some(entry) = read_record(reader).map_err(|e| TreeDumpError::io(&segments[segment], e))? {
            heap.push(Head { entry, segment });
        }
    }

    let mut written = 0u64;
    while let Some(Head { entry, segment }) = heap.pop() {
        write_record(out, &entry.path, &entry.data)
            .map_err(|e| TreeDumpError::Storage(format!("merge write failed: {e}")))?;
        written += 1;

        if let Some(next) = read_record(&mut readers[segment])
            .map_err(|e| TreeDumpError::io(&segments[segment], e))?
        {
            if next.path < entry.path {
                return Err(TreeDumpError::Storage(format!(
                    "segment {} is not sorted: '{}' after '{}'",
                    segments[segment].display(),
                    next.path,
                    entry.path
                )));
            }
            heap.push(Head {
                entry: next,
                segment,
            });
        }
    }

    debug!(segments = segments.len(), entries = written, "segments merged");
    Ok(written)
}
