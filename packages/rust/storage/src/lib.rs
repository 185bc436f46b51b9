//! Path-ordered output store consumed by the index builder.
//!
//! A [`SortedStoreWriter`] receives runs of entries that are each sorted by
//! path and writes every run as its own segment. [`SortedStoreWriter::close`]
//! merges the segments into a single globally ordered data file and then
//! publishes the store by writing `manifest.json`. A directory without a
//! manifest is an unpublished (partial) store and must not be read.
//!
//! Layout:
//! ```text
//! <dir>/
//! ├── manifest.json        (written last)
//! ├── entries.dat          (merged, globally ordered)
//! └── segments/            (only while writing)
//!     └── segment-000001.dat
//! ```

mod format;
mod merge;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use treedump_shared::{Result, TreeDumpError};

pub use format::StoredEntry;
use format::{HashingWriter, read_record, write_record};

/// Current version of the on-disk store format.
pub const STORE_FORMAT_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest.json";
const DATA_FILE: &str = "entries.dat";
const SEGMENTS_DIR: &str = "segments";

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// The `manifest.json` structure of a published store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreManifest {
    /// Format version for forward compatibility.
    pub format_version: u32,
    /// Number of entries in `entries.dat`.
    pub entry_count: u64,
    /// Number of segments merged into `entries.dat`.
    pub segments_merged: usize,
    /// SHA-256 of `entries.dat`.
    pub sha256: String,
    /// When the store was published.
    pub created_at: DateTime<Utc>,
    /// Opaque label of the repository state that was dumped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
}

/// A segment written by [`SortedStoreWriter::append`].
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub path: PathBuf,
    pub entries: u64,
    pub bytes: u64,
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Append-only writer of sorted runs.
pub struct SortedStoreWriter {
    dir: PathBuf,
    segments_dir: PathBuf,
    segments: Vec<SegmentInfo>,
    entries_appended: u64,
    checkpoint: Option<String>,
    merge_fan_in: usize,
}

impl SortedStoreWriter {
    /// Open a new store in `dir`, creating the directory if needed.
    ///
    /// Fails if `dir` already holds a published store. Segments left behind
    /// by an earlier, unpublished run are discarded.
    pub fn open(dir: &Path) -> Result<Self> {
        if dir.join(MANIFEST_FILE).exists() {
            return Err(TreeDumpError::Storage(format!(
                "{} already contains a published store",
                dir.display()
            )));
        }

        let segments_dir = dir.join(SEGMENTS_DIR);
        if segments_dir.exists() {
            debug!(path = %segments_dir.display(), "removing stale segments");
            std::fs::remove_dir_all(&segments_dir)
                .map_err(|e| TreeDumpError::io(&segments_dir, e))?;
        }
        std::fs::create_dir_all(&segments_dir).map_err(|e| TreeDumpError::io(&segments_dir, e))?;

        info!(path = %dir.display(), "opened sorted store");
        Ok(Self {
            dir: dir.to_path_buf(),
            segments_dir,
            segments: Vec::new(),
            entries_appended: 0,
            checkpoint: None,
            merge_fan_in: merge::MERGE_FAN_IN,
        })
    }

    /// Record the checkpoint label written into the manifest.
    pub fn set_checkpoint(&mut self, checkpoint: Option<String>) {
        self.checkpoint = checkpoint;
    }

    /// Limit the segments opened at once by [`close`](Self::close). At least 2.
    pub fn set_merge_fan_in(&mut self, fan_in: usize) {
        self.merge_fan_in = fan_in.max(2);
    }

    /// Store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Entries appended so far, across all segments.
    pub fn entries_appended(&self) -> u64 {
        self.entries_appended
    }

    /// Segments written so far.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Write one sorted run as a new segment. Entries must come in
    /// non-decreasing path order. An empty run writes nothing.
    pub fn append<'a, I>(&mut self, entries: I) -> Result<Option<SegmentInfo>>
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let mut entries = entries.into_iter().peekable();
        if entries.peek().is_none() {
            return Ok(None);
        }

        let path = self
            .segments_dir
            .join(format!("segment-{:06}.dat", self.segments.len() + 1));
        let file = File::create(&path).map_err(|e| TreeDumpError::io(&path, e))?;
        let mut writer = BufWriter::new(file);

        let mut count = 0u64;
        let mut bytes = 0u64;
        let mut previous: Option<&str> = None;
        for (entry_path, data) in entries {
            if let Some(prev) = previous {
                if entry_path < prev {
                    return Err(TreeDumpError::Storage(format!(
                        "entries appended out of order: '{entry_path}' after '{prev}'"
                    )));
                }
            }
            bytes += write_record(&mut writer, entry_path, data)
                .map_err(|e| TreeDumpError::io(&path, e))? as u64;
            count += 1;
            previous = Some(entry_path);
        }
        writer.flush().map_err(|e| TreeDumpError::io(&path, e))?;

        let info = SegmentInfo {
            path,
            entries: count,
            bytes,
        };
        debug!(
            segment = %info.path.display(),
            entries = info.entries,
            bytes = info.bytes,
            "segment written"
        );
        self.entries_appended += count;
        self.segments.push(info.clone());
        Ok(Some(info))
    }

    /// Merge all segments into the data file and publish the store.
    #[instrument(skip_all, fields(dir = %self.dir.display(), segments = self.segments.len()))]
    pub fn close(self) -> Result<StoreManifest> {
        let data_path = self.dir.join(DATA_FILE);
        let tmp_data = self.dir.join(format!("{DATA_FILE}.tmp"));

        let file = File::create(&tmp_data).map_err(|e| TreeDumpError::io(&tmp_data, e))?;
        let mut writer = HashingWriter::new(BufWriter::new(file));
        let segment_paths: Vec<PathBuf> = self.segments.iter().map(|s| s.path.clone()).collect();
        let entry_count =
            merge::merge_in_passes(&segment_paths, &self.segments_dir, self.merge_fan_in, &mut writer)?;
        writer.flush().map_err(|e| TreeDumpError::io(&tmp_data, e))?;
        let (sha256, _) = writer.finish();

        if entry_count != self.entries_appended {
            return Err(TreeDumpError::Storage(format!(
                "merged {entry_count} entries but {} were appended",
                self.entries_appended
            )));
        }

        std::fs::rename(&tmp_data, &data_path).map_err(|e| TreeDumpError::io(&data_path, e))?;
        std::fs::remove_dir_all(&self.segments_dir)
            .map_err(|e| TreeDumpError::io(&self.segments_dir, e))?;

        let manifest = StoreManifest {
            format_version: STORE_FORMAT_VERSION,
            entry_count,
            segments_merged: self.segments.len(),
            sha256,
            created_at: Utc::now(),
            checkpoint: self.checkpoint,
        };
        write_manifest(&self.dir, &manifest)?;

        info!(
            entries = manifest.entry_count,
            segments = manifest.segments_merged,
            "sorted store published"
        );
        Ok(manifest)
    }
}

/// Write the manifest through a temp file so readers never see a partial one.
fn write_manifest(dir: &Path, manifest: &StoreManifest) -> Result<()> {
    let path = dir.join(MANIFEST_FILE);
    let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
    let json = serde_json::to_string_pretty(manifest)?;
    std::fs::write(&tmp, json).map_err(|e| TreeDumpError::io(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| TreeDumpError::io(&path, e))?;
    Ok(())
}

/// True if `dir` holds a published store.
pub fn is_published(dir: &Path) -> bool {
    dir.join(MANIFEST_FILE).is_file()
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Read access to a published store.
pub struct SortedStoreReader {
    dir: PathBuf,
    manifest: StoreManifest,
}

impl SortedStoreReader {
    /// Open the published store in `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        if !path.is_file() {
            return Err(TreeDumpError::Storage(format!(
                "{} does not contain a published store",
                dir.display()
            )));
        }
        let content = std::fs::read_to_string(&path).map_err(|e| TreeDumpError::io(&path, e))?;
        let manifest: StoreManifest = serde_json::from_str(&content)?;
        if manifest.format_version > STORE_FORMAT_VERSION {
            return Err(TreeDumpError::Storage(format!(
                "store format version {} not supported (max {STORE_FORMAT_VERSION})",
                manifest.format_version
            )));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
        })
    }

    pub fn manifest(&self) -> &StoreManifest {
        &self.manifest
    }

    /// Iterate over all entries in path order.
    pub fn entries(&self) -> Result<StoreEntries> {
        let path = self.dir.join(DATA_FILE);
        let file = File::open(&path).map_err(|e| TreeDumpError::io(&path, e))?;
        Ok(StoreEntries {
            path,
            reader: BufReader::new(file),
        })
    }

    /// Recompute the data file digest and compare it with the manifest.
    pub fn verify(&self) -> Result<()> {
        let path = self.dir.join(DATA_FILE);
        let mut file = File::open(&path).map_err(|e| TreeDumpError::io(&path, e))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).map_err(|e| TreeDumpError::io(&path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest = format!("{:x}", hasher.finalize());
        if digest != self.manifest.sha256 {
            return Err(TreeDumpError::Storage(format!(
                "checksum mismatch for {}: expected {}, found {digest}",
                path.display(),
                self.manifest.sha256
            )));
        }
        Ok(())
    }
}

/// Iterator over the entries of a store.
pub struct StoreEntries {
    path: PathBuf,
    reader: BufReader<File>,
}

impl Iterator for StoreEntries {
    type Item = Result<StoredEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        read_record(&mut self.reader)
            .map_err(|e| TreeDumpError::io(&self.path, e))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store_dir() -> PathBuf {
        std::env::temp_dir().join(format!("td-store-test-{}", uuid::Uuid::now_v7()))
    }

    fn paths(reader: &SortedStoreReader) -> Vec<String> {
        reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path)
            .collect()
    }

    #[test]
    fn close_merges_more_segments_than_the_fan_in() {
        let dir = temp_store_dir();
        let mut writer = SortedStoreWriter::open(&dir).unwrap();
        writer.set_merge_fan_in(4);
        for i in (0..10).rev() {
            let path = format!("/n{i}");
            writer.append(vec![(path.as_str(), &b"{}"[..])]).unwrap();
        }
        assert_eq!(writer.segment_count(), 10);

        let manifest = writer.close().unwrap();
        assert_eq!(manifest.entry_count, 10);
        assert_eq!(manifest.segments_merged, 10);
        assert!(!dir.join(SEGMENTS_DIR).exists());

        let reader = SortedStoreReader::open(&dir).unwrap();
        let expected: Vec<String> = (0..10).map(|i| format!("/n{i}")).collect();
        assert_eq!(paths(&reader), expected);
        reader.verify().unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn appended_runs_are_merged_on_close() {
        let dir = temp_store_dir();
        let mut writer = SortedStoreWriter::open(&dir).unwrap();
        writer.set_checkpoint(Some("r17a2b-0-1".into()));

        writer
            .append(vec![("/b", &b"{}"[..]), ("/d", &b"{}"[..])])
            .unwrap();
        writer
            .append(vec![("/a", &b"{\"x\":1}"[..]), ("/c", &b"{}"[..])])
            .unwrap();
        assert!(writer.append(Vec::<(&str, &[u8])>::new()).unwrap().is_none());
        assert_eq!(writer.segment_count(), 2);
        assert_eq!(writer.entries_appended(), 4);
        assert!(!is_published(&dir));

        let manifest = writer.close().unwrap();
        assert_eq!(manifest.entry_count, 4);
        assert_eq!(manifest.segments_merged, 2);
        assert_eq!(manifest.checkpoint.as_deref(), Some("r17a2b-0-1"));
        assert!(is_published(&dir));
        assert!(!dir.join(SEGMENTS_DIR).exists());

        let reader = SortedStoreReader::open(&dir).unwrap();
        assert_eq!(reader.manifest(), &manifest);
        assert_eq!(paths(&reader), vec!["/a", "/b", "/c", "/d"]);
        let first = reader.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(first.data_str(), Some("{\"x\":1}"));
        reader.verify().unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_store_can_be_published() {
        let dir = temp_store_dir();
        let manifest = SortedStoreWriter::open(&dir).unwrap().close().unwrap();
        assert_eq!(manifest.entry_count, 0);
        let reader = SortedStoreReader::open(&dir).unwrap();
        assert!(paths(&reader).is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn out_of_order_run_is_rejected() {
        let dir = temp_store_dir();
        let mut writer = SortedStoreWriter::open(&dir).unwrap();
        let err = writer
            .append(vec![("/b", &b""[..]), ("/a", &b""[..])])
            .unwrap_err();
        assert!(err.to_string().contains("out of order"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unpublished_store_cannot_be_read() {
        let dir = temp_store_dir();
        let mut writer = SortedStoreWriter::open(&dir).unwrap();
        writer.append(vec![("/a", &b""[..])]).unwrap();
        drop(writer);

        assert!(!is_published(&dir));
        assert!(SortedStoreReader::open(&dir).is_err());

        // A new writer discards the stale segments.
        let writer = SortedStoreWriter::open(&dir).unwrap();
        assert_eq!(writer.close().unwrap().entry_count, 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn published_store_is_not_overwritten() {
        let dir = temp_store_dir();
        SortedStoreWriter::open(&dir).unwrap().close().unwrap();
        assert!(matches!(
            SortedStoreWriter::open(&dir),
            Err(TreeDumpError::Storage(_))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn verify_detects_corruption() {
        let dir = temp_store_dir();
        let mut writer = SortedStoreWriter::open(&dir).unwrap();
        writer.append(vec![("/a", &b"data"[..])]).unwrap();
        writer.close().unwrap();

        std::fs::write(dir.join(DATA_FILE), b"garbage").unwrap();
        let reader = SortedStoreReader::open(&dir).unwrap();
        assert!(reader.verify().is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
