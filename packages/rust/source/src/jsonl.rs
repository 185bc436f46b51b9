//! File-backed source reading one raw record per line (a JSON export of the
//! document store).

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use treedump_shared::{RawRecord, RawRecordBatch, Result, TreeDumpError};

use crate::{BatchRequest, DocumentSource};

/// Streams records from a JSON-lines export.
pub struct JsonLinesSource {
    path: PathBuf,
    reader: BufReader<File>,
    line_no: usize,
    /// A record read past the end of the previous batch.
    pending: Option<(RawRecord, usize)>,
    records_skipped: u64,
    exhausted: bool,
}

impl JsonLinesSource {
    /// Open the export at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| TreeDumpError::io(path, e))?;
        info!(path = %path.display(), "opened JSON-lines source");
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            line_no: 0,
            pending: None,
            records_skipped: 0,
            exhausted: false,
        })
    }

    /// Records dropped so far by the request's path filters.
    pub fn records_skipped(&self) -> u64 {
        self.records_skipped
    }

    /// Read the next non-blank line as a record, with its size in bytes.
    fn read_record(&mut self) -> Result<Option<(RawRecord, usize)>> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .map_err(|e| TreeDumpError::Source(format!("{}: {e}", self.path.display())))?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let record: RawRecord = serde_json::from_str(trimmed).map_err(|e| {
                TreeDumpError::Source(format!(
                    "{}:{}: invalid record: {e}",
                    self.path.display(),
                    self.line_no
                ))
            })?;
            return Ok(Some((record, trimmed.len())));
        }
    }
}

impl DocumentSource for JsonLinesSource {
    fn next_batch(&mut self, request: &BatchRequest) -> Result<Option<RawRecordBatch>> {
        let mut batch = RawRecordBatch::default();

        while batch.len() < request.max_documents {
            let next = match self.pending.take() {
                Some(pending) => Some(pending),
                None if self.exhausted => None,
                None => self.read_record()?,
            };
            let Some((record, size)) = next else {
                self.exhausted = true;
                break;
            };

            if !request.accepts_record(&record) {
                self.records_skipped += 1;
                continue;
            }
            if !batch.is_empty() && batch.size_bytes + size > request.max_bytes {
                self.pending = Some((record, size));
                break;
            }
            batch.push(record, size);
        }

        if batch.is_empty() {
            debug!(
                path = %self.path.display(),
                lines = self.line_no,
                skipped = self.records_skipped,
                "source exhausted"
            );
            return Ok(None);
        }
        Ok(Some(batch))
    }

    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PathFilter;

    fn write_export(lines: &[&str]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("td-jsonl-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("export.jsonl");
        std::fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    fn request(max_bytes: usize, max_documents: usize) -> BatchRequest {
        BatchRequest {
            max_bytes,
            max_documents,
            path_filters: vec![],
        }
    }

    #[test]
    fn batches_respect_document_cap() {
        let path = write_export(&[
            r#"{"_id":"1:/a"}"#,
            r#"{"_id":"1:/b"}"#,
            "",
            r#"{"_id":"1:/c"}"#,
        ]);
        let mut source = JsonLinesSource::open(&path).unwrap();
        let req = request(1 << 20, 2);

        let first = source.next_batch(&req).unwrap().unwrap();
        assert_eq!(first.len(), 2);
        let second = source.next_batch(&req).unwrap().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second.records[0].id, "1:/c");
        assert!(source.next_batch(&req).unwrap().is_none());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn batches_respect_size_cap_but_never_starve() {
        let path = write_export(&[
            r#"{"_id":"1:/a","big":"xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx"}"#,
            r#"{"_id":"1:/b"}"#,
            r#"{"_id":"1:/c"}"#,
        ]);
        let mut source = JsonLinesSource::open(&path).unwrap();
        let req = request(30, 100);

        // Larger than the cap, returned alone.
        let first = source.next_batch(&req).unwrap().unwrap();
        assert_eq!(first.len(), 1);
        // Two 14-byte records fit in 30 bytes.
        let second = source.next_batch(&req).unwrap().unwrap();
        assert_eq!(second.len(), 2);
        assert!(source.next_batch(&req).unwrap().is_none());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn applies_path_filters() {
        let path = write_export(&[
            r#"{"_id":"1:/content"}"#,
            r#"{"_id":"2:/content/a"}"#,
            r#"{"_id":"1:/apps"}"#,
        ]);
        let mut source = JsonLinesSource::open(&path).unwrap();
        let req = BatchRequest {
            max_bytes: 1 << 20,
            max_documents: 100,
            path_filters: vec![PathFilter::new(vec!["/content".into()], vec![])],
        };
        let batch = source.next_batch(&req).unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(source.records_skipped(), 1);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn malformed_line_is_a_source_error() {
        let path = write_export(&[r#"{"_id":"1:/a"}"#, "{not json"]);
        let mut source = JsonLinesSource::open(&path).unwrap();
        let err = source.next_batch(&request(1 << 20, 100)).unwrap_err();
        assert!(matches!(err, TreeDumpError::Source(_)));
        assert!(err.to_string().contains(":2:"));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let missing = std::env::temp_dir().join("td-jsonl-missing").join("nope.jsonl");
        assert!(matches!(
            JsonLinesSource::open(&missing),
            Err(TreeDumpError::Io { .. })
        ));
    }
}
