//! Raw record types read from the document store, and path helpers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TreeDumpError};

// ---------------------------------------------------------------------------
// RawRecord
// ---------------------------------------------------------------------------

/// One document as stored in the backing document store.
///
/// The id has the form `<depth>:<path>`. Paths too long to be used as ids are
/// stored under a hashed id (`<depth>:h<hash>`) with the real path in `_path`.
/// Ids of the form `<depth>:p/...` belong to split (previous) documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Document id.
    #[serde(rename = "_id")]
    pub id: String,

    /// Explicit path, present for documents with a hashed id.
    #[serde(rename = "_path", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Set when the node no longer exists at the revision being dumped.
    #[serde(rename = "_deleted", default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,

    /// All other fields. Keys starting with `_` are system fields.
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// What a record id refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPath {
    /// A node document at the given path.
    Node(String),
    /// A split (previous) document, holding old revisions only.
    Split,
}

impl RawRecord {
    /// Create a live node record for `path` with the given fields.
    pub fn node(path: &str, fields: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            id: format!("{}:{path}", path_depth(path)),
            path: None,
            deleted: false,
            fields,
        }
    }

    /// Reconstruct the logical path of this record from its id.
    pub fn resolve_path(&self) -> Result<RecordPath> {
        let (depth, rest) = self.id.split_once(':').ok_or_else(|| {
            TreeDumpError::validation(format!("malformed record id '{}'", self.id))
        })?;
        if depth.is_empty() || !depth.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TreeDumpError::validation(format!(
                "malformed record id '{}': missing depth",
                self.id
            )));
        }

        if rest.starts_with('/') {
            Ok(RecordPath::Node(rest.to_string()))
        } else if rest.starts_with("p/") {
            Ok(RecordPath::Split)
        } else if rest.starts_with('h') {
            match &self.path {
                Some(path) if path.starts_with('/') => Ok(RecordPath::Node(path.clone())),
                _ => Err(TreeDumpError::validation(format!(
                    "record '{}' has a hashed id but no valid _path",
                    self.id
                ))),
            }
        } else {
            Err(TreeDumpError::validation(format!(
                "malformed record id '{}'",
                self.id
            )))
        }
    }

    /// Approximate in-memory size, used to bound batches.
    pub fn approximate_size(&self) -> usize {
        let fields: usize = self
            .fields
            .iter()
            .map(|(k, v)| k.len() + v.to_string().len())
            .sum();
        self.id.len() + self.path.as_ref().map_or(0, String::len) + fields
    }
}

// ---------------------------------------------------------------------------
// RawRecordBatch
// ---------------------------------------------------------------------------

/// Records retrieved together from the store, bounded by size and count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecordBatch {
    /// The records, in the order the source produced them.
    pub records: Vec<RawRecord>,
    /// Sum of the approximate sizes of `records`.
    pub size_bytes: usize,
}

impl RawRecordBatch {
    /// Build a batch, computing its size.
    pub fn new(records: Vec<RawRecord>) -> Self {
        let size_bytes = records.iter().map(RawRecord::approximate_size).sum();
        Self {
            records,
            size_bytes,
        }
    }

    /// Append one record whose size is already known.
    pub fn push(&mut self, record: RawRecord, size: usize) {
        self.size_bytes += size;
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Number of elements in an absolute path. The root has depth 0.
pub fn path_depth(path: &str) -> usize {
    path.split('/').filter(|e| !e.is_empty()).count()
}

/// A path is hidden if any of its elements starts with `:`.
pub fn is_hidden_path(path: &str) -> bool {
    path.split('/').any(|e| e.starts_with(':'))
}

/// The ancestor of `path` made of at most `depth` elements (`/` for depth 0).
pub fn path_prefix(path: &str, depth: usize) -> String {
    let elements: Vec<&str> = path.split('/').filter(|e| !e.is_empty()).take(depth).collect();
    if elements.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", elements.join("/"))
    }
}
