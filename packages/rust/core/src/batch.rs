//! Fixed-capacity entry batches.
//!
//! A batch packs serialized entries as `<u32 BE length><payload>` into one byte
//! region allocated up front. Each entry gets a [`SortKey`] pointing at its
//! offset. Batches are cleared and reused, never reallocated.

use treedump_shared::{Result, TreeDumpError};

/// Size of the length prefix in front of every entry.
pub const ENTRY_LENGTH_PREFIX: usize = 4;

/// Orders and locates one entry within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub path: String,
    /// Offset of the entry's length prefix in the batch buffer.
    pub offset: usize,
}

#[derive(Debug)]
pub struct NodeEntryBatch {
    buffer: Vec<u8>,
    sort_keys: Vec<SortKey>,
    capacity_bytes: usize,
    max_entries: usize,
}

impl NodeEntryBatch {
    pub fn new(capacity_bytes: usize, max_entries: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity_bytes),
            sort_keys: Vec::new(),
            capacity_bytes,
            max_entries,
        }
    }

    /// True if an entry with a payload of `payload_len` bytes fits.
    pub fn has_space_for(&self, payload_len: usize) -> bool {
        self.sort_keys.len() < self.max_entries
            && self.buffer.len() + ENTRY_LENGTH_PREFIX + payload_len <= self.capacity_bytes
    }

    /// Append an entry. Returns its offset.
    pub fn add_entry(&mut self, path: &str, payload: &[u8]) -> Result<usize> {
        if !self.has_space_for(payload.len()) {
            return Err(TreeDumpError::validation(format!(
                "entry for '{path}' ({} bytes) does not fit in batch ({} of {} bytes used, {} of {} entries)",
                payload.len(),
                self.buffer.len(),
                self.capacity_bytes,
                self.sort_keys.len(),
                self.max_entries
            )));
        }
        let len = u32::try_from(payload.len()).map_err(|_| {
            TreeDumpError::validation(format!("entry for '{path}' is larger than 4 GiB"))
        })?;

        let offset = self.buffer.len();
        self.buffer.extend_from_slice(&len.to_be_bytes());
        self.buffer.extend_from_slice(payload);
        self.sort_keys.push(SortKey {
            path: path.to_string(),
            offset,
        });
        Ok(offset)
    }

    /// The payload written at `offset`.
    pub fn payload_at(&self, offset: usize) -> Result<&[u8]> {
        let start = offset + ENTRY_LENGTH_PREFIX;
        let prefix = self
            .buffer
            .get(offset..start)
            .ok_or_else(|| TreeDumpError::validation(format!("no entry at offset {offset}")))?;
        let mut len = [0u8; ENTRY_LENGTH_PREFIX];
        len.copy_from_slice(prefix);
        let end = start + u32::from_be_bytes(len) as usize;
        self.buffer
            .get(start..end)
            .ok_or_else(|| TreeDumpError::validation(format!("truncated entry at offset {offset}")))
    }

    /// Sort keys by path. Equal paths keep insertion order.
    pub fn sort(&mut self) {
        self.sort_keys.sort_by(|a, b| a.path.cmp(&b.path));
    }

    pub fn sort_keys(&self) -> &[SortKey] {
        &self.sort_keys
    }

    /// Forget all entries, keeping the allocation.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.sort_keys.clear();
    }

    pub fn len(&self) -> usize {
        self.sort_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sort_keys.is_empty()
    }

    /// Bytes written, length prefixes included.
    pub fn size_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Address of the byte region, to check that it is reused.
    #[cfg(test)]
    pub(crate) fn region_ptr(&self) -> *const u8 {
        self.buffer.as_ptr()
    }
}
