//! On-disk record format shared by segments and the merged data file.
//!
//! Each record is `<u32 BE path_len><path><u32 BE data_len><data>`.

use std::io::{self, Read, Write};

use sha2::{Digest, Sha256};

/// One entry read back from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// Node path, the sort key.
    pub path: String,
    /// Serialized node state.
    pub data: Vec<u8>,
}

impl StoredEntry {
    /// The data as UTF-8, if it is valid.
    pub fn data_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// Append one record. Returns the number of bytes written.
pub(crate) fn write_record<W: Write>(writer: &mut W, path: &str, data: &[u8]) -> io::Result<usize> {
    let path_len = u32::try_from(path.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path too long"))?;
    let data_len = u32::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry data too long"))?;
    writer.write_all(&path_len.to_be_bytes())?;
    writer.write_all(path.as_bytes())?;
    writer.write_all(&data_len.to_be_bytes())?;
    writer.write_all(data)?;
    Ok(8 + path.len() + data.len())
}

/// Read one record. `Ok(None)` on a clean end of file; a record cut short is
/// an `UnexpectedEof` error.
pub(crate) fn read_record<R: Read>(reader: &mut R) -> io::Result<Option<StoredEntry>> {
    let mut len = [0u8; 4];
    if !read_exact_or_eof(reader, &mut len)? {
        return Ok(None);
    }
    let mut path = vec![0u8; u32::from_be_bytes(len) as usize];
    reader.read_exact(&mut path)?;
    let path = String::from_utf8(path)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    reader.read_exact(&mut len)?;
    let mut data = vec![0u8; u32::from_be_bytes(len) as usize];
    reader.read_exact(&mut data)?;
    Ok(Some(StoredEntry { path, data }))
}

/// Fill `buf`, returning false if the reader was already at end of file.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Writer that hashes everything passing through it.
pub(crate) struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Hex digest and the inner writer.
    pub(crate) fn finish(self) -> (String, W) {
        (format!("{:x}", self.hasher.finalize()), self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_back_what_was_written() {
        let mut buf = Vec::new();
        let written = write_record(&mut buf, "/a/b", b"{\"x\":1}").unwrap();
        assert_eq!(written, buf.len());
        write_record(&mut buf, "/c", b"").unwrap();

        let mut cursor = io::Cursor::new(buf);
        let first = read_record(&mut cursor).unwrap().unwrap();
        assert_eq!(first.path, "/a/b");
        assert_eq!(first.data_str(), Some("{\"x\":1}"));
        let second = read_record(&mut cursor).unwrap().unwrap();
        assert_eq!(second.path, "/c");
        assert!(second.data.is_empty());
        assert!(read_record(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn truncated_record_is_an_error() {
        let mut buf = Vec::new();
        write_record(&mut buf, "/a", b"payload").unwrap();
        buf.truncate(buf.len() - 3);
        let err = read_record(&mut io::Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn hashing_writer_matches_direct_digest() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"hello world").unwrap();
        let (digest, inner) = writer.finish();
        assert_eq!(inner, b"hello world");
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
