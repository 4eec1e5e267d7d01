use std::fs::File;
use std::path::Path;

use async_trait::async_trait;
use memmap2::Mmap;

use super::{BlockingReadAt, ByteSpan, FetchError, Fetched, ReadAt};
use crate::error::HeaderError;

/// Memory-mapped local file.
///
/// Reads are plain slice copies out of the mapping; they never suspend, even
/// under the async shell.
pub struct MappedFile {
    map: Option<Mmap>,
    size: u64,
}

impl MappedFile {
    pub fn open(path: &Path) -> Result<Self, HeaderError> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();

        // Zero-length files cannot be mapped on every platform.
        let map = if size == 0 {
            None
        } else {
            // SAFETY: the mapping is read-only and lives no longer than this
            // session; concurrent truncation of the file by another process
            // is outside what this reader defends against.
            Some(unsafe { Mmap::map(&file)? })
        };

        Ok(Self { map, size })
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn slice(&self, span: ByteSpan) -> Result<Fetched, HeaderError> {
        if span.end() > self.size {
            return Err(HeaderError::truncated(format!(
                "requested {} bytes at offset {}, file has {} bytes",
                span.len, span.offset, self.size
            )));
        }
        let bytes = match &self.map {
            Some(map) => map[span.offset as usize..span.end() as usize].to_vec(),
            None => Vec::new(),
        };
        Ok(Fetched::counted(bytes))
    }
}

impl BlockingReadAt for MappedFile {
    fn read_at(&mut self, span: ByteSpan) -> Result<Fetched, FetchError> {
        Ok(self.slice(span)?)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[async_trait]
impl ReadAt for MappedFile {
    async fn read_at(&mut self, span: ByteSpan) -> Result<Fetched, FetchError> {
        Ok(self.slice(span)?)
    }

    fn size(&self) -> u64 {
        self.size
    }
}
