use async_trait::async_trait;

use super::{BlockingReadAt, ByteSpan, FetchError, Fetched, ReadAt};
use crate::error::HeaderError;

/// A fully resident origin body.
///
/// Backs the bulk strategy (the whole remote file was fetched once up front)
/// and resident parsing of caller-supplied buffers. Slices served from it are
/// free: the body was accounted for when it was pulled.
pub struct MemorySource {
    body: Vec<u8>,
}

impl MemorySource {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body }
    }

    pub fn len(&self) -> u64 {
        self.body.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    fn slice(&self, span: ByteSpan) -> Result<Fetched, HeaderError> {
        if span.end() > self.body.len() as u64 {
            return Err(HeaderError::truncated(format!(
                "requested {} bytes at offset {}, body has {} bytes",
                span.len,
                span.offset,
                self.body.len()
            )));
        }
        let bytes = self.body[span.offset as usize..span.end() as usize].to_vec();
        Ok(Fetched::resident(bytes))
    }
}

impl BlockingReadAt for MemorySource {
    fn read_at(&mut self, span: ByteSpan) -> Result<Fetched, FetchError> {
        Ok(self.slice(span)?)
    }

    fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

#[async_trait]
impl ReadAt for MemorySource {
    async fn read_at(&mut self, span: ByteSpan) -> Result<Fetched, FetchError> {
        Ok(self.slice(span)?)
    }

    fn size(&self) -> u64 {
        self.body.len() as u64
    }
}
