#![allow(dead_code)]

use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fastheader::io::{ByteSpan, FullBody};
use fastheader::{AsyncHttpTransport, HeaderError, HttpTransport, Probe, RangeReply};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

pub const TIFF_WIDTH: u16 = 256;
pub const TIFF_HEIGHT: u16 = 257;

/// Classic TIFF with inline SHORT entries only.
///
/// Directories are laid out back to back starting at offset 8; each one points
/// at the next, and the last one points at `cycle_to` (a directory index) or 0.
pub struct TiffBuilder {
    pub little_endian: bool,
    pub pages: Vec<Vec<(u16, u16)>>,
    pub cycle_to: Option<usize>,
    pub tail: usize,
}

impl TiffBuilder {
    pub fn new(pages: usize, width: u16, height: u16) -> Self {
        Self {
            little_endian: true,
            pages: vec![vec![(TIFF_WIDTH, width), (TIFF_HEIGHT, height)]; pages],
            cycle_to: None,
            tail: 0,
        }
    }

    fn u16(&self, v: u16) -> [u8; 2] {
        if self.little_endian { v.to_le_bytes() } else { v.to_be_bytes() }
    }

    fn u32(&self, v: u32) -> [u8; 4] {
        if self.little_endian { v.to_le_bytes() } else { v.to_be_bytes() }
    }

    pub fn directory_offsets(&self) -> Vec<u32> {
        let mut offsets = Vec::new();
        let mut at = 8u32;
        for page in &self.pages {
            offsets.push(at);
            at += 2 + 12 * page.len() as u32 + 4;
        }
        offsets
    }

    pub fn build(&self) -> Vec<u8> {
        let offsets = self.directory_offsets();
        let mut out = if self.little_endian { b"II*\x00".to_vec() } else { b"MM\x00*".to_vec() };
        out.extend_from_slice(&self.u32(8));

        for (i, page) in self.pages.iter().enumerate() {
            out.extend_from_slice(&self.u16(page.len() as u16));
            for (tag, value) in page {
                out.extend_from_slice(&self.u16(*tag));
                out.extend_from_slice(&self.u16(3));
                out.extend_from_slice(&self.u32(1));
                out.extend_from_slice(&self.u16(*value));
                out.extend_from_slice(&[0, 0]);
            }
            let next = match offsets.get(i + 1) {
                Some(next) => *next,
                None => self.cycle_to.map_or(0, |target| offsets[target]),
            };
            out.extend_from_slice(&self.u32(next));
        }
        out.extend(std::iter::repeat_n(0x5Au8, self.tail));
        out
    }
}

/// Little-endian MRC header block followed by `tail` bytes of voxel data.
pub fn mrc(dims: [i32; 3], mode: i32, cell: [f32; 3], tail: usize) -> Vec<u8> {
    let mut block = vec![0u8; 1024];
    let mut put = |at: usize, bytes: [u8; 4]| block[at..at + 4].copy_from_slice(&bytes);
    for (i, v) in dims.iter().enumerate() {
        put(i * 4, v.to_le_bytes());
        put(28 + i * 4, v.to_le_bytes());
    }
    put(12, mode.to_le_bytes());
    for (i, v) in cell.iter().enumerate() {
        put(40 + i * 4, v.to_le_bytes());
    }
    block[208..212].copy_from_slice(b"MAP ");
    block[212] = 0x44;
    block[213] = 0x44;
    block.extend(std::iter::repeat_n(0u8, tail));
    block
}

pub fn png(width: u32, height: u32, bit_depth: u8, tail: usize) -> Vec<u8> {
    let mut out = b"\x89PNG\r\n\x1a\n".to_vec();
    let mut chunk = b"IHDR".to_vec();
    chunk.extend_from_slice(&width.to_be_bytes());
    chunk.extend_from_slice(&height.to_be_bytes());
    chunk.extend_from_slice(&[bit_depth, 0, 0, 0, 0]);
    out.extend_from_slice(&13u32.to_be_bytes());
    out.extend_from_slice(&chunk);
    out.extend_from_slice(&crc32fast::hash(&chunk).to_be_bytes());
    out.extend(std::iter::repeat_n(0u8, tail));
    out
}

/// Baseline JPEG: SOI, a 20 KB EXIF segment, SOF0, then `tail` bytes.
pub fn jpeg(width: u16, height: u16, tail: usize) -> Vec<u8> {
    let mut out = vec![0xFF, 0xD8, 0xFF, 0xE1];
    out.extend_from_slice(&20_002u16.to_be_bytes());
    out.extend(std::iter::repeat_n(0u8, 20_000));
    out.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 8]);
    out.extend_from_slice(&height.to_be_bytes());
    out.extend_from_slice(&width.to_be_bytes());
    out.extend_from_slice(&[3, 1, 0x22, 0, 2, 0x11, 1, 3, 0x11, 1]);
    out.extend(std::iter::repeat_n(0u8, tail));
    out
}

pub fn temp_file(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

/// One exchange seen by [`MockServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Head,
    Range(u64, u64),
    Get,
}

/// In-memory HTTP origin for both shells.
pub struct MockServer {
    pub body: Vec<u8>,
    pub accept_ranges: bool,
    /// Content-Length to advertise; defaults to the body length.
    pub advertised_size: Option<Option<u64>>,
    /// Answer range GETs with 200 and the whole body.
    pub ignore_range: bool,
    pub fail: bool,
    /// Added to every exchange.
    pub delay: Duration,
    /// Added to range GETs only.
    pub range_delay: Duration,
    log: Mutex<Vec<Request>>,
}

impl MockServer {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            accept_ranges: true,
            advertised_size: None,
            ignore_range: false,
            fail: false,
            delay: Duration::ZERO,
            range_delay: Duration::ZERO,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn without_ranges(body: Vec<u8>) -> Self {
        Self {
            accept_ranges: false,
            ..Self::new(body)
        }
    }

    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, request: Request) -> Result<(), HeaderError> {
        self.log.lock().unwrap().push(request);
        if self.fail {
            return Err(HeaderError::network("connection refused"));
        }
        Ok(())
    }

    fn probe(&self) -> Probe {
        Probe {
            size: self.advertised_size.unwrap_or(Some(self.body.len() as u64)),
            accepts_ranges: self.accept_ranges,
        }
    }

    /// The whole body, streamed until it reaches `cap`.
    fn full(&self, cap: u64) -> FullBody {
        if self.body.len() as u64 >= cap {
            FullBody::Oversized(cap)
        } else {
            FullBody::Complete(self.body.clone())
        }
    }

    fn range(&self, span: ByteSpan, cap: u64) -> RangeReply {
        if self.ignore_range || !self.accept_ranges {
            return RangeReply::Full(self.full(cap));
        }
        let len = self.body.len() as u64;
        if span.offset >= len {
            return RangeReply::NotSatisfiable;
        }
        let end = span.end().min(len);
        RangeReply::Partial(self.body[span.offset as usize..end as usize].to_vec())
    }

    /// Sleep for `delay`, giving up when `cancel` fires or `limit` elapses.
    fn wait(
        &self,
        delay: Duration,
        cancel: &CancellationToken,
        limit: Option<Duration>,
    ) -> Result<(), HeaderError> {
        let started = Instant::now();
        while started.elapsed() < delay {
            if cancel.is_cancelled() {
                return Err(HeaderError::cancelled());
            }
            if limit.is_some_and(|limit| started.elapsed() >= limit) {
                return Err(HeaderError::timeout());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

impl HttpTransport for MockServer {
    fn head(
        &self,
        _url: &str,
        cancel: &CancellationToken,
        limit: Option<Duration>,
    ) -> Result<Probe, HeaderError> {
        self.record(Request::Head)?;
        self.wait(self.delay, cancel, limit)?;
        Ok(self.probe())
    }

    fn get_range(
        &self,
        _url: &str,
        span: ByteSpan,
        cap: u64,
        cancel: &CancellationToken,
        limit: Option<Duration>,
    ) -> Result<RangeReply, HeaderError> {
        self.record(Request::Range(span.offset, span.len))?;
        self.wait(self.delay + self.range_delay, cancel, limit)?;
        Ok(self.range(span, cap))
    }

    fn get(
        &self,
        _url: &str,
        cap: u64,
        cancel: &CancellationToken,
        limit: Option<Duration>,
    ) -> Result<FullBody, HeaderError> {
        self.record(Request::Get)?;
        self.wait(self.delay, cancel, limit)?;
        Ok(self.full(cap))
    }
}

#[async_trait]
impl AsyncHttpTransport for MockServer {
    async fn head(&self, _url: &str) -> Result<Probe, HeaderError> {
        self.record(Request::Head)?;
        tokio::time::sleep(self.delay).await;
        Ok(self.probe())
    }

    async fn get_range(
        &self,
        _url: &str,
        span: ByteSpan,
        cap: u64,
    ) -> Result<RangeReply, HeaderError> {
        self.record(Request::Range(span.offset, span.len))?;
        tokio::time::sleep(self.delay + self.range_delay).await;
        Ok(self.range(span, cap))
    }

    async fn get(&self, _url: &str, cap: u64) -> Result<FullBody, HeaderError> {
        self.record(Request::Get)?;
        tokio::time::sleep(self.delay).await;
        Ok(self.full(cap))
    }
}
