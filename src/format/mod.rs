//! Format detection and header parsers.
//!
//! Parsers never perform I/O. Each one is a small state machine that looks at
//! the bytes already held in the session's [`WindowCache`] and either finishes
//! with a [`FieldSet`] or asks for one more byte span with [`Step::Need`]. The
//! session satisfies the request (blocking or suspending, it does not matter
//! to the parser) and calls [`HeaderParser::resume`] again.
//!
//! ## Supported formats
//!
//! - [`png`]: IHDR immediately after the signature
//! - [`jpeg`]: marker segments scanned up to the first SOF
//! - [`mrc`]: one fixed 1024-byte block
//! - [`tiff`]: offset-chained image file directories, classic and BigTIFF

mod detect;
mod jpeg;
mod mrc;
mod png;
mod tiff;

pub use detect::{Detection, SIGNATURE_WINDOW, detect};
pub use jpeg::JpegParser;
pub use mrc::MrcParser;
pub use png::PngParser;
pub use tiff::TiffParser;

use crate::error::HeaderError;
use crate::io::{ByteSpan, WindowCache};
use crate::model::{ExtractOptions, FieldSet, Format};

/// One transition of a parser.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The parser cannot progress until these bytes are resident.
    Need(ByteSpan),
    /// All fields the parser can recover.
    Done(FieldSet),
}

impl Step {
    pub fn need(offset: u64, len: u64) -> Self {
        Step::Need(ByteSpan::new(offset, len))
    }
}

/// A resumable header parser.
pub trait HeaderParser {
    /// Advance as far as the resident bytes allow.
    ///
    /// Must only return [`Step::Need`] for spans that are not fully resident,
    /// and must make progress whenever it is resumed after such a span arrived.
    fn resume(&mut self, held: &WindowCache) -> Result<Step, HeaderError>;
}

/// The parser selected for a detected format.
#[derive(Debug)]
pub enum FormatParser {
    Png(PngParser),
    Jpeg(JpegParser),
    Mrc(MrcParser),
    Tiff(TiffParser),
}

impl FormatParser {
    pub fn new(format: Format, options: &ExtractOptions) -> Self {
        match format {
            Format::Png => FormatParser::Png(PngParser::new()),
            Format::Jpeg => FormatParser::Jpeg(JpegParser::new()),
            Format::Mrc => FormatParser::Mrc(MrcParser::new()),
            Format::Tiff => FormatParser::Tiff(TiffParser::new(
                options.max_directory_hops,
                options.count_directories,
            )),
        }
    }
}

impl HeaderParser for FormatParser {
    fn resume(&mut self, held: &WindowCache) -> Result<Step, HeaderError> {
        match self {
            FormatParser::Png(p) => p.resume(held),
            FormatParser::Jpeg(p) => p.resume(held),
            FormatParser::Mrc(p) => p.resume(held),
            FormatParser::Tiff(p) => p.resume(held),
        }
    }
}

/// Drive a parser against a fully known byte buffer, recording every span
/// that would have been fetched.
#[cfg(test)]
pub(crate) fn run_resident<P: HeaderParser>(
    parser: &mut P,
    file: &[u8],
) -> (Result<FieldSet, HeaderError>, Vec<ByteSpan>) {
    let mut cache = WindowCache::new(file.len() as u64);
    let mut fetched = Vec::new();
    loop {
        match parser.resume(&cache) {
            Ok(Step::Done(fields)) => return (Ok(fields), fetched),
            Ok(Step::Need(span)) => {
                if span.end() > file.len() as u64 {
                    return (
                        Err(HeaderError::truncated("test request beyond end")),
                        fetched,
                    );
                }
                let gap = cache
                    .missing(span)
                    .expect("parser asked for resident bytes");
                cache.insert(
                    gap.offset,
                    file[gap.offset as usize..gap.end() as usize].to_vec(),
                );
                fetched.push(gap);
                assert!(fetched.len() < 10_000, "parser does not terminate");
            }
            Err(err) => return (Err(err), fetched),
        }
    }
}
