use byteorder::{BigEndian, ByteOrder};

use super::{HeaderParser, Step};
use crate::error::HeaderError;
use crate::io::WindowCache;
use crate::model::{FieldSet, Format, SampleType};

const SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Signature (8) + IHDR length (4) + type (4) + data (13) + CRC (4).
const IHDR_END: u64 = 33;
const IHDR_DATA_LEN: u32 = 13;

/// PNG reader. IHDR is always the first chunk, so one window ending at its
/// CRC is all it ever needs.
#[derive(Debug, Default)]
pub struct PngParser;

impl PngParser {
    pub fn new() -> Self {
        Self
    }
}

impl HeaderParser for PngParser {
    fn resume(&mut self, held: &WindowCache) -> Result<Step, HeaderError> {
        let Some(buf) = held.get(0, IHDR_END) else {
            return Ok(Step::need(0, IHDR_END));
        };

        if &buf[..8] != SIGNATURE {
            return Err(HeaderError::invalid_header("invalid PNG signature"));
        }
        if BigEndian::read_u32(&buf[8..12]) != IHDR_DATA_LEN || &buf[12..16] != b"IHDR" {
            return Err(HeaderError::invalid_header("IHDR chunk not found"));
        }

        let stored = BigEndian::read_u32(&buf[29..33]);
        if crc32fast::hash(&buf[12..29]) != stored {
            return Err(HeaderError::invalid_header("IHDR CRC mismatch"));
        }

        let width = BigEndian::read_u32(&buf[16..20]);
        let height = BigEndian::read_u32(&buf[20..24]);
        let bit_depth = buf[24];

        let mut fields = FieldSet::for_format(Format::Png);
        fields.width = Some(width as u64);
        fields.height = Some(height as u64);
        fields.sample_type = Some(if bit_depth == 16 {
            SampleType::Unsigned(16)
        } else {
            SampleType::Unsigned(8)
        });
        Ok(Step::Done(fields))
    }
}
