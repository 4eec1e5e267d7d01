//! JPEG marker scanner.
//!
//! Walks the length-prefixed marker segments after SOI until the first
//! start-of-frame segment, which carries the sample precision and the image
//! dimensions. Segments in between are skipped by their declared length
//! without being fetched, except a JFIF APP0 segment, whose pixel density is
//! kept as the physical pixel size.

use byteorder::{BigEndian, ByteOrder};
use tracing::trace;

use super::{HeaderParser, Step};
use crate::error::HeaderError;
use crate::io::WindowCache;
use crate::model::{FieldSet, Format, Length, LengthUnit, SampleType};

/// Bytes requested past a missing marker so that short segments that follow
/// do not each cost a round trip.
const READ_AHEAD: u64 = 4096;

/// Total bytes the scanner may request before giving up on finding a frame header.
const SCAN_BUDGET: u64 = 32 * 1024;

const MAX_SEGMENTS: u32 = 256;

const SOF_BODY_LEN: u64 = 6;
const JFIF_BODY_LEN: u64 = 14;

fn is_start_of_frame(marker: u8) -> bool {
    matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
}

#[derive(Debug)]
pub struct JpegParser {
    /// Offset of the next marker.
    pos: u64,
    requested: u64,
    segments: u32,
    density: Option<(Length, Length)>,
}

impl Default for JpegParser {
    fn default() -> Self {
        Self::new()
    }
}

impl JpegParser {
    pub fn new() -> Self {
        Self {
            pos: 0,
            requested: 0,
            segments: 0,
            density: None,
        }
    }

    /// Ask for `len` bytes at `offset`, reading ahead while the budget allows.
    fn request(&mut self, held: &WindowCache, offset: u64, len: u64) -> Result<Step, HeaderError> {
        let available = held.size().saturating_sub(offset);
        let mut want = len.max(READ_AHEAD.min(available));
        if self.requested + want > SCAN_BUDGET {
            want = len;
        }
        if self.requested + want > SCAN_BUDGET {
            return Err(HeaderError::invalid_header(format!(
                "no JPEG frame header within {SCAN_BUDGET} scanned bytes"
            )));
        }
        self.requested += want;
        Ok(Step::need(offset, want))
    }

    fn read_jfif(&mut self, app: &[u8]) {
        if &app[..5] != b"JFIF\0" {
            return;
        }
        let unit = match app[7] {
            1 => LengthUnit::Inch,
            2 => LengthUnit::Centimetre,
            _ => return,
        };
        let x = BigEndian::read_u16(&app[8..10]);
        let y = BigEndian::read_u16(&app[10..12]);
        if x > 0 && y > 0 {
            self.density = Some((
                Length::new(1.0 / x as f64, unit),
                Length::new(1.0 / y as f64, unit),
            ));
        }
    }

    fn finish(&self, sof: &[u8]) -> Result<Step, HeaderError> {
        let sample_type = match sof[0] {
            1..=8 => SampleType::Unsigned(8),
            9..=16 => SampleType::Unsigned(16),
            other => {
                return Err(HeaderError::invalid_header(format!(
                    "unsupported JPEG sample precision {other}"
                )));
            }
        };

        let mut fields = FieldSet::for_format(Format::Jpeg);
        fields.height = Some(BigEndian::read_u16(&sof[1..3]) as u64);
        fields.width = Some(BigEndian::read_u16(&sof[3..5]) as u64);
        fields.sample_type = Some(sample_type);
        if let Some((x, y)) = self.density {
            fields.voxel_x = Some(x);
            fields.voxel_y = Some(y);
        }
        Ok(Step::Done(fields))
    }
}

impl HeaderParser for JpegParser {
    fn resume(&mut self, held: &WindowCache) -> Result<Step, HeaderError> {
        loop {
            let Some(m) = held.get(self.pos, 2) else {
                return self.request(held, self.pos, 2);
            };
            if m[0] != 0xFF {
                return Err(HeaderError::invalid_header(format!(
                    "JPEG marker sync lost at offset {}",
                    self.pos
                )));
            }
            let marker = m[1];

            match marker {
                // Fill byte before a marker.
                0xFF => {
                    self.pos += 1;
                    continue;
                }
                // SOI, TEM and RSTn stand alone.
                0xD8 | 0x01 | 0xD0..=0xD7 => {
                    self.pos += 2;
                    continue;
                }
                0xD9 => {
                    return Err(HeaderError::invalid_header(
                        "end of image before any frame header",
                    ));
                }
                0xDA => {
                    return Err(HeaderError::invalid_header(
                        "scan data before any frame header",
                    ));
                }
                _ => {}
            }

            let Some(h) = held.get(self.pos, 4) else {
                return self.request(held, self.pos, 4);
            };
            let seg_len = BigEndian::read_u16(&h[2..4]) as u64;
            if seg_len < 2 {
                return Err(HeaderError::invalid_header(format!(
                    "invalid JPEG segment length {seg_len} at offset {}",
                    self.pos
                )));
            }
            let body = self.pos + 4;

            if is_start_of_frame(marker) {
                if seg_len < 2 + SOF_BODY_LEN {
                    return Err(HeaderError::invalid_header("JPEG frame header too short"));
                }
                let Some(sof) = held.get(body, SOF_BODY_LEN) else {
                    return self.request(held, body, SOF_BODY_LEN);
                };
                return self.finish(sof);
            }

            if marker == 0xE0 && seg_len >= 2 + JFIF_BODY_LEN && self.density.is_none() {
                let Some(app) = held.get(body, JFIF_BODY_LEN) else {
                    return self.request(held, body, JFIF_BODY_LEN);
                };
                self.read_jfif(app);
            }

            trace!(marker, offset = self.pos, len = seg_len, "skipping JPEG segment");
            self.segments += 1;
            if self.segments > MAX_SEGMENTS {
                return Err(HeaderError::invalid_header(format!(
                    "no JPEG frame header within {MAX_SEGMENTS} segments"
                )));
            }
            self.pos += 2 + seg_len;
        }
    }
}
