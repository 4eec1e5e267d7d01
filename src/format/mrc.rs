//! MRC / CCP4 volumetric map header.
//!
//! The whole header is one 1024-byte block at offset 0:
//!
//! | offset | field |
//! |---|---|
//! | 0, 4, 8 | NX, NY, NZ (grid size) |
//! | 12 | MODE (sample type code) |
//! | 28, 32, 36 | MX, MY, MZ (sampling) |
//! | 40, 44, 48 | cell dimensions in Å |
//! | 208 | `MAP ` |
//! | 212 | machine stamp (byte order) |

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;
use tracing::warn;

use super::{HeaderParser, Step};
use crate::error::HeaderError;
use crate::io::WindowCache;
use crate::model::{FieldSet, Format, Length, LengthUnit, SampleType};

pub const HEADER_SIZE: u64 = 1024;

const MACHINE_STAMP: usize = 212;

fn sample_type(mode: i32) -> Option<SampleType> {
    match mode {
        0 => Some(SampleType::Signed(8)),
        1 => Some(SampleType::Signed(16)),
        2 => Some(SampleType::Float(32)),
        4 => Some(SampleType::Complex(64)),
        6 => Some(SampleType::Unsigned(16)),
        12 => Some(SampleType::Float(16)),
        _ => None,
    }
}

/// Cell length over the sampling interval count, when both are usable.
fn spacing(cell: f32, sampling: i32, grid: i32) -> Option<Length> {
    let intervals = if sampling > 0 { sampling } else { grid };
    if intervals <= 0 || !cell.is_finite() || cell <= 0.0 {
        return None;
    }
    Some(Length::new(cell as f64 / intervals as f64, LengthUnit::Angstrom))
}

fn parse_block<B: ByteOrder>(block: &[u8]) -> Result<FieldSet, HeaderError> {
    let mut cursor = Cursor::new(block);
    let truncated = |_| HeaderError::truncated("MRC header shorter than 1024 bytes");

    let nx = cursor.read_i32::<B>().map_err(truncated)?;
    let ny = cursor.read_i32::<B>().map_err(truncated)?;
    let nz = cursor.read_i32::<B>().map_err(truncated)?;
    let mode = cursor.read_i32::<B>().map_err(truncated)?;

    cursor.set_position(28);
    let mx = cursor.read_i32::<B>().map_err(truncated)?;
    let my = cursor.read_i32::<B>().map_err(truncated)?;
    let mz = cursor.read_i32::<B>().map_err(truncated)?;
    let cell_x = cursor.read_f32::<B>().map_err(truncated)?;
    let cell_y = cursor.read_f32::<B>().map_err(truncated)?;
    let cell_z = cursor.read_f32::<B>().map_err(truncated)?;

    if nx <= 0 || ny <= 0 || nz <= 0 {
        return Err(HeaderError::invalid_header(format!(
            "invalid MRC grid size {nx}x{ny}x{nz}"
        )));
    }
    let dtype = sample_type(mode)
        .ok_or_else(|| HeaderError::invalid_header(format!("unsupported MRC mode {mode}")))?;

    let mut fields = FieldSet::for_format(Format::Mrc);
    fields.width = Some(nx as u64);
    fields.height = Some(ny as u64);
    if nz > 1 {
        fields.depth = Some(nz as u64);
    }
    fields.sample_type = Some(dtype);
    fields.voxel_x = spacing(cell_x, mx, nx);
    fields.voxel_y = spacing(cell_y, my, ny);
    fields.voxel_z = spacing(cell_z, mz, nz);
    Ok(fields)
}

/// Single-block MRC reader: one fetch of the 1024-byte header.
#[derive(Debug, Default)]
pub struct MrcParser;

impl MrcParser {
    pub fn new() -> Self {
        Self
    }
}

impl HeaderParser for MrcParser {
    fn resume(&mut self, held: &WindowCache) -> Result<Step, HeaderError> {
        let Some(block) = held.get(0, HEADER_SIZE) else {
            return Ok(Step::need(0, HEADER_SIZE));
        };

        let fields = match block[MACHINE_STAMP] {
            0x11 => parse_block::<BigEndian>(block)?,
            0x44 => parse_block::<LittleEndian>(block)?,
            other => {
                warn!(stamp = other, "unknown MRC machine stamp, assuming little-endian");
                parse_block::<LittleEndian>(block)?
            }
        };
        Ok(Step::Done(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::format::run_resident;
    use crate::io::ByteSpan;

    fn header(dims: [i32; 3], mode: i32, sampling: [i32; 3], cell: [f32; 3]) -> Vec<u8> {
        let mut block = vec![0u8; HEADER_SIZE as usize];
        for (i, v) in dims.iter().enumerate() {
            LittleEndian::write_i32(&mut block[i * 4..], *v);
        }
        LittleEndian::write_i32(&mut block[12..], mode);
        for (i, v) in sampling.iter().enumerate() {
            LittleEndian::write_i32(&mut block[28 + i * 4..], *v);
        }
        for (i, v) in cell.iter().enumerate() {
            LittleEndian::write_f32(&mut block[40 + i * 4..], *v);
        }
        block[208..212].copy_from_slice(b"MAP ");
        block[212] = 0x44;
        block[213] = 0x44;
        block
    }

    #[test]
    fn test_uint16_volume() {
        let file = header([256, 256, 10], 6, [256, 256, 10], [2560.0, 2560.0, 100.0]);
        let (fields, fetched) = run_resident(&mut MrcParser::new(), &file);
        let fields = fields.unwrap();

        assert_eq!(fields.width, Some(256));
        assert_eq!(fields.depth, Some(10));
        assert_eq!(fields.sample_type, Some(SampleType::Unsigned(16)));
        assert!((fields.voxel_x.unwrap().metres() - 1e-9).abs() < 1e-18);
        assert!((fields.voxel_z.unwrap().metres() - 1e-9).abs() < 1e-18);
        assert_eq!(fetched, vec![ByteSpan::new(0, 1024)]);
    }

    #[test]
    fn test_single_section_has_no_depth() {
        let file = header([10, 20, 1], 2, [10, 20, 1], [100.0, 200.0, 10.0]);
        let fields = run_resident(&mut MrcParser::new(), &file).0.unwrap();
        assert_eq!(fields.depth, None);
        assert_eq!(fields.sample_type, Some(SampleType::Float(32)));
    }

    #[test]
    fn test_zero_cell_leaves_spacing_absent() {
        let file = header([8, 8, 8], 0, [0, 0, 0], [0.0, 0.0, 0.0]);
        let fields = run_resident(&mut MrcParser::new(), &file).0.unwrap();
        assert_eq!(fields.voxel_x, None);
        assert_eq!(fields.sample_type, Some(SampleType::Signed(8)));
    }

    #[test]
    fn test_big_endian_stamp() {
        let mut file = vec![0u8; HEADER_SIZE as usize];
        BigEndian::write_i32(&mut file[0..], 4);
        BigEndian::write_i32(&mut file[4..], 3);
        BigEndian::write_i32(&mut file[8..], 2);
        BigEndian::write_i32(&mut file[12..], 1);
        file[208..212].copy_from_slice(b"MAP ");
        file[212] = 0x11;
        file[213] = 0x11;

        let fields = run_resident(&mut MrcParser::new(), &file).0.unwrap();
        assert_eq!((fields.width, fields.height, fields.depth), (Some(4), Some(3), Some(2)));
        assert_eq!(fields.sample_type, Some(SampleType::Signed(16)));
    }

    #[test]
    fn test_unknown_mode_is_invalid() {
        let file = header([8, 8, 8], 99, [8, 8, 8], [1.0, 1.0, 1.0]);
        let err = run_resident(&mut MrcParser::new(), &file).0.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidHeader);
    }

    #[test]
    fn test_short_file_is_truncated() {
        let file = header([8, 8, 8], 2, [8, 8, 8], [1.0, 1.0, 1.0]);
        let (result, _) = run_resident(&mut MrcParser::new(), &file[..500]);
        assert_eq!(result.unwrap_err().kind, ErrorKind::TruncatedHeader);
    }
}
