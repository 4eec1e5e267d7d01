//! TIFF / BigTIFF image file directory reader.
//!
//! ## Parsing Strategy
//!
//! 1. Read the fixed header: byte-order marker, magic (42 classic, 43 BigTIFF)
//!    and the offset of the first directory.
//! 2. Read the first directory's entry count, then its whole entry table in
//!    one request sized from that count.
//! 3. For every entry the schema needs, decode the inline value or fetch just
//!    the out-of-line value span.
//! 4. Optionally walk the rest of the directory chain, reading only each
//!    directory's entry count and next pointer, to count pages.
//!
//! Every directory offset passes through a [`DirectoryWalk`] before it is
//! followed. The walk keeps the set of visited offsets and a hop counter, so a
//! cyclic or endless chain stops with `invalid-offset` after a bounded number
//! of fetches.

use std::collections::HashSet;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tracing::{debug, warn};

use super::{HeaderParser, Step};
use crate::error::HeaderError;
use crate::io::{ByteSpan, WindowCache};
use crate::model::{FieldSet, Format, Length, LengthUnit, SampleType};

const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_IMAGE_DESCRIPTION: u16 = 270;
const TAG_X_RESOLUTION: u16 = 282;
const TAG_Y_RESOLUTION: u16 = 283;
const TAG_RESOLUTION_UNIT: u16 = 296;
const TAG_SAMPLE_FORMAT: u16 = 339;
const TAG_IMAGE_DEPTH: u16 = 32997;

const WANTED_TAGS: &[u16] = &[
    TAG_IMAGE_WIDTH,
    TAG_IMAGE_LENGTH,
    TAG_BITS_PER_SAMPLE,
    TAG_IMAGE_DESCRIPTION,
    TAG_X_RESOLUTION,
    TAG_Y_RESOLUTION,
    TAG_RESOLUTION_UNIT,
    TAG_SAMPLE_FORMAT,
    TAG_IMAGE_DEPTH,
];

/// Largest entry table read for the first directory.
const MAX_DIRECTORY_BYTES: u64 = 64 * 1024;
/// Largest ImageDescription fetched; longer ones are ignored.
const MAX_DESCRIPTION_BYTES: u64 = 4096;
/// Largest out-of-line numeric value fetched.
const MAX_VALUE_BYTES: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

impl Endian {
    fn u16(self, b: &[u8]) -> u16 {
        match self {
            Endian::Little => LittleEndian::read_u16(b),
            Endian::Big => BigEndian::read_u16(b),
        }
    }

    fn u32(self, b: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(b),
            Endian::Big => BigEndian::read_u32(b),
        }
    }

    fn u64(self, b: &[u8]) -> u64 {
        match self {
            Endian::Little => LittleEndian::read_u64(b),
            Endian::Big => BigEndian::read_u64(b),
        }
    }
}

/// Byte order and classic/BigTIFF field widths.
#[derive(Debug, Clone, Copy)]
struct Layout {
    endian: Endian,
    big: bool,
}

impl Layout {
    fn header_len(&self) -> u64 {
        if self.big { 16 } else { 8 }
    }

    fn count_len(&self) -> u64 {
        if self.big { 8 } else { 2 }
    }

    fn entry_len(&self) -> u64 {
        if self.big { 20 } else { 12 }
    }

    fn offset_len(&self) -> u64 {
        if self.big { 8 } else { 4 }
    }

    fn read_count(&self, b: &[u8]) -> u64 {
        if self.big {
            self.endian.u64(b)
        } else {
            self.endian.u16(b) as u64
        }
    }

    fn read_offset(&self, b: &[u8]) -> u64 {
        if self.big {
            self.endian.u64(b)
        } else {
            self.endian.u32(b) as u64
        }
    }
}

/// TIFF field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Byte,
    Ascii,
    Short,
    Long,
    Rational,
    SByte,
    Undefined,
    SShort,
    SLong,
    SRational,
    Float,
    Double,
    Ifd,
    Long8,
    SLong8,
    Ifd8,
    Unknown(u16),
}

impl FieldType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => FieldType::Byte,
            2 => FieldType::Ascii,
            3 => FieldType::Short,
            4 => FieldType::Long,
            5 => FieldType::Rational,
            6 => FieldType::SByte,
            7 => FieldType::Undefined,
            8 => FieldType::SShort,
            9 => FieldType::SLong,
            10 => FieldType::SRational,
            11 => FieldType::Float,
            12 => FieldType::Double,
            13 => FieldType::Ifd,
            16 => FieldType::Long8,
            17 => FieldType::SLong8,
            18 => FieldType::Ifd8,
            other => FieldType::Unknown(other),
        }
    }

    /// Size of one value in bytes, `None` for unknown types.
    pub fn size(&self) -> Option<u64> {
        match self {
            FieldType::Byte | FieldType::Ascii | FieldType::SByte | FieldType::Undefined => Some(1),
            FieldType::Short | FieldType::SShort => Some(2),
            FieldType::Long | FieldType::SLong | FieldType::Float | FieldType::Ifd => Some(4),
            FieldType::Rational
            | FieldType::SRational
            | FieldType::Double
            | FieldType::Long8
            | FieldType::SLong8
            | FieldType::Ifd8 => Some(8),
            FieldType::Unknown(_) => None,
        }
    }
}

/// One directory entry: inline value or offset to it.
#[derive(Debug, Clone, Copy)]
pub struct DirectoryEntry {
    pub tag: u16,
    pub field_type: FieldType,
    pub count: u64,
    /// The value field read as an offset in file byte order.
    pub value_or_offset: u64,
    /// The raw value field, for values that fit inline.
    inline: [u8; 8],
}

impl DirectoryEntry {
    fn parse(layout: &Layout, raw: &[u8]) -> Self {
        let e = layout.endian;
        let (count, value_at) = if layout.big {
            (e.u64(&raw[4..12]), 12)
        } else {
            (e.u32(&raw[4..8]) as u64, 8)
        };
        let width = layout.offset_len() as usize;
        let mut inline = [0u8; 8];
        inline[..width].copy_from_slice(&raw[value_at..value_at + width]);

        Self {
            tag: e.u16(&raw[0..2]),
            field_type: FieldType::from_u16(e.u16(&raw[2..4])),
            count,
            value_or_offset: layout.read_offset(&raw[value_at..value_at + width]),
            inline,
        }
    }

    /// Total byte length of the value, `None` for unknown types or overflow.
    fn byte_len(&self) -> Option<u64> {
        self.field_type.size()?.checked_mul(self.count)
    }
}

/// Visited directory offsets plus a hop budget.
#[derive(Debug)]
struct DirectoryWalk {
    visited: HashSet<u64>,
    hops: usize,
    max_hops: usize,
}

impl DirectoryWalk {
    fn new(max_hops: usize) -> Self {
        Self {
            visited: HashSet::new(),
            hops: 0,
            max_hops,
        }
    }

    /// Admit `offset` as the next directory to read.
    fn enter(&mut self, offset: u64, layout: &Layout, size: u64) -> Result<(), HeaderError> {
        if offset < layout.header_len() || offset >= size {
            return Err(HeaderError::invalid_offset(format!(
                "directory offset {offset} outside file of {size} bytes"
            )));
        }
        self.check_cycle(offset)?;
        if self.hops >= self.max_hops {
            return Err(HeaderError::invalid_offset(format!(
                "directory chain exceeds {} hops",
                self.max_hops
            )));
        }
        self.visited.insert(offset);
        self.hops += 1;
        Ok(())
    }

    fn check_cycle(&self, offset: u64) -> Result<(), HeaderError> {
        if self.visited.contains(&offset) {
            return Err(HeaderError::invalid_offset(format!(
                "directory at offset {offset} revisited"
            )));
        }
        Ok(())
    }
}

/// Key/value pairs ImageJ writes into ImageDescription.
#[derive(Debug, Default, PartialEq)]
struct ImageJMeta {
    slices: Option<u64>,
    spacing: Option<f64>,
    unit: Option<LengthUnit>,
}

fn imagej_unit(name: &str) -> Option<LengthUnit> {
    match name {
        "micron" | "um" | "µm" | "\\u00B5m" | "microns" => Some(LengthUnit::Micrometre),
        "nm" | "nanometer" => Some(LengthUnit::Nanometre),
        "mm" | "millimeter" => Some(LengthUnit::Millimetre),
        "cm" | "centimeter" => Some(LengthUnit::Centimetre),
        "m" | "meter" => Some(LengthUnit::Metre),
        "inch" | "in" => Some(LengthUnit::Inch),
        "A" | "angstrom" => Some(LengthUnit::Angstrom),
        _ => None,
    }
}

fn parse_imagej(description: &str) -> Option<ImageJMeta> {
    if !description.starts_with("ImageJ=") {
        return None;
    }
    let mut meta = ImageJMeta::default();
    for line in description.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "slices" => meta.slices = value.parse().ok(),
            "spacing" => meta.spacing = value.parse().ok(),
            "unit" => meta.unit = imagej_unit(value),
            _ => {}
        }
    }
    Some(meta)
}

/// Raw values of the tags the schema uses.
#[derive(Debug, Default)]
struct TagValues {
    width: Option<u64>,
    height: Option<u64>,
    bits_per_sample: Option<u64>,
    sample_format: Option<u64>,
    description: Option<String>,
    x_resolution: Option<f64>,
    y_resolution: Option<f64>,
    resolution_unit: Option<u64>,
    image_depth: Option<u64>,
}

fn first_uint(field_type: FieldType, bytes: &[u8], e: Endian) -> Option<u64> {
    match field_type {
        FieldType::Byte => Some(bytes[0] as u64),
        FieldType::Short => Some(e.u16(bytes) as u64),
        FieldType::Long | FieldType::Ifd => Some(e.u32(bytes) as u64),
        FieldType::Long8 | FieldType::Ifd8 => Some(e.u64(bytes)),
        _ => None,
    }
}

/// Pixels per resolution unit.
fn resolution(field_type: FieldType, bytes: &[u8], e: Endian) -> Option<f64> {
    match field_type {
        FieldType::Rational => {
            let num = e.u32(&bytes[0..4]);
            let den = e.u32(&bytes[4..8]);
            (den != 0).then(|| num as f64 / den as f64)
        }
        _ => first_uint(field_type, bytes, e).map(|v| v as f64),
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    Header,
    Count { offset: u64 },
    Table { offset: u64, count: u64 },
    Values,
    ChainCount { offset: u64 },
    ChainNext { offset: u64, count: u64 },
}

/// Resumable TIFF/BigTIFF reader.
#[derive(Debug)]
pub struct TiffParser {
    state: State,
    layout: Option<Layout>,
    walk: DirectoryWalk,
    count_directories: bool,
    pending: Vec<DirectoryEntry>,
    cursor: usize,
    next_directory: u64,
    directory_count: u64,
    tags: TagValues,
}

impl TiffParser {
    pub fn new(max_hops: usize, count_directories: bool) -> Self {
        Self {
            state: State::Header,
            layout: None,
            walk: DirectoryWalk::new(max_hops),
            count_directories,
            pending: Vec::new(),
            cursor: 0,
            next_directory: 0,
            directory_count: 0,
            tags: TagValues::default(),
        }
    }

    fn layout(&self) -> Result<Layout, HeaderError> {
        self.layout
            .ok_or_else(|| HeaderError::invalid_header("TIFF header not parsed"))
    }

    fn read_header(&mut self, held: &WindowCache) -> Result<Option<Step>, HeaderError> {
        let Some(head) = held.get(0, 8) else {
            return Ok(Some(Step::need(0, 8)));
        };
        let endian = match &head[..2] {
            b"II" => Endian::Little,
            b"MM" => Endian::Big,
            _ => return Err(HeaderError::invalid_header("invalid TIFF byte order marker")),
        };
        let big = match endian.u16(&head[2..4]) {
            42 => false,
            43 => true,
            magic => {
                return Err(HeaderError::invalid_header(format!(
                    "invalid TIFF magic number {magic}"
                )));
            }
        };

        let first = if big {
            let Some(head) = held.get(0, 16) else {
                return Ok(Some(Step::need(0, 16)));
            };
            if endian.u16(&head[4..6]) != 8 || endian.u16(&head[6..8]) != 0 {
                return Err(HeaderError::invalid_header(
                    "BigTIFF offset size must be 8",
                ));
            }
            endian.u64(&head[8..16])
        } else {
            endian.u32(&head[4..8]) as u64
        };

        let layout = Layout { endian, big };
        debug!(?endian, big, first, "TIFF header");
        self.walk.enter(first, &layout, held.size())?;
        self.layout = Some(layout);
        self.state = State::Count { offset: first };
        Ok(None)
    }

    fn read_table(
        &mut self,
        held: &WindowCache,
        offset: u64,
        count: u64,
    ) -> Result<Option<Step>, HeaderError> {
        let layout = self.layout()?;
        let start = offset + layout.count_len();
        let len = count * layout.entry_len() + layout.offset_len();
        let Some(table) = held.get(start, len) else {
            return Ok(Some(Step::need(start, len)));
        };

        let entry_len = layout.entry_len() as usize;
        for raw in table[..count as usize * entry_len].chunks_exact(entry_len) {
            let entry = DirectoryEntry::parse(&layout, raw);
            if WANTED_TAGS.contains(&entry.tag) {
                self.pending.push(entry);
            }
        }

        let next = layout.read_offset(&table[count as usize * entry_len..]);
        if next != 0 {
            self.walk.check_cycle(next)?;
        }
        self.next_directory = next;
        self.directory_count = 1;
        self.state = State::Values;
        Ok(None)
    }

    /// Decode one entry, or name the out-of-line span it still needs.
    fn resolve(
        &mut self,
        entry: DirectoryEntry,
        held: &WindowCache,
    ) -> Result<Option<ByteSpan>, HeaderError> {
        let layout = self.layout()?;
        let Some(len) = entry.byte_len().filter(|&len| len > 0) else {
            return Ok(None);
        };

        let bytes = if len <= layout.offset_len() {
            &entry.inline[..len as usize]
        } else {
            let cap = if entry.tag == TAG_IMAGE_DESCRIPTION {
                MAX_DESCRIPTION_BYTES
            } else {
                MAX_VALUE_BYTES
            };
            if len > cap {
                warn!(tag = entry.tag, len, "skipping oversized TIFF value");
                return Ok(None);
            }
            let offset = entry.value_or_offset;
            if offset.checked_add(len).is_none_or(|end| end > held.size()) {
                return Err(HeaderError::invalid_offset(format!(
                    "value of tag {} at offset {offset} (+{len}) outside file",
                    entry.tag
                )));
            }
            match held.get(offset, len) {
                Some(bytes) => bytes,
                None => return Ok(Some(ByteSpan::new(offset, len))),
            }
        };

        let e = layout.endian;
        let ty = entry.field_type;
        match entry.tag {
            TAG_IMAGE_WIDTH => self.tags.width = first_uint(ty, bytes, e),
            TAG_IMAGE_LENGTH => self.tags.height = first_uint(ty, bytes, e),
            TAG_BITS_PER_SAMPLE => self.tags.bits_per_sample = first_uint(ty, bytes, e),
            TAG_SAMPLE_FORMAT => self.tags.sample_format = first_uint(ty, bytes, e),
            TAG_RESOLUTION_UNIT => self.tags.resolution_unit = first_uint(ty, bytes, e),
            TAG_IMAGE_DEPTH => self.tags.image_depth = first_uint(ty, bytes, e),
            TAG_X_RESOLUTION => self.tags.x_resolution = resolution(ty, bytes, e),
            TAG_Y_RESOLUTION => self.tags.y_resolution = resolution(ty, bytes, e),
            TAG_IMAGE_DESCRIPTION if ty == FieldType::Ascii => {
                let text = String::from_utf8_lossy(bytes);
                self.tags.description = Some(text.trim_end_matches('\0').to_string());
            }
            _ => {}
        }
        Ok(None)
    }

    fn finish(&self) -> FieldSet {
        let tags = &self.tags;
        let mut fields = FieldSet::for_format(Format::Tiff);
        fields.width = tags.width;
        fields.height = tags.height;

        fields.sample_type = match (tags.sample_format.unwrap_or(1), tags.bits_per_sample) {
            (1, Some(bits @ (8 | 16 | 32 | 64))) => Some(SampleType::Unsigned(bits as u16)),
            (2, Some(bits @ (8 | 16 | 32 | 64))) => Some(SampleType::Signed(bits as u16)),
            (3, Some(bits @ (16 | 32 | 64))) => Some(SampleType::Float(bits as u16)),
            _ => None,
        };

        let imagej = tags.description.as_deref().and_then(parse_imagej);
        let imagej_unit = imagej.as_ref().and_then(|m| m.unit);

        fields.depth = tags
            .image_depth
            .filter(|&d| d > 1)
            .or_else(|| imagej.as_ref().and_then(|m| m.slices).filter(|&s| s > 1));

        let unit = match (tags.resolution_unit, imagej_unit) {
            (Some(2), _) => Some(LengthUnit::Inch),
            (Some(3), _) => Some(LengthUnit::Centimetre),
            (Some(1), unit) => unit,
            (None, Some(unit)) => Some(unit),
            (None, None) => Some(LengthUnit::Inch),
            (Some(_), _) => None,
        };
        let pixel = |ppu: Option<f64>| {
            let ppu = ppu.filter(|v| v.is_finite() && *v > 0.0)?;
            Some(Length::new(1.0 / ppu, unit?))
        };
        fields.voxel_x = pixel(tags.x_resolution);
        fields.voxel_y = pixel(tags.y_resolution);
        fields.voxel_z = imagej.as_ref().and_then(|m| {
            let spacing = m.spacing.filter(|v| v.is_finite() && *v > 0.0)?;
            Some(Length::new(spacing, m.unit?))
        });

        if self.count_directories {
            fields.directory_count = Some(self.directory_count);
        }
        fields
    }
}

impl HeaderParser for TiffParser {
    fn resume(&mut self, held: &WindowCache) -> Result<Step, HeaderError> {
        loop {
            match self.state {
                State::Header => {
                    if let Some(step) = self.read_header(held)? {
                        return Ok(step);
                    }
                }
                State::Count { offset } => {
                    let layout = self.layout()?;
                    let Some(b) = held.get(offset, layout.count_len()) else {
                        return Ok(Step::need(offset, layout.count_len()));
                    };
                    let count = layout.read_count(b);
                    if count == 0 {
                        return Err(HeaderError::invalid_header("first directory has no entries"));
                    }
                    let table = count
                        .checked_mul(layout.entry_len())
                        .and_then(|t| t.checked_add(layout.offset_len()))
                        .filter(|&t| t <= MAX_DIRECTORY_BYTES);
                    if table.is_none() {
                        return Err(HeaderError::invalid_header(format!(
                            "directory of {count} entries exceeds {MAX_DIRECTORY_BYTES} bytes"
                        )));
                    }
                    self.state = State::Table { offset, count };
                }
                State::Table { offset, count } => {
                    if let Some(step) = self.read_table(held, offset, count)? {
                        return Ok(step);
                    }
                }
                State::Values => {
                    while let Some(&entry) = self.pending.get(self.cursor) {
                        if let Some(span) = self.resolve(entry, held)? {
                            return Ok(Step::Need(span));
                        }
                        self.cursor += 1;
                    }
                    if !self.count_directories || self.next_directory == 0 {
                        return Ok(Step::Done(self.finish()));
                    }
                    let layout = self.layout()?;
                    self.walk.enter(self.next_directory, &layout, held.size())?;
                    self.state = State::ChainCount {
                        offset: self.next_directory,
                    };
                }
                State::ChainCount { offset } => {
                    let layout = self.layout()?;
                    let Some(b) = held.get(offset, layout.count_len()) else {
                        return Ok(Step::need(offset, layout.count_len()));
                    };
                    let count = layout.read_count(b);
                    self.state = State::ChainNext { offset, count };
                }
                State::ChainNext { offset, count } => {
                    let layout = self.layout()?;
                    let at = count
                        .checked_mul(layout.entry_len())
                        .and_then(|t| t.checked_add(offset + layout.count_len()))
                        .ok_or_else(|| {
                            HeaderError::invalid_offset(format!(
                                "directory at offset {offset} claims {count} entries"
                            ))
                        })?;
                    let Some(b) = held.get(at, layout.offset_len()) else {
                        return Ok(Step::need(at, layout.offset_len()));
                    };
                    let next = layout.read_offset(b);
                    self.directory_count += 1;
                    if next == 0 {
                        return Ok(Step::Done(self.finish()));
                    }
                    self.walk.enter(next, &layout, held.size())?;
                    self.state = State::ChainCount { offset: next };
                }
            }
        }
    }
}
