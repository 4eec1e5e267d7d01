//! Origins, parsed fields, results and options.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, HeaderError};
use crate::io::BULK_FETCH_THRESHOLD;

/// Default upper bound on directory-offset follows in a chained-directory file.
pub const DEFAULT_MAX_DIRECTORY_HOPS: usize = 1024;

/// Where the bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Local(PathBuf),
    Remote(String),
}

impl Origin {
    /// Classify a command-line style source string.
    pub fn parse(source: &str) -> Self {
        if source.starts_with("http://") || source.starts_with("https://") {
            Origin::Remote(source.to_string())
        } else {
            Origin::Local(PathBuf::from(source))
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Local(path) => write!(f, "{}", path.display()),
            Origin::Remote(url) => f.write_str(url),
        }
    }
}

/// Supported image formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Format {
    Jpeg,
    Png,
    Tiff,
    Mrc,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Jpeg => "JPEG",
            Format::Png => "PNG",
            Format::Tiff => "TIFF",
            Format::Mrc => "MRC",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sample type as a parser found it; rendered to a canonical name on assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    Unsigned(u16),
    Signed(u16),
    Float(u16),
    Complex(u16),
}

impl SampleType {
    /// Canonical sample-type name (`uint16`, `float32`, `complex64`, ...).
    pub fn canonical_name(&self) -> String {
        match self {
            SampleType::Unsigned(bits) => format!("uint{bits}"),
            SampleType::Signed(bits) => format!("int{bits}"),
            SampleType::Float(bits) => format!("float{bits}"),
            SampleType::Complex(bits) => format!("complex{bits}"),
        }
    }
}

/// Length units found in image headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthUnit {
    Angstrom,
    Nanometre,
    Micrometre,
    Millimetre,
    Centimetre,
    Inch,
    Metre,
}

impl LengthUnit {
    pub fn in_metres(&self) -> f64 {
        match self {
            LengthUnit::Angstrom => 1e-10,
            LengthUnit::Nanometre => 1e-9,
            LengthUnit::Micrometre => 1e-6,
            LengthUnit::Millimetre => 1e-3,
            LengthUnit::Centimetre => 1e-2,
            LengthUnit::Inch => 0.0254,
            LengthUnit::Metre => 1.0,
        }
    }
}

/// A physical length in its native unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Length {
    pub value: f64,
    pub unit: LengthUnit,
}

impl Length {
    pub fn new(value: f64, unit: LengthUnit) -> Self {
        Self { value, unit }
    }

    pub fn metres(&self) -> f64 {
        self.value * self.unit.in_metres()
    }
}

/// Fields a parser recovered, filled in incrementally.
///
/// Presence is what matters: the assembler rejects a set without width,
/// height or format.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSet {
    pub format: Option<Format>,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub depth: Option<u64>,
    pub sample_type: Option<SampleType>,
    pub voxel_x: Option<Length>,
    pub voxel_y: Option<Length>,
    pub voxel_z: Option<Length>,
    pub directory_count: Option<u64>,
}

impl FieldSet {
    pub fn for_format(format: Format) -> Self {
        Self {
            format: Some(format),
            ..Self::default()
        }
    }
}

/// Normalized header metadata of a successful extraction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeaderData {
    pub format: Format,
    pub width: u64,
    pub height: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_voxel_physical_size_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_voxel_physical_size_y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_voxel_physical_size_z: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_count: Option<u64>,
}

/// Outcome of one extraction. Exactly one of `data` / `error` is present.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeaderResult {
    pub source: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<HeaderData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub bytes_fetched: u64,
    pub requests_made: u64,
}

impl HeaderResult {
    pub fn success(source: String, data: HeaderData, bytes_fetched: u64, requests_made: u64) -> Self {
        Self {
            source,
            success: true,
            data: Some(data),
            error: None,
            message: None,
            bytes_fetched,
            requests_made,
        }
    }

    pub fn failure(source: String, err: HeaderError, bytes_fetched: u64, requests_made: u64) -> Self {
        Self {
            source,
            success: false,
            data: None,
            error: Some(err.kind),
            message: Some(err.message),
            bytes_fetched,
            requests_made,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error
    }
}

/// Knobs for one extraction call.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Remote bodies strictly smaller than this are fetched whole when ranges are unavailable.
    pub bulk_threshold: u64,
    /// Maximum number of directory offsets followed in a chained-directory file.
    pub max_directory_hops: usize,
    /// Walk the whole directory chain and report its length.
    pub count_directories: bool,
    /// Deadline for the whole extraction, measured from its start.
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            bulk_threshold: BULK_FETCH_THRESHOLD,
            max_directory_hops: DEFAULT_MAX_DIRECTORY_HOPS,
            count_directories: false,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }
}
