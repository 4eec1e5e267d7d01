//! # fastheader
//!
//! Minimal-byte image header extraction from local files and HTTP URLs.
//!
//! This library recovers structural metadata (dimensions, sample type, physical
//! pixel or voxel size) from image headers while reading as few bytes as it can.
//! Local files are memory mapped. Remote files are read with HTTP Range requests,
//! one small window at a time, so a header at the start of a multi-gigabyte
//! volume costs a few kilobytes of transfer.
//!
//! ## Features
//!
//! - JPEG, PNG, TIFF (classic and BigTIFF) and MRC headers
//! - HTTP Range windows, with a whole-body fallback for small files on servers
//!   without range support
//! - Cycle-safe, hop-bounded walking of TIFF directory chains
//! - Identical parsing in a blocking and an async shell
//! - Per-extraction deadline and cooperative cancellation
//!
//! ## Example
//!
//! ```no_run
//! use fastheader::{AsyncExtractor, ExtractOptions, Origin};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let extractor = AsyncExtractor::new(ExtractOptions::default())?;
//!
//!     let origin = Origin::parse("https://example.com/volume.mrc");
//!     let result = extractor.extract(&origin).await;
//!     if let Some(data) = &result.data {
//!         println!("{}x{} {:?}", data.width, data.height, data.dtype);
//!     }
//!     println!("fetched {} bytes", result.bytes_fetched);
//!
//!     Ok(())
//! }
//! ```

pub mod assemble;
pub mod cli;
pub mod error;
pub mod extractor;
pub mod format;
pub mod io;
pub mod model;
pub mod session;

pub use cli::Cli;
pub use error::{ErrorKind, HeaderError};
pub use extractor::{AsyncExtractor, Extractor, parse_bytes};
pub use io::{AsyncHttpTransport, HttpTransport, Probe, RangeReply, Strategy};
pub use model::{
    DEFAULT_MAX_DIRECTORY_HOPS, ExtractOptions, Format, HeaderData, HeaderResult, Origin,
};
