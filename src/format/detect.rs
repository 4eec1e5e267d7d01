use tracing::trace;

use super::mrc;
use crate::io::{ByteSpan, WindowCache};
use crate::model::Format;

/// Length of the first window fetched from every origin.
///
/// Long enough for the PNG signature and the whole BigTIFF header.
pub const SIGNATURE_WINDOW: u64 = 16;

struct Signature {
    format: Format,
    offset: u64,
    magic: &'static [u8],
    /// How far to extend the prefix when this signature lies past it. The
    /// whole header block, so the parser finds it resident.
    extend_to: u64,
}

/// Known signatures in priority order: whole-format magics first, the JPEG
/// marker prefix last.
const SIGNATURES: &[Signature] = &[
    Signature {
        format: Format::Png,
        offset: 0,
        magic: b"\x89PNG\r\n\x1a\n",
        extend_to: 0,
    },
    Signature {
        format: Format::Tiff,
        offset: 0,
        magic: b"II*\x00",
        extend_to: 0,
    },
    Signature {
        format: Format::Tiff,
        offset: 0,
        magic: b"MM\x00*",
        extend_to: 0,
    },
    Signature {
        format: Format::Tiff,
        offset: 0,
        magic: b"II+\x00",
        extend_to: 0,
    },
    Signature {
        format: Format::Tiff,
        offset: 0,
        magic: b"MM\x00+",
        extend_to: 0,
    },
    Signature {
        format: Format::Mrc,
        offset: 208,
        magic: b"MAP ",
        extend_to: mrc::HEADER_SIZE,
    },
    Signature {
        format: Format::Jpeg,
        offset: 0,
        magic: b"\xFF\xD8\xFF",
        extend_to: 0,
    },
];

/// Outcome of matching the resident prefix against known signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    Found(Format),
    /// No resident signature matched, but one lies past the resident prefix.
    /// The prefix should be extended to cover this span, once.
    Extend(ByteSpan),
    Unsupported,
}

/// Match the resident bytes against every known signature.
///
/// Signatures whose bytes are resident are tried first, in priority order.
/// Only when none of them matches is the prefix extended toward a signature
/// at a larger offset, provided the origin is long enough to contain it.
pub fn detect(held: &WindowCache) -> Detection {
    let mut reach: Option<u64> = None;

    for sig in SIGNATURES {
        let len = sig.magic.len() as u64;
        match held.get(sig.offset, len) {
            Some(bytes) if bytes == sig.magic => {
                trace!(format = %sig.format, "signature matched");
                return Detection::Found(sig.format);
            }
            Some(_) => {}
            None if sig.offset + len <= held.size() => {
                let end = sig.extend_to.min(held.size()).max(sig.offset + len);
                reach = Some(reach.map_or(end, |r| r.max(end)));
            }
            None => {}
        }
    }

    match reach {
        Some(end) => Detection::Extend(ByteSpan::between(0, end)),
        None => Detection::Unsupported,
    }
}
