//! Execution shells.
//!
//! [`Extractor`] blocks the calling thread on every fetch; [`AsyncExtractor`]
//! suspends instead. Both negotiate a strategy, then drive the same
//! [`Session`](crate::session::Session) until it finishes. Cancellation and
//! the per-extraction deadline are checked around every fetch.

mod asynchronous;
mod blocking;

pub use asynchronous::AsyncExtractor;
pub use blocking::Extractor;

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, HeaderError};
use crate::io::{FullBody, MemorySource, Strategy};
use crate::model::{ExtractOptions, HeaderResult};
use crate::session::Session;

/// Fail fast if the caller gave up or the deadline passed.
fn check(cancel: &CancellationToken, deadline: Option<Instant>) -> Result<(), HeaderError> {
    if cancel.is_cancelled() {
        return Err(HeaderError::cancelled());
    }
    remaining(deadline).map(|_| ())
}

/// Time left before `deadline`, `None` when there is no deadline.
fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>, HeaderError> {
    match deadline {
        Some(deadline) => deadline
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
            .map(Some)
            .ok_or_else(HeaderError::timeout),
        None => Ok(None),
    }
}

/// Accept a bulk-fetched body only when it stayed below `threshold`.
fn bulk_body(body: FullBody, threshold: u64) -> Result<Vec<u8>, HeaderError> {
    match body {
        FullBody::Complete(body) if (body.len() as u64) < threshold => Ok(body),
        body => Err(HeaderError::new(
            ErrorKind::NoRangeLarge,
            format!(
                "bulk body reached the {threshold} byte threshold after {} bytes",
                body.transferred()
            ),
        )),
    }
}

/// Run a session over bytes that are already fully resident.
///
/// Nothing is fetched, so `bytes_fetched` and `requests_made` are zero. The
/// parse itself is identical to the one a mapped or remote origin gets.
pub fn parse_bytes(source: &str, bytes: Vec<u8>, options: &ExtractOptions) -> HeaderResult {
    let mut session = Session::new(source, options);
    let mut body = MemorySource::new(bytes);
    session.negotiated(Strategy::Bulk, body.len());
    blocking::drive(&mut session, &mut body, &options.cancel, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_order() {
        let cancel = CancellationToken::new();
        assert!(check(&cancel, None).is_ok());

        let past = Instant::now() - Duration::from_millis(1);
        assert_eq!(check(&cancel, Some(past)).unwrap_err().kind, ErrorKind::Timeout);

        cancel.cancel();
        assert_eq!(check(&cancel, Some(past)).unwrap_err().kind, ErrorKind::Cancelled);
    }

    #[test]
    fn test_bulk_body_threshold() {
        assert_eq!(bulk_body(FullBody::Complete(vec![1; 9]), 10).unwrap().len(), 9);

        let at = bulk_body(FullBody::Complete(vec![1; 10]), 10).unwrap_err();
        assert_eq!(at.kind, ErrorKind::NoRangeLarge);

        let cut = bulk_body(FullBody::Oversized(10), 10).unwrap_err();
        assert_eq!(cut.kind, ErrorKind::NoRangeLarge);
    }

    #[test]
    fn test_parse_bytes_counts_nothing() {
        let mut png = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR".to_vec();
        png.extend_from_slice(&7u32.to_be_bytes());
        png.extend_from_slice(&9u32.to_be_bytes());
        png.extend_from_slice(&[8, 0, 0, 0, 0]);
        let crc = crc32fast::hash(&png[12..29]);
        png.extend_from_slice(&crc.to_be_bytes());

        let result = parse_bytes("mem.png", png, &ExtractOptions::default());
        assert!(result.success, "{result:?}");
        assert_eq!(result.bytes_fetched, 0);
        assert_eq!(result.requests_made, 0);
        let data = result.data.unwrap();
        assert_eq!((data.width, data.height), (7, 9));
    }

    #[test]
    fn test_parse_bytes_empty() {
        let result = parse_bytes("empty", Vec::new(), &ExtractOptions::default());
        assert_eq!(result.error, Some(ErrorKind::TruncatedHeader));
    }
}
