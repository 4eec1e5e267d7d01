use serde::Serialize;

use crate::error::{ErrorKind, HeaderError};

/// Largest remote body fetched whole when the origin cannot serve ranges (10 MiB).
pub const BULK_FETCH_THRESHOLD: u64 = 10 * 1024 * 1024;

/// I/O mode chosen once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Local file, addressed directly through a memory map.
    Mapped,
    /// Remote origin, one HTTP range request per missing window.
    Ranged,
    /// Remote origin without range support, fetched whole once.
    Bulk,
}

/// What the metadata probe (HEAD) learned about a remote origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub size: Option<u64>,
    pub accepts_ranges: bool,
}

/// Pick the strategy for a remote origin from its probe.
///
/// Ranged when the origin advertises byte ranges; bulk when it does not but is
/// strictly smaller than `bulk_threshold`; `no-range-large` otherwise.
pub fn choose_strategy(probe: &Probe, bulk_threshold: u64) -> Result<Strategy, HeaderError> {
    match (probe.accepts_ranges, probe.size) {
        (true, Some(_)) => Ok(Strategy::Ranged),
        (true, None) => Err(HeaderError::network(
            "remote server did not return Content-Length",
        )),
        (false, Some(size)) if size < bulk_threshold => Ok(Strategy::Bulk),
        (false, Some(size)) => Err(HeaderError::new(
            ErrorKind::NoRangeLarge,
            format!(
                "remote server does not support Range requests and file is {size} bytes"
            ),
        )),
        (false, None) => Err(HeaderError::new(
            ErrorKind::NoRangeLarge,
            "remote server does not support Range requests and did not report a size",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(size: Option<u64>, accepts_ranges: bool) -> Probe {
        Probe {
            size,
            accepts_ranges,
        }
    }

    #[test]
    fn test_ranges_win_regardless_of_size() {
        let strategy = choose_strategy(&probe(Some(u64::MAX), true), BULK_FETCH_THRESHOLD);
        assert_eq!(strategy, Ok(Strategy::Ranged));
    }

    #[test]
    fn test_threshold_edges() {
        let below = choose_strategy(&probe(Some(BULK_FETCH_THRESHOLD - 1), false), BULK_FETCH_THRESHOLD);
        assert_eq!(below, Ok(Strategy::Bulk));

        let at = choose_strategy(&probe(Some(BULK_FETCH_THRESHOLD), false), BULK_FETCH_THRESHOLD);
        assert_eq!(at.unwrap_err().kind, ErrorKind::NoRangeLarge);

        let above = choose_strategy(&probe(Some(BULK_FETCH_THRESHOLD + 1), false), BULK_FETCH_THRESHOLD);
        assert_eq!(above.unwrap_err().kind, ErrorKind::NoRangeLarge);
    }

    #[test]
    fn test_unknown_size_without_ranges_is_refused() {
        let err = choose_strategy(&probe(None, false), BULK_FETCH_THRESHOLD).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoRangeLarge);
    }

    #[test]
    fn test_ranges_without_length_is_network_error() {
        let err = choose_strategy(&probe(None, true), BULK_FETCH_THRESHOLD).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkError);
    }
}
