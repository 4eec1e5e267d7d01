use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// The closed set of ways an extraction can fail.
///
/// Every failure inside a session is mapped to exactly one kind before it
/// reaches the caller. Kinds render in kebab-case (`truncated-header`), which
/// is also how they appear in serialized results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// No known signature matched the first window.
    UnsupportedFormat,
    /// Requested bytes lie beyond the origin, or a structure is shorter than declared.
    TruncatedHeader,
    /// Cyclic or out-of-bounds directory reference, or hop bound exceeded.
    InvalidOffset,
    /// Structure present but a mandatory field is missing or malformed.
    InvalidHeader,
    /// Remote origin has no range support and is too large to fetch whole.
    NoRangeLarge,
    NetworkError,
    Timeout,
    Cancelled,
    /// Local origin could not be opened or mapped.
    IoError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnsupportedFormat => "unsupported-format",
            ErrorKind::TruncatedHeader => "truncated-header",
            ErrorKind::InvalidOffset => "invalid-offset",
            ErrorKind::InvalidHeader => "invalid-header",
            ErrorKind::NoRangeLarge => "no-range-large",
            ErrorKind::NetworkError => "network-error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::IoError => "io-error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed failure carrying its [`ErrorKind`] and a human-readable detail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct HeaderError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HeaderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedFormat, message)
    }

    pub fn truncated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TruncatedHeader, message)
    }

    pub fn invalid_offset(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidOffset, message)
    }

    pub fn invalid_header(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidHeader, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkError, message)
    }

    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout, "deadline elapsed before the fetch completed")
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "extraction cancelled by caller")
    }
}

impl From<reqwest::Error> for HeaderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::new(ErrorKind::Timeout, err.to_string())
        } else {
            Self::network(err.to_string())
        }
    }
}

impl From<std::io::Error> for HeaderError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::IoError, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_renders_kebab_case() {
        assert_eq!(ErrorKind::NoRangeLarge.to_string(), "no-range-large");
        assert_eq!(
            serde_json::to_string(&ErrorKind::TruncatedHeader).unwrap(),
            "\"truncated-header\""
        );
    }

    #[test]
    fn test_error_display_includes_kind() {
        let err = HeaderError::invalid_offset("directory at 8 revisited");
        assert_eq!(err.to_string(), "invalid-offset: directory at 8 revisited");
    }
}
