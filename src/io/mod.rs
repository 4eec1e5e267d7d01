//! Window sources, the strategy negotiator and the per-session window cache.
//!
//! A window source answers one question: give me bytes `[offset, offset + len)`.
//! Local files answer from a memory map, remote origins with one HTTP range
//! request per call, and bulk-fetched bodies from memory.

mod cache;
mod http;
mod local;
mod memory;
mod strategy;

pub use cache::{ByteSpan, WindowCache};
pub use http::{
    AsyncHttpTransport, AsyncRemoteReader, AsyncReqwestTransport, FullBody, HttpTransport,
    RangeReply, RemoteReader, ReqwestTransport,
};
pub use local::MappedFile;
pub use memory::MemorySource;
pub use strategy::{BULK_FETCH_THRESHOLD, Probe, Strategy, choose_strategy};

use std::future::Future;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::HeaderError;

/// Bytes returned by one window-source call, with their accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    /// Bytes pulled from the origin by this call (may exceed `bytes.len()`
    /// when a server answered a range request with the whole body).
    pub transferred: u64,
    /// Whether this call was an exchange with the origin at all.
    pub exchanged: bool,
}

impl Fetched {
    /// Bytes read from the origin, counted at face value.
    pub fn counted(bytes: Vec<u8>) -> Self {
        let transferred = bytes.len() as u64;
        Self {
            bytes,
            transferred,
            exchanged: true,
        }
    }

    /// Bytes served from an already-resident body.
    pub fn resident(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            transferred: 0,
            exchanged: false,
        }
    }
}

/// A failed window-source call, with what the origin sent before it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    pub error: HeaderError,
    pub transferred: u64,
    pub exchanged: bool,
}

impl FetchError {
    /// Failure reported after a completed exchange with the origin.
    pub fn after_exchange(error: HeaderError, transferred: u64) -> Self {
        Self {
            error,
            transferred,
            exchanged: true,
        }
    }

    /// Bytes that arrived but are thrown away because of `error`.
    pub fn discarding(fetched: Fetched, error: HeaderError) -> Self {
        Self {
            error,
            transferred: fetched.transferred,
            exchanged: fetched.exchanged,
        }
    }
}

impl From<HeaderError> for FetchError {
    fn from(error: HeaderError) -> Self {
        Self {
            error,
            transferred: 0,
            exchanged: false,
        }
    }
}

/// Await `fut` unless `cancel` fires or `deadline` passes first.
///
/// Whatever `fut` was doing is dropped when either fires.
pub(crate) async fn guarded<T, E: From<HeaderError>>(
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, E> {
    if cancel.is_cancelled() {
        return Err(HeaderError::cancelled().into());
    }
    match deadline {
        Some(deadline) => tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HeaderError::cancelled().into()),
            out = tokio::time::timeout_at(deadline, fut) => match out {
                Ok(result) => result,
                Err(_) => Err(HeaderError::timeout().into()),
            },
        },
        None => tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HeaderError::cancelled().into()),
            result = fut => result,
        },
    }
}

/// Random access to an origin, for the suspending shell.
#[async_trait]
pub trait ReadAt: Send {
    /// Return exactly `span.len` bytes starting at `span.offset`.
    async fn read_at(&mut self, span: ByteSpan) -> Result<Fetched, FetchError>;

    /// Total size of the origin.
    fn size(&self) -> u64;
}

/// Random access to an origin, for the blocking shell.
pub trait BlockingReadAt: Send {
    /// Return exactly `span.len` bytes starting at `span.offset`.
    fn read_at(&mut self, span: ByteSpan) -> Result<Fetched, FetchError>;

    /// Total size of the origin.
    fn size(&self) -> u64;
}
