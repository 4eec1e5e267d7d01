use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, HeaderMap, RANGE};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BlockingReadAt, ByteSpan, FetchError, Fetched, Probe, ReadAt, guarded};
use crate::error::{ErrorKind, HeaderError};

/// Default per-request timeout of the bundled reqwest clients.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A whole body read with a size cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FullBody {
    Complete(Vec<u8>),
    /// The body reached the cap. Reading stopped after `transferred` bytes
    /// (zero when the declared length alone was enough to refuse it).
    Oversized(u64),
}

impl FullBody {
    /// Bytes pulled from the origin for this body.
    pub fn transferred(&self) -> u64 {
        match self {
            FullBody::Complete(body) => body.len() as u64,
            FullBody::Oversized(transferred) => *transferred,
        }
    }
}

/// How a server answered a range GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeReply {
    /// 206: the requested span (possibly short).
    Partial(Vec<u8>),
    /// 200: the server ignored the range and sent the whole body.
    Full(FullBody),
    /// 416: the span lies outside the resource.
    NotSatisfiable,
}

/// The three HTTP exchanges a blocking session may perform.
///
/// Implementations abandon an exchange as soon as `cancel` fires or `limit`
/// (the time left before the caller's deadline) elapses. Whole bodies are read
/// only up to `cap` bytes.
pub trait HttpTransport: Send + Sync {
    fn head(
        &self,
        url: &str,
        cancel: &CancellationToken,
        limit: Option<Duration>,
    ) -> Result<Probe, HeaderError>;

    fn get_range(
        &self,
        url: &str,
        span: ByteSpan,
        cap: u64,
        cancel: &CancellationToken,
        limit: Option<Duration>,
    ) -> Result<RangeReply, HeaderError>;

    fn get(
        &self,
        url: &str,
        cap: u64,
        cancel: &CancellationToken,
        limit: Option<Duration>,
    ) -> Result<FullBody, HeaderError>;
}

/// The three HTTP exchanges a suspending session may perform.
///
/// Deadlines and cancellation are enforced by the shell around each call.
/// Whole bodies are read only up to `cap` bytes.
#[async_trait]
pub trait AsyncHttpTransport: Send + Sync {
    async fn head(&self, url: &str) -> Result<Probe, HeaderError>;

    async fn get_range(
        &self,
        url: &str,
        span: ByteSpan,
        cap: u64,
    ) -> Result<RangeReply, HeaderError>;

    async fn get(&self, url: &str, cap: u64) -> Result<FullBody, HeaderError>;
}

fn probe_from_response(status: StatusCode, headers: &HeaderMap) -> Result<Probe, HeaderError> {
    if !status.is_success() {
        return Err(HeaderError::network(format!(
            "HEAD request failed with status: {status}"
        )));
    }

    let accepts_ranges = headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("bytes"))
        .unwrap_or(false);

    let size = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok());

    Ok(Probe {
        size,
        accepts_ranges,
    })
}

fn range_header(span: ByteSpan) -> String {
    format!("bytes={}-{}", span.offset, span.end() - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeStatus {
    Partial,
    Full,
    NotSatisfiable,
}

fn range_status(status: StatusCode) -> Result<RangeStatus, HeaderError> {
    match status {
        StatusCode::PARTIAL_CONTENT => Ok(RangeStatus::Partial),
        StatusCode::OK => Ok(RangeStatus::Full),
        StatusCode::RANGE_NOT_SATISFIABLE => Ok(RangeStatus::NotSatisfiable),
        other => Err(HeaderError::network(format!(
            "range request failed with status: {other}"
        ))),
    }
}

/// Read a 206 body, stopping once `len` bytes have arrived.
async fn read_prefix(mut resp: reqwest::Response, len: u64) -> Result<Vec<u8>, HeaderError> {
    let mut body = Vec::new();
    while (body.len() as u64) < len {
        match resp.chunk().await? {
            Some(chunk) => body.extend_from_slice(&chunk),
            None => break,
        }
    }
    Ok(body)
}

/// Read a whole body, giving up once it reaches `cap` bytes.
async fn read_capped(mut resp: reqwest::Response, cap: u64) -> Result<FullBody, HeaderError> {
    if let Some(declared) = resp.content_length()
        && declared >= cap
    {
        debug!(declared, cap, "declared body length reaches the cap, not reading it");
        return Ok(FullBody::Oversized(0));
    }

    let mut body = Vec::new();
    let mut transferred = 0u64;
    while let Some(chunk) = resp.chunk().await? {
        transferred += chunk.len() as u64;
        if transferred >= cap {
            debug!(transferred, cap, "body reached the cap, abandoning it");
            return Ok(FullBody::Oversized(transferred));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(FullBody::Complete(body))
}

/// Async reqwest client.
pub struct AsyncReqwestTransport {
    client: reqwest::Client,
}

fn default_client() -> Result<reqwest::Client, HeaderError> {
    Ok(reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

impl AsyncReqwestTransport {
    pub fn new() -> Result<Self, HeaderError> {
        Ok(Self::with_client(default_client()?))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AsyncHttpTransport for AsyncReqwestTransport {
    async fn head(&self, url: &str) -> Result<Probe, HeaderError> {
        let resp = self.client.head(url).send().await?;
        probe_from_response(resp.status(), resp.headers())
    }

    async fn get_range(
        &self,
        url: &str,
        span: ByteSpan,
        cap: u64,
    ) -> Result<RangeReply, HeaderError> {
        let resp = self
            .client
            .get(url)
            .header(RANGE, range_header(span))
            .send()
            .await?;
        match range_status(resp.status())? {
            RangeStatus::Partial => Ok(RangeReply::Partial(read_prefix(resp, span.len).await?)),
            RangeStatus::Full => Ok(RangeReply::Full(read_capped(resp, cap).await?)),
            RangeStatus::NotSatisfiable => Ok(RangeReply::NotSatisfiable),
        }
    }

    async fn get(&self, url: &str, cap: u64) -> Result<FullBody, HeaderError> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(HeaderError::network(format!(
                "GET request failed with status: {}",
                resp.status()
            )));
        }
        read_capped(resp, cap).await
    }
}

/// Blocking reqwest client.
///
/// Drives the async client on a private current-thread runtime, so a cancel
/// or an elapsed limit abandons the exchange in flight. Like any runtime, it
/// must be created and dropped outside of another one.
pub struct ReqwestTransport {
    inner: AsyncReqwestTransport,
    runtime: tokio::runtime::Runtime,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, HeaderError> {
        Self::with_client(default_client()?)
    }

    pub fn with_client(client: reqwest::Client) -> Result<Self, HeaderError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            inner: AsyncReqwestTransport::with_client(client),
            runtime,
        })
    }

    fn block_on<T>(
        &self,
        cancel: &CancellationToken,
        limit: Option<Duration>,
        fut: impl Future<Output = Result<T, HeaderError>>,
    ) -> Result<T, HeaderError> {
        self.runtime.block_on(async {
            let deadline = limit.map(|limit| tokio::time::Instant::now() + limit);
            guarded(cancel, deadline, fut).await
        })
    }
}

impl HttpTransport for ReqwestTransport {
    fn head(
        &self,
        url: &str,
        cancel: &CancellationToken,
        limit: Option<Duration>,
    ) -> Result<Probe, HeaderError> {
        self.block_on(cancel, limit, self.inner.head(url))
    }

    fn get_range(
        &self,
        url: &str,
        span: ByteSpan,
        cap: u64,
        cancel: &CancellationToken,
        limit: Option<Duration>,
    ) -> Result<RangeReply, HeaderError> {
        self.block_on(cancel, limit, self.inner.get_range(url, span, cap))
    }

    fn get(
        &self,
        url: &str,
        cap: u64,
        cancel: &CancellationToken,
        limit: Option<Duration>,
    ) -> Result<FullBody, HeaderError> {
        self.block_on(cancel, limit, self.inner.get(url, cap))
    }
}

/// Range-request state shared by the blocking and async remote readers.
///
/// Once a server answers with a full body, that body becomes resident and
/// every later read is served from it.
struct RangeState {
    url: String,
    size: u64,
    bulk_threshold: u64,
    body: Option<Vec<u8>>,
}

impl RangeState {
    fn resident(&self, span: ByteSpan) -> Option<Result<Fetched, HeaderError>> {
        let body = self.body.as_ref()?;
        if span.end() > body.len() as u64 {
            return Some(Err(HeaderError::truncated(format!(
                "requested {} bytes at offset {}, body has {} bytes",
                span.len,
                span.offset,
                body.len()
            ))));
        }
        let bytes = body[span.offset as usize..span.end() as usize].to_vec();
        Some(Ok(Fetched::resident(bytes)))
    }

    fn too_large(&self, transferred: u64) -> FetchError {
        warn!(url = %self.url, transferred, "server ignored Range and the body reached the bulk threshold");
        FetchError::after_exchange(
            HeaderError::new(
                ErrorKind::NoRangeLarge,
                format!(
                    "server ignored Range and the body reached {} bytes",
                    self.bulk_threshold
                ),
            ),
            transferred,
        )
    }

    fn accept(&mut self, span: ByteSpan, reply: RangeReply) -> Result<Fetched, FetchError> {
        match reply {
            RangeReply::Partial(mut bytes) => {
                let received = bytes.len() as u64;
                debug!(url = %self.url, offset = span.offset, len = span.len, received, "range fetched");
                if received < span.len {
                    return Err(FetchError::after_exchange(
                        HeaderError::truncated(format!(
                            "server returned {received} of {} bytes at offset {}",
                            span.len, span.offset
                        )),
                        received,
                    ));
                }
                bytes.truncate(span.len as usize);
                Ok(Fetched {
                    bytes,
                    transferred: received,
                    exchanged: true,
                })
            }
            RangeReply::Full(FullBody::Complete(body)) => {
                let transferred = body.len() as u64;
                if transferred >= self.bulk_threshold {
                    return Err(self.too_large(transferred));
                }
                warn!(url = %self.url, transferred, "server ignored Range, received full body");
                self.body = Some(body);
                match self.resident(span) {
                    Some(Ok(mut fetched)) => {
                        fetched.transferred = transferred;
                        fetched.exchanged = true;
                        Ok(fetched)
                    }
                    Some(Err(err)) => Err(FetchError::after_exchange(err, transferred)),
                    None => Err(FetchError::after_exchange(
                        HeaderError::truncated("full body unexpectedly absent"),
                        transferred,
                    )),
                }
            }
            RangeReply::Full(FullBody::Oversized(transferred)) => Err(self.too_large(transferred)),
            RangeReply::NotSatisfiable => Err(FetchError::after_exchange(
                HeaderError::truncated(format!(
                    "range {}-{} not satisfiable",
                    span.offset,
                    span.end() - 1
                )),
                0,
            )),
        }
    }
}

/// Remote origin read through a blocking [`HttpTransport`], one range GET per call.
pub struct RemoteReader<'a, T: HttpTransport> {
    transport: &'a T,
    state: RangeState,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl<'a, T: HttpTransport> RemoteReader<'a, T> {
    pub fn new(
        transport: &'a T,
        url: &str,
        size: u64,
        bulk_threshold: u64,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            transport,
            state: RangeState {
                url: url.to_string(),
                size,
                bulk_threshold,
                body: None,
            },
            cancel,
            deadline,
        }
    }
}

impl<T: HttpTransport> BlockingReadAt for RemoteReader<'_, T> {
    fn read_at(&mut self, span: ByteSpan) -> Result<Fetched, FetchError> {
        if let Some(fetched) = self.state.resident(span) {
            return Ok(fetched?);
        }
        let limit = match self.deadline {
            Some(deadline) => Some(
                deadline
                    .checked_duration_since(Instant::now())
                    .ok_or_else(HeaderError::timeout)?,
            ),
            None => None,
        };
        let reply = self.transport.get_range(
            &self.state.url,
            span,
            self.state.bulk_threshold,
            &self.cancel,
            limit,
        )?;
        self.state.accept(span, reply)
    }

    fn size(&self) -> u64 {
        self.state.size
    }
}

/// Remote origin read through an [`AsyncHttpTransport`], one range GET per call.
pub struct AsyncRemoteReader<'a, T: AsyncHttpTransport> {
    transport: &'a T,
    state: RangeState,
}

impl<'a, T: AsyncHttpTransport> AsyncRemoteReader<'a, T> {
    pub fn new(transport: &'a T, url: &str, size: u64, bulk_threshold: u64) -> Self {
        Self {
            transport,
            state: RangeState {
                url: url.to_string(),
                size,
                bulk_threshold,
                body: None,
            },
        }
    }
}

#[async_trait]
impl<T: AsyncHttpTransport> ReadAt for AsyncRemoteReader<'_, T> {
    async fn read_at(&mut self, span: ByteSpan) -> Result<Fetched, FetchError> {
        if let Some(fetched) = self.state.resident(span) {
            return Ok(fetched?);
        }
        let reply = self
            .transport
            .get_range(&self.state.url, span, self.state.bulk_threshold)
            .await?;
        self.state.accept(span, reply)
    }

    fn size(&self) -> u64 {
        self.state.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn state(bulk_threshold: u64) -> RangeState {
        RangeState {
            url: "http://example.com/a.tif".into(),
            size: 100,
            bulk_threshold,
            body: None,
        }
    }

    #[test]
    fn test_probe_reads_range_and_length_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("Bytes"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("4096"));

        let probe = probe_from_response(StatusCode::OK, &headers).unwrap();
        assert!(probe.accepts_ranges);
        assert_eq!(probe.size, Some(4096));
    }

    #[test]
    fn test_probe_without_headers() {
        let probe = probe_from_response(StatusCode::OK, &HeaderMap::new()).unwrap();
        assert!(!probe.accepts_ranges);
        assert_eq!(probe.size, None);

        let err = probe_from_response(StatusCode::NOT_FOUND, &HeaderMap::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkError);
    }

    #[test]
    fn test_range_header_is_inclusive() {
        assert_eq!(range_header(ByteSpan::new(16, 22)), "bytes=16-37");
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            range_status(StatusCode::PARTIAL_CONTENT).unwrap(),
            RangeStatus::Partial
        );
        assert_eq!(range_status(StatusCode::OK).unwrap(), RangeStatus::Full);
        assert_eq!(
            range_status(StatusCode::RANGE_NOT_SATISFIABLE).unwrap(),
            RangeStatus::NotSatisfiable
        );
        assert!(range_status(StatusCode::INTERNAL_SERVER_ERROR).is_err());
    }

    #[test]
    fn test_full_reply_becomes_resident() {
        let mut state = state(1000);
        let body: Vec<u8> = (0..100).collect();

        let first = state
            .accept(
                ByteSpan::new(10, 4),
                RangeReply::Full(FullBody::Complete(body)),
            )
            .unwrap();
        assert_eq!(first.bytes, vec![10, 11, 12, 13]);
        assert_eq!(first.transferred, 100);

        let second = state.resident(ByteSpan::new(50, 2)).unwrap().unwrap();
        assert_eq!(second.bytes, vec![50, 51]);
        assert_eq!(second.transferred, 0);
    }

    #[test]
    fn test_oversized_full_reply_keeps_its_count() {
        let mut state = state(1000);
        let err = state
            .accept(
                ByteSpan::new(0, 16),
                RangeReply::Full(FullBody::Oversized(1024)),
            )
            .unwrap_err();
        assert_eq!(err.error.kind, ErrorKind::NoRangeLarge);
        assert_eq!(err.transferred, 1024);
        assert!(err.exchanged);
        assert!(state.body.is_none());

        let err = state
            .accept(
                ByteSpan::new(0, 16),
                RangeReply::Full(FullBody::Complete(vec![0; 1000])),
            )
            .unwrap_err();
        assert_eq!(err.error.kind, ErrorKind::NoRangeLarge);
        assert_eq!(err.transferred, 1000);
    }

    #[test]
    fn test_short_partial_is_truncated() {
        let err = state(1000)
            .accept(ByteSpan::new(0, 8), RangeReply::Partial(vec![0; 4]))
            .unwrap_err();
        assert_eq!(err.error.kind, ErrorKind::TruncatedHeader);
        assert_eq!(err.transferred, 4);
        assert!(err.exchanged);
    }

    #[test]
    fn test_not_satisfiable_counts_the_exchange() {
        let err = state(1000)
            .accept(ByteSpan::new(0, 8), RangeReply::NotSatisfiable)
            .unwrap_err();
        assert_eq!(err.error.kind, ErrorKind::TruncatedHeader);
        assert_eq!(err.transferred, 0);
        assert!(err.exchanged);
    }
}
