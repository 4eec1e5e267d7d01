use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::bulk_body;
use crate::error::HeaderError;
use crate::io::{
    AsyncHttpTransport, AsyncRemoteReader, AsyncReqwestTransport, MappedFile, MemorySource,
    ReadAt, Strategy, choose_strategy, guarded,
};
use crate::model::{ExtractOptions, HeaderResult, Origin};
use crate::session::{Action, Session};

async fn drive<R: ReadAt>(
    session: &mut Session,
    reader: &mut R,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> HeaderResult {
    loop {
        let span = match session.next_action() {
            Action::Fetch(span) => span,
            Action::Finish(result) => return result,
        };
        match guarded(cancel, deadline, reader.read_at(span)).await {
            Ok(fetched) => session.supply(span, fetched),
            Err(failure) => return session.fetch_failed(failure),
        }
    }
}

/// Header extractor that suspends on every remote fetch.
///
/// Many extractions may run concurrently on one runtime; each call owns its
/// session. Local files are read from a memory map without yielding.
pub struct AsyncExtractor<T: AsyncHttpTransport = AsyncReqwestTransport> {
    transport: T,
    options: ExtractOptions,
}

impl AsyncExtractor<AsyncReqwestTransport> {
    pub fn new(options: ExtractOptions) -> Result<Self, HeaderError> {
        Ok(Self::with_transport(AsyncReqwestTransport::new()?, options))
    }
}

impl<T: AsyncHttpTransport> AsyncExtractor<T> {
    pub fn with_transport(transport: T, options: ExtractOptions) -> Self {
        Self { transport, options }
    }

    pub fn options(&self) -> &ExtractOptions {
        &self.options
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn extract(&self, origin: &Origin) -> HeaderResult {
        let deadline = self.options.timeout.map(|t| Instant::now() + t);
        let mut session = Session::new(origin.to_string(), &self.options);
        match self.run(&mut session, origin, deadline).await {
            Ok(result) => result,
            Err(err) => session.fail(err),
        }
    }

    async fn run(
        &self,
        session: &mut Session,
        origin: &Origin,
        deadline: Option<Instant>,
    ) -> Result<HeaderResult, HeaderError> {
        let cancel = &self.options.cancel;
        if cancel.is_cancelled() {
            return Err(HeaderError::cancelled());
        }

        let url = match origin {
            Origin::Local(path) => {
                let mut file = MappedFile::open(path)?;
                session.negotiated(Strategy::Mapped, file.len());
                return Ok(drive(session, &mut file, cancel, deadline).await);
            }
            Origin::Remote(url) => url,
        };

        let probe = guarded(cancel, deadline, self.transport.head(url)).await;
        session.count_exchange(0);
        let probe = probe?;

        match (choose_strategy(&probe, self.options.bulk_threshold)?, probe.size) {
            (Strategy::Ranged, Some(size)) => {
                session.negotiated(Strategy::Ranged, size);
                let mut reader = AsyncRemoteReader::new(
                    &self.transport,
                    url,
                    size,
                    self.options.bulk_threshold,
                );
                Ok(drive(session, &mut reader, cancel, deadline).await)
            }
            (Strategy::Bulk, _) => {
                let threshold = self.options.bulk_threshold;
                let body = guarded(cancel, deadline, self.transport.get(url, threshold)).await?;
                session.count_exchange(body.transferred());
                let body = bulk_body(body, threshold)?;
                debug!(url = %url, bytes = body.len(), "bulk body fetched");
                let mut body = MemorySource::new(body);
                session.negotiated(Strategy::Bulk, body.len());
                Ok(drive(session, &mut body, cancel, deadline).await)
            }
            (strategy, size) => Err(HeaderError::network(format!(
                "no usable strategy for {url}: {strategy:?} with size {size:?}"
            ))),
        }
    }
}
