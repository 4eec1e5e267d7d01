use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{bulk_body, check, remaining};
use crate::error::HeaderError;
use crate::io::{
    BlockingReadAt, FetchError, HttpTransport, MappedFile, MemorySource, RemoteReader,
    ReqwestTransport, Strategy, choose_strategy,
};
use crate::model::{ExtractOptions, HeaderResult, Origin};
use crate::session::{Action, Session};

/// Drive `session` to completion, blocking on each fetch from `reader`.
pub(crate) fn drive<R: BlockingReadAt>(
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
        if let Err(err) = check(cancel, deadline) {
            return session.fail(err);
        }
        let mut fetched = reader.read_at(span);
        // A cancel or deadline that fired while blocked discards what arrived.
        if let Err(err) = check(cancel, deadline) {
            fetched = Err(match fetched {
                Ok(fetched) => FetchError::discarding(fetched, err),
                Err(failure) => FetchError {
                    error: err,
                    ..failure
                },
            });
        }
        match fetched {
            Ok(fetched) => session.supply(span, fetched),
            Err(failure) => return session.fetch_failed(failure),
        }
    }
}

/// Header extractor that blocks the calling thread on every fetch.
///
/// Concurrency comes from calling [`extract`](Extractor::extract) on several
/// threads; each call owns its own session.
pub struct Extractor<T: HttpTransport = ReqwestTransport> {
    transport: T,
    options: ExtractOptions,
}

impl Extractor<ReqwestTransport> {
    /// Extractor with the bundled blocking reqwest client.
    ///
    /// Must not be created, used or dropped inside an async runtime: the
    /// client drives its own.
    pub fn new(options: ExtractOptions) -> Result<Self, HeaderError> {
        Ok(Self::with_transport(ReqwestTransport::new()?, options))
    }
}

impl<T: HttpTransport> Extractor<T> {
    pub fn with_transport(transport: T, options: ExtractOptions) -> Self {
        Self { transport, options }
    }

    pub fn options(&self) -> &ExtractOptions {
        &self.options
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Extract header metadata from `origin`. Never panics, never returns an `Err`:
    /// every failure is a failed [`HeaderResult`].
    pub fn extract(&self, origin: &Origin) -> HeaderResult {
        let deadline = self.options.timeout.map(|t| Instant::now() + t);
        let mut session = Session::new(origin.to_string(), &self.options);
        match self.run(&mut session, origin, deadline) {
            Ok(result) => result,
            Err(err) => session.fail(err),
        }
    }

    fn run(
        &self,
        session: &mut Session,
        origin: &Origin,
        deadline: Option<Instant>,
    ) -> Result<HeaderResult, HeaderError> {
        let cancel = &self.options.cancel;
        check(cancel, deadline)?;

        let url = match origin {
            Origin::Local(path) => {
                let mut file = MappedFile::open(path)?;
                session.negotiated(Strategy::Mapped, file.len());
                return Ok(drive(session, &mut file, cancel, deadline));
            }
            Origin::Remote(url) => url,
        };

        let probe = self.transport.head(url, cancel, remaining(deadline)?);
        session.count_exchange(0);
        let probe = probe?;
        check(cancel, deadline)?;

        match (choose_strategy(&probe, self.options.bulk_threshold)?, probe.size) {
            (Strategy::Ranged, Some(size)) => {
                session.negotiated(Strategy::Ranged, size);
                let mut reader = RemoteReader::new(
                    &self.transport,
                    url,
                    size,
                    self.options.bulk_threshold,
                    cancel.clone(),
                    deadline,
                );
                Ok(drive(session, &mut reader, cancel, deadline))
            }
            (Strategy::Bulk, _) => {
                let threshold = self.options.bulk_threshold;
                let body = self.transport.get(url, threshold, cancel, remaining(deadline)?)?;
                session.count_exchange(body.transferred());
                check(cancel, deadline)?;
                let body = bulk_body(body, threshold)?;
                debug!(url = %url, bytes = body.len(), "bulk body fetched");
                let mut body = MemorySource::new(body);
                session.negotiated(Strategy::Bulk, body.len());
                Ok(drive(session, &mut body, cancel, deadline))
            }
            (strategy, size) => Err(HeaderError::network(format!(
                "no usable strategy for {url}: {strategy:?} with size {size:?}"
            ))),
        }
    }
}
