//! The per-extraction state machine shared by both execution shells.
//!
//! A [`Session`] never touches an origin. The shell negotiates a strategy,
//! then repeatedly asks [`Session::next_action`] what to do: fetch one byte
//! span and hand it back through [`Session::supply`], or return the finished
//! [`HeaderResult`]. How the shell waits for a fetch is its own business.
//!
//! ```text
//! Probing -> FetchingSignature -> Parsing -> [FetchingMore <-> Parsing]* -> Assembling -> Done
//!                         (any state) -> Failed(kind)
//! ```

use tracing::{debug, trace};

use crate::assemble::assemble;
use crate::error::{ErrorKind, HeaderError};
use crate::format::{Detection, FormatParser, HeaderParser, SIGNATURE_WINDOW, Step, detect};
use crate::io::{ByteSpan, FetchError, Fetched, Strategy, WindowCache};
use crate::model::{ExtractOptions, HeaderResult};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Probing,
    FetchingSignature,
    Parsing,
    FetchingMore,
    Assembling,
    Done,
    Failed(ErrorKind),
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed(_))
    }
}

/// What the shell must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Fetch exactly this span and pass it to [`Session::supply`].
    Fetch(ByteSpan),
    /// The extraction is over.
    Finish(HeaderResult),
}

#[derive(Debug)]
enum Stage {
    Probing,
    Signature,
    Detecting,
    Parsing(FormatParser),
    Failed(HeaderError),
    Finished(HeaderResult),
}

/// State of one extraction call. Never shared between calls.
#[derive(Debug)]
pub struct Session {
    source: String,
    options: ExtractOptions,
    phase: Phase,
    strategy: Option<Strategy>,
    cache: WindowCache,
    stage: Stage,
    extended: bool,
    bytes_fetched: u64,
    requests_made: u64,
}

impl Session {
    pub fn new(source: impl Into<String>, options: &ExtractOptions) -> Self {
        Self {
            source: source.into(),
            options: options.clone(),
            phase: Phase::Probing,
            strategy: None,
            cache: WindowCache::new(0),
            stage: Stage::Probing,
            extended: false,
            bytes_fetched: 0,
            requests_made: 0,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn strategy(&self) -> Option<Strategy> {
        self.strategy
    }

    pub fn bytes_fetched(&self) -> u64 {
        self.bytes_fetched
    }

    pub fn requests_made(&self) -> u64 {
        self.requests_made
    }

    /// Count one exchange with the origin made outside [`supply`](Self::supply),
    /// such as the probe or a bulk download.
    pub fn count_exchange(&mut self, transferred: u64) {
        self.requests_made += 1;
        self.bytes_fetched += transferred;
    }

    /// Fix the strategy and the origin size. Only valid while probing.
    pub fn negotiated(&mut self, strategy: Strategy, size: u64) {
        if self.phase != Phase::Probing {
            return;
        }
        debug!(source = %self.source, ?strategy, size, "strategy negotiated");
        self.strategy = Some(strategy);
        self.cache = WindowCache::new(size);
        self.stage = Stage::Signature;
        self.phase = Phase::FetchingSignature;
    }

    fn account(&mut self, transferred: u64, exchanged: bool) {
        self.bytes_fetched += transferred;
        if exchanged {
            self.requests_made += 1;
        }
    }

    /// Hand back the bytes for a span returned by [`Action::Fetch`].
    pub fn supply(&mut self, span: ByteSpan, fetched: Fetched) {
        if self.phase.is_terminal() {
            return;
        }
        self.account(fetched.transferred, fetched.exchanged);
        if fetched.bytes.len() as u64 != span.len {
            self.stage = Stage::Failed(HeaderError::truncated(format!(
                "expected {} bytes at offset {}, got {}",
                span.len,
                span.offset,
                fetched.bytes.len()
            )));
            return;
        }
        debug!(
            offset = span.offset,
            len = span.len,
            transferred = fetched.transferred,
            "window fetched"
        );
        self.cache.insert(span.offset, fetched.bytes);
    }

    /// Report a fetch that failed, counting whatever it pulled before failing.
    pub fn fetch_failed(&mut self, failure: FetchError) -> HeaderResult {
        if !self.phase.is_terminal() {
            self.account(failure.transferred, failure.exchanged);
        }
        self.fail(failure.error)
    }

    /// Move to `Failed`, discarding resident bytes. A finished session keeps its result.
    pub fn fail(&mut self, err: HeaderError) -> HeaderResult {
        if let Stage::Finished(result) = &self.stage {
            return result.clone();
        }
        debug!(source = %self.source, kind = %err.kind, message = %err.message, "extraction failed");
        self.phase = Phase::Failed(err.kind);
        self.cache = WindowCache::new(self.cache.size());
        let result = HeaderResult::failure(
            self.source.clone(),
            err,
            self.bytes_fetched,
            self.requests_made,
        );
        self.stage = Stage::Finished(result.clone());
        result
    }

    /// Advance until a fetch is needed or the extraction is over.
    pub fn next_action(&mut self) -> Action {
        match self.advance() {
            Ok(action) => action,
            Err(err) => Action::Finish(self.fail(err)),
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            trace!(from = ?self.phase, to = ?phase, "phase");
            self.phase = phase;
        }
    }

    fn advance(&mut self) -> Result<Action, HeaderError> {
        loop {
            match &mut self.stage {
                Stage::Probing => {
                    return Err(HeaderError::new(
                        ErrorKind::IoError,
                        "session used before its origin was negotiated",
                    ));
                }
                Stage::Failed(err) => return Err(err.clone()),
                Stage::Finished(result) => return Ok(Action::Finish(result.clone())),
                Stage::Signature => {
                    let size = self.cache.size();
                    if size == 0 {
                        return Err(HeaderError::truncated("origin is empty"));
                    }
                    let window = ByteSpan::new(0, SIGNATURE_WINDOW.min(size));
                    if let Some(gap) = self.cache.missing(window) {
                        return Ok(Action::Fetch(gap));
                    }
                    self.stage = Stage::Detecting;
                }
                Stage::Detecting => match detect(&self.cache) {
                    Detection::Found(format) => {
                        debug!(source = %self.source, %format, "format detected");
                        self.stage = Stage::Parsing(FormatParser::new(format, &self.options));
                        self.set_phase(Phase::Parsing);
                    }
                    Detection::Extend(span) if !self.extended => {
                        self.extended = true;
                        match self.cache.missing(span) {
                            Some(gap) => return Ok(Action::Fetch(gap)),
                            None => return Err(HeaderError::unsupported("no known signature matched")),
                        }
                    }
                    Detection::Extend(_) | Detection::Unsupported => {
                        return Err(HeaderError::unsupported("no known signature matched"));
                    }
                },
                Stage::Parsing(parser) => {
                    self.phase = Phase::Parsing;
                    match parser.resume(&self.cache)? {
                        Step::Need(span) => return self.request(span),
                        Step::Done(fields) => {
                            self.set_phase(Phase::Assembling);
                            let data = assemble(fields)?;
                            let result = HeaderResult::success(
                                self.source.clone(),
                                data,
                                self.bytes_fetched,
                                self.requests_made,
                            );
                            debug!(source = %self.source, bytes = self.bytes_fetched, "extraction done");
                            self.set_phase(Phase::Done);
                            self.stage = Stage::Finished(result.clone());
                            return Ok(Action::Finish(result));
                        }
                    }
                }
            }
        }
    }

    /// Turn a parser's need into the part of it that still has to be fetched.
    fn request(&mut self, span: ByteSpan) -> Result<Action, HeaderError> {
        let size = self.cache.size();
        if span.end() > size || span.offset.checked_add(span.len).is_none() {
            return Err(HeaderError::truncated(format!(
                "need {} bytes at offset {}, origin has {size}",
                span.len, span.offset
            )));
        }
        match self.cache.missing(span) {
            Some(gap) => {
                self.set_phase(Phase::FetchingMore);
                Ok(Action::Fetch(gap))
            }
            None => Err(HeaderError::invalid_header(format!(
                "parser stalled on resident span at offset {}",
                span.offset
            ))),
        }
    }
}
