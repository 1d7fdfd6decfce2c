//! Prompt → backend → document pipeline
//!
//! [`RelayClient`] owns the single [`Connection`] and runs one exchange at a
//! time: build the request, send it, read one-shot or streamed replies, feed
//! the text through the markdown parser and write the result into the
//! document under one [`WriteContext`].

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::history::HistoryCache;
use crate::logging;
use crate::markdown::{EditOp, MarkdownStreamParser};
use crate::pacing::{PacingPolicy, paced_write};
use crate::protocol::{self, HistoryEntry, Request, Response, StreamEvent, StreamStatus};
use crate::sink::{DocumentSink, WriteContext};
use crate::transport::{Connection, ConnectionOptions, Connector};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connection: ConnectionOptions,
    /// Deadline for a whole exchange, writes included
    pub exchange_timeout: Duration,
    /// Ask for streamed analyze replies
    pub stream: bool,
    /// Malformed frames tolerated in one streamed reply
    pub max_skipped_frames: usize,
    pub pacing: PacingPolicy,
}

impl From<&Config> for ClientOptions {
    fn from(config: &Config) -> Self {
        Self {
            connection: ConnectionOptions::from(&config.backend),
            exchange_timeout: config.backend.exchange_timeout(),
            stream: config.backend.stream,
            max_skipped_frames: config.backend.max_skipped_frames,
            pacing: config.typing.policy(),
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// What one exchange did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeReport {
    pub request_id: String,
    /// Reply messages read
    pub frames: usize,
    /// Malformed reply messages skipped
    pub skipped_frames: usize,
    pub chars_written: usize,
    /// Edit operations applied
    pub ops: usize,
}

impl ExchangeReport {
    fn new(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            ..Self::default()
        }
    }
}

pub struct RelayClient<C: Connector> {
    conn: Connection<C>,
    history: HistoryCache,
    options: ClientOptions,
}

impl<C: Connector> RelayClient<C> {
    pub fn new(connector: C, options: ClientOptions) -> Self {
        Self {
            conn: Connection::new(connector, options.connection.clone()),
            history: HistoryCache::new(),
            options,
        }
    }

    pub fn from_config(connector: C, config: &Config) -> Self {
        Self::new(connector, ClientOptions::from(config))
            .with_history(HistoryCache::from_config(&config.history))
    }

    pub fn with_history(mut self, history: HistoryCache) -> Self {
        self.history = history;
        self
    }

    pub fn connection(&self) -> &Connection<C> {
        &self.conn
    }

    pub fn history(&self) -> &HistoryCache {
        &self.history
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.conn.connect().await
    }

    pub async fn close(&mut self) {
        self.conn.close().await
    }

    /// Analyze `prompt` against `files` and write the answer into the document
    pub async fn ask(
        &mut self,
        prompt: &str,
        files: &[String],
        current_file: Option<&str>,
        sink: &mut dyn DocumentSink,
        cancel: &CancellationToken,
    ) -> Result<ExchangeReport> {
        let request = Request::analyze(prompt, files, current_file, self.options.stream);
        self.exchange(request, sink, cancel).await
    }

    /// Explain `prompt` in the context of `current_file`; always streamed
    pub async fn explain(
        &mut self,
        prompt: &str,
        current_file: Option<&str>,
        sink: &mut dyn DocumentSink,
        cancel: &CancellationToken,
    ) -> Result<ExchangeReport> {
        let request = Request::explain(prompt, current_file);
        self.exchange(request, sink, cancel).await
    }

    /// Explicit health round trip; returns the backend's status text
    pub async fn health(&mut self, cancel: &CancellationToken) -> Result<String> {
        if let Err(e) = self.conn.connect().await {
            logging::clear_context();
            return Err(e);
        }

        let request = Request::health();
        logging::set_request(Some(&request.id));
        let result = within(
            self.options.exchange_timeout,
            self.conn.round_trip(&request, cancel),
        )
        .await;
        logging::clear_context();

        let response = result.inspect_err(|e| self.conn.abort(e))?;
        match response {
            Response::OneShot(shot) if shot.success => {
                Ok(shot.content.unwrap_or_else(|| "ok".to_string()))
            }
            Response::OneShot(shot) => Err(RelayError::Backend(shot.error_message())),
            other => Err(RelayError::Malformed(format!(
                "unexpected health reply: {:?}",
                other
            ))),
        }
    }

    /// Re-read the full history from the backend
    pub async fn refresh_history(&mut self, cancel: &CancellationToken) -> Result<&[HistoryEntry]> {
        let result = within(
            self.options.exchange_timeout,
            self.history.refresh(&mut self.conn, cancel),
        )
        .await
        .map(|entries| entries.len());
        // A timeout drops the refresh before it clears its own context
        logging::clear_context();

        if let Err(e) = &result {
            if e.is_transport() {
                self.conn.abort(e);
            }
        }
        result?;
        Ok(self.history.entries())
    }

    async fn exchange(
        &mut self,
        request: Request,
        sink: &mut dyn DocumentSink,
        cancel: &CancellationToken,
    ) -> Result<ExchangeReport> {
        // Resolve the document first so a missing one never touches the connection
        let mut ctx = WriteContext::acquire(sink)?;
        if let Err(e) = self.conn.connect().await {
            logging::clear_context();
            return Err(e);
        }

        logging::set_request(Some(&request.id));
        logging::info(&format!(
            "Sending {} request (stream={})",
            request.kind.as_str(),
            request.is_stream
        ));

        let result = within(
            self.options.exchange_timeout,
            self.run_exchange(&request, &mut ctx, cancel),
        )
        .await;

        match &result {
            Ok(report) => logging::info(&format!(
                "Exchange done: {} frames, {} skipped, {} ops, {} chars",
                report.frames, report.skipped_frames, report.ops, report.chars_written
            )),
            Err(e) => {
                logging::error(&format!("Exchange failed: {}", e));
                // A reply may still be in flight; only a fresh socket is safe
                if !matches!(
                    e,
                    RelayError::Backend(_) | RelayError::Sink(_) | RelayError::NoDocument
                ) {
                    self.conn.abort(e);
                }
            }
        }
        logging::clear_context();
        result
    }

    async fn run_exchange(
        &mut self,
        request: &Request,
        ctx: &mut WriteContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<ExchangeReport> {
        let mut report = ExchangeReport::new(&request.id);
        self.conn
            .send(&protocol::encode_request(request)?)
            .await?;

        if request.is_stream {
            self.receive_stream(None, ctx, cancel, &mut report).await?;
            return Ok(report);
        }

        let raw = self.conn.receive(cancel).await?;
        report.frames += 1;
        match protocol::read_response(&raw)? {
            Response::OneShot(shot) if shot.success => {
                let content = shot.content.unwrap_or_default();
                let ops = MarkdownStreamParser::parse_all(&content);
                apply_ops(self.options.pacing, ctx, ops, cancel, &mut report).await?;
            }
            Response::OneShot(shot) => return Err(RelayError::Backend(shot.error_message())),
            Response::Stream(first) => {
                // Backend streamed without being asked; follow it
                logging::debug("One-shot request answered with a stream");
                self.receive_stream(Some(first), ctx, cancel, &mut report)
                    .await?;
            }
            Response::History(_) => {
                return Err(RelayError::Malformed(format!(
                    "history listing in reply to {}",
                    request.kind.as_str()
                )));
            }
        }
        Ok(report)
    }

    /// Read stream events until a terminal one, writing as text completes.
    ///
    /// Malformed messages are skipped. If writing fails the rest of the
    /// stream is still read (and discarded) so the connection stays usable,
    /// then the write error is returned.
    async fn receive_stream(
        &mut self,
        first: Option<StreamEvent>,
        ctx: &mut WriteContext<'_>,
        cancel: &CancellationToken,
        report: &mut ExchangeReport,
    ) -> Result<()> {
        let mut parser = MarkdownStreamParser::new();
        let mut next_event = first;
        let mut last_malformed: Option<String> = None;
        let mut write_error: Option<RelayError> = None;

        loop {
            let event = match next_event.take() {
                Some(event) => event,
                None => {
                    let raw = match self.conn.receive(cancel).await {
                        Ok(raw) => raw,
                        // Connection ended right after a bad message: that was the last one
                        Err(RelayError::Recv(_)) if last_malformed.is_some() => {
                            let detail = last_malformed.take().unwrap_or_default();
                            return Err(RelayError::Parse(format!("final frame: {}", detail)));
                        }
                        Err(e) => return Err(e),
                    };
                    report.frames += 1;

                    match protocol::read_response(&raw) {
                        Ok(Response::Stream(event)) => {
                            last_malformed = None;
                            event
                        }
                        Ok(Response::OneShot(shot)) => {
                            // Terminal, whatever mode the exchange is in
                            if shot.success {
                                let mut ops = parser.push(shot.content.as_deref().unwrap_or(""));
                                ops.extend(parser.finish());
                                self.write(ctx, ops, cancel, report, &mut write_error)
                                    .await?;
                                return write_error.map_or(Ok(()), Err);
                            }
                            let ops = parser.finish();
                            self.write(ctx, ops, cancel, report, &mut write_error)
                                .await?;
                            return Err(RelayError::Backend(shot.error_message()));
                        }
                        Ok(Response::History(_)) => {
                            self.skip(report, "history listing inside a stream", &mut last_malformed)?;
                            continue;
                        }
                        Err(RelayError::Parse(e) | RelayError::Malformed(e)) => {
                            self.skip(report, &e, &mut last_malformed)?;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            };

            match event.status {
                StreamStatus::Streaming => {
                    if let Some(content) = event.content.as_deref() {
                        let ops = parser.push(content);
                        self.write(ctx, ops, cancel, report, &mut write_error)
                            .await?;
                    }
                }
                StreamStatus::Complete => {
                    let mut ops = parser.push(event.content.as_deref().unwrap_or(""));
                    ops.extend(parser.finish());
                    self.write(ctx, ops, cancel, report, &mut write_error)
                        .await?;
                    return write_error.map_or(Ok(()), Err);
                }
                StreamStatus::Error => {
                    let ops = parser.finish();
                    self.write(ctx, ops, cancel, report, &mut write_error)
                        .await?;
                    let message = event
                        .content
                        .unwrap_or_else(|| "stream ended with an error".to_string());
                    return Err(RelayError::Backend(message));
                }
            }
        }
    }

    fn skip(
        &self,
        report: &mut ExchangeReport,
        detail: &str,
        last_malformed: &mut Option<String>,
    ) -> Result<()> {
        report.skipped_frames += 1;
        logging::warn(&format!("Skipping malformed frame: {}", detail));
        if report.skipped_frames > self.options.max_skipped_frames {
            return Err(RelayError::Parse(format!(
                "gave up after {} malformed frames (last: {})",
                report.skipped_frames, detail
            )));
        }
        *last_malformed = Some(detail.to_string());
        Ok(())
    }

    /// Apply `ops` unless an earlier write already failed. Sink failures are
    /// parked in `write_error`; cancellation is returned straight away.
    async fn write(
        &self,
        ctx: &mut WriteContext<'_>,
        ops: Vec<EditOp>,
        cancel: &CancellationToken,
        report: &mut ExchangeReport,
        write_error: &mut Option<RelayError>,
    ) -> Result<()> {
        if write_error.is_some() || ops.is_empty() {
            return Ok(());
        }
        match apply_ops(self.options.pacing, ctx, ops, cancel, report).await {
            Err(RelayError::Cancelled) => Err(RelayError::Cancelled),
            Err(e) => {
                logging::error(&format!("Document write failed, draining stream: {}", e));
                *write_error = Some(e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }
}

async fn apply_ops(
    pacing: PacingPolicy,
    ctx: &mut WriteContext<'_>,
    ops: Vec<EditOp>,
    cancel: &CancellationToken,
    report: &mut ExchangeReport,
) -> Result<()> {
    for op in &ops {
        match op {
            EditOp::Text(run) => {
                let style = run.style;
                paced_write(pacing, &run.text, cancel, |piece| ctx.write(piece, style)).await?;
            }
            other => ctx.apply(other)?,
        }
        report.ops += 1;
        report.chars_written = ctx.position();
    }
    Ok(())
}

async fn within<T>(deadline: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Timeout(format!(
            "the exchange ({}ms)",
            deadline.as_millis()
        ))),
    }
}
