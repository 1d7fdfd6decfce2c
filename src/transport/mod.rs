//! Connection to the AI backend
//!
//! A [`Connection`] owns at most one [`FrameChannel`] and walks the
//! `Disconnected → Connecting → Open → Closing → Closed` lifecycle. Frames
//! are reassembled into complete text messages here, so channel
//! implementations only have to surface raw frames.

pub mod ws;

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::BackendConfig;
use crate::error::{ConnectStage, RelayError, Result};
use crate::logging;
use crate::protocol::{self, Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
    Continuation,
    Ping,
    Pong,
    Close,
}

/// One transport-level unit of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Last frame of its message
    pub fin: bool,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, fin: bool, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            fin,
            payload: payload.into(),
        }
    }

    /// A complete single-frame text message
    pub fn text(text: &str) -> Self {
        Self::new(FrameKind::Text, true, text.as_bytes())
    }

    pub fn close() -> Self {
        Self::new(FrameKind::Close, true, Vec::new())
    }
}

/// A bidirectional, message-oriented channel to one endpoint
#[async_trait]
pub trait FrameChannel: Send {
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Next raw frame; `None` once the peer is gone
    async fn next_frame(&mut self) -> Option<Result<Frame>>;

    /// Send a close frame and release the socket
    async fn close(&mut self) -> Result<()>;
}

/// Opens frame channels. Failures must release anything partially acquired.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameChannel>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Outcome of the post-connect health round trip
#[derive(Debug, Clone, PartialEq)]
pub enum HealthReport {
    Healthy(String),
    Unhealthy(String),
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub url: String,
    pub connect_timeout: Duration,
    pub frame_timeout: Duration,
    pub health_check: bool,
}

impl From<&BackendConfig> for ConnectionOptions {
    fn from(backend: &BackendConfig) -> Self {
        Self {
            url: backend.url.clone(),
            connect_timeout: backend.connect_timeout(),
            frame_timeout: backend.frame_timeout(),
            health_check: backend.health_check,
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from(&BackendConfig::default())
    }
}

/// Upper bound for the close handshake
const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub struct Connection<C: Connector> {
    connector: C,
    options: ConnectionOptions,
    state: ConnectionState,
    channel: Option<Box<dyn FrameChannel>>,
    health_checks: usize,
    last_health: Option<HealthReport>,
}

impl<C: Connector> Connection<C> {
    pub fn new(connector: C, options: ConnectionOptions) -> Self {
        Self {
            connector,
            options,
            state: ConnectionState::Disconnected,
            channel: None,
            health_checks: 0,
            last_health: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open && self.channel.is_some()
    }

    pub fn url(&self) -> &str {
        &self.options.url
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Number of health round trips performed so far
    pub fn health_checks(&self) -> usize {
        self.health_checks
    }

    pub fn last_health(&self) -> Option<&HealthReport> {
        self.last_health.as_ref()
    }

    /// Open the connection. Returns immediately when already open.
    ///
    /// A successful open is followed by one health round trip whose outcome
    /// is logged and recorded but never turns success into failure. If that
    /// round trip cost the socket (no reply in time, peer hung up) a fresh
    /// one is opened without repeating the check.
    pub async fn connect(&mut self) -> Result<()> {
        logging::set_endpoint(&self.options.url);
        if self.is_open() {
            return Ok(());
        }

        self.open_channel().await?;

        if self.options.health_check {
            self.run_health_check().await;
            if !self.is_open() {
                logging::info("Health check dropped the socket, reopening");
                self.open_channel().await?;
            }
        }

        Ok(())
    }

    async fn open_channel(&mut self) -> Result<()> {
        self.state = ConnectionState::Connecting;
        logging::info(&format!("Connecting to {}", self.options.url));

        let attempt = tokio::time::timeout(
            self.options.connect_timeout,
            self.connector.connect(&self.options.url),
        )
        .await;

        let channel = match attempt {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                self.state = ConnectionState::Disconnected;
                logging::error(&format!("Connect failed: {}", e));
                return Err(e);
            }
            Err(_) => {
                self.state = ConnectionState::Disconnected;
                let err = RelayError::Connect {
                    url: self.options.url.clone(),
                    stage: ConnectStage::Timeout,
                    message: format!(
                        "no answer within {}ms",
                        self.options.connect_timeout.as_millis()
                    ),
                };
                logging::error(&format!("Connect failed: {}", err));
                return Err(err);
            }
        };

        self.channel = Some(channel);
        self.state = ConnectionState::Open;
        logging::info(&format!("Connected to {}", self.options.url));
        Ok(())
    }

    async fn run_health_check(&mut self) {
        self.health_checks += 1;
        let cancel = CancellationToken::new();
        let report = match self.round_trip(&Request::health(), &cancel).await {
            Ok(Response::OneShot(shot)) if shot.success => {
                HealthReport::Healthy(shot.content.unwrap_or_else(|| "ok".to_string()))
            }
            Ok(Response::OneShot(shot)) => HealthReport::Unhealthy(shot.error_message()),
            Ok(other) => HealthReport::Unhealthy(format!("unexpected reply: {:?}", other)),
            Err(e) => HealthReport::Unhealthy(e.to_string()),
        };

        match &report {
            HealthReport::Healthy(detail) => logging::info(&format!("Health check ok: {}", detail)),
            HealthReport::Unhealthy(detail) => {
                logging::warn(&format!("Health check failed: {}", detail))
            }
        }
        self.last_health = Some(report);
    }

    /// Send one text payload
    pub async fn send(&mut self, payload: &str) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(RelayError::NotConnected);
        }
        let channel = self.channel.as_mut().ok_or(RelayError::NotConnected)?;

        logging::wire(">>", payload);
        let result = channel.send_text(payload).await;
        if let Err(e) = result {
            let err = match e {
                RelayError::Send(_) => e,
                other => RelayError::Send(other.to_string()),
            };
            self.abort(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Block until one complete message has been reassembled.
    ///
    /// Continuation frames are appended in arrival order until a frame with
    /// `fin` set. If the connection goes away mid-message the partial data
    /// is discarded.
    pub async fn receive(&mut self, cancel: &CancellationToken) -> Result<String> {
        let mut message: Option<Vec<u8>> = None;

        loop {
            let frame = self.next_frame(cancel).await?;

            match frame.kind {
                FrameKind::Ping | FrameKind::Pong => continue,
                FrameKind::Close => {
                    let detail = if message.is_some() {
                        "connection closed by peer (partial message discarded)"
                    } else {
                        "connection closed by peer"
                    };
                    return Err(self.fail(RelayError::Recv(detail.to_string())));
                }
                FrameKind::Text | FrameKind::Binary => {
                    if message.is_some() {
                        return Err(self.fail(RelayError::Recv(
                            "new message started before the previous one finished".to_string(),
                        )));
                    }
                    message = Some(frame.payload);
                }
                FrameKind::Continuation => match message.as_mut() {
                    Some(buf) => buf.extend_from_slice(&frame.payload),
                    None => {
                        return Err(self.fail(RelayError::Recv(
                            "continuation frame without a message in progress".to_string(),
                        )));
                    }
                },
            }

            if frame.fin {
                let bytes = message.take().unwrap_or_default();
                let text = String::from_utf8(bytes).map_err(|e| {
                    self.fail(RelayError::Recv(format!("message is not valid UTF-8: {}", e)))
                })?;
                logging::wire("<<", &text);
                return Ok(text);
            }
        }
    }

    async fn next_frame(&mut self, cancel: &CancellationToken) -> Result<Frame> {
        let frame_timeout = self.options.frame_timeout;
        let channel = self.channel.as_mut().ok_or(RelayError::NotConnected)?;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            next = tokio::time::timeout(frame_timeout, channel.next_frame()) => match next {
                Err(_) => Err(RelayError::Timeout(format!(
                    "a frame ({}ms)",
                    frame_timeout.as_millis()
                ))),
                Ok(None) => Err(RelayError::Recv("connection closed".to_string())),
                Ok(Some(Err(e))) => Err(match e {
                    RelayError::Recv(_) => e,
                    other => RelayError::Recv(other.to_string()),
                }),
                Ok(Some(Ok(frame))) => Ok(frame),
            },
        };

        outcome.map_err(|e| self.fail(e))
    }

    /// Send a request and read exactly one reply message
    pub async fn round_trip(
        &mut self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let wire = protocol::encode_request(request)?;
        self.send(&wire).await?;
        let reply = self.receive(cancel).await?;
        protocol::read_response(&reply)
    }

    /// Best-effort graceful shutdown; safe from any state
    pub async fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            self.state = ConnectionState::Closing;
            match tokio::time::timeout(CLOSE_GRACE, channel.close()).await {
                Ok(Ok(())) => logging::info(&format!("Closed connection to {}", self.options.url)),
                Ok(Err(e)) => logging::warn(&format!("Close handshake failed: {}", e)),
                Err(_) => logging::warn("Close handshake timed out"),
            }
        }
        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Closed;
        }
    }

    fn fail(&mut self, err: RelayError) -> RelayError {
        self.abort(&err);
        err
    }

    /// Drop the socket without a close handshake, e.g. when a reply was
    /// left half-read. The next exchange reconnects.
    pub fn abort(&mut self, reason: &RelayError) {
        if self.channel.take().is_some() {
            logging::warn(&format!("Dropping connection to {}: {}", self.options.url, reason));
        }
        self.state = ConnectionState::Closed;
    }
}
