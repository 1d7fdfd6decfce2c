//! WebSocket channel backed by tokio-tungstenite.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Control, Data, OpCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{Connector, Frame, FrameChannel, FrameKind};
use crate::error::{ConnectStage, RelayError, Result};
use crate::logging;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to `ws://` / `wss://` endpoints
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameChannel>> {
        let (ws, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| connect_error(url, e))?;
        logging::debug(&format!("WebSocket upgrade: HTTP {}", response.status()));
        Ok(Box::new(WsChannel { ws }))
    }
}

fn connect_error(url: &str, err: WsError) -> RelayError {
    let stage = match &err {
        WsError::Io(_) | WsError::Url(_) => ConnectStage::Connect,
        WsError::Http(_) => ConnectStage::Upgrade,
        _ => ConnectStage::Handshake,
    };
    let message = match &err {
        WsError::Http(response) => format!("HTTP {}", response.status()),
        other => other.to_string(),
    };
    RelayError::Connect {
        url: url.to_string(),
        stage,
        message,
    }
}

pub struct WsChannel {
    ws: WsStream,
}

#[async_trait]
impl FrameChannel for WsChannel {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|e| RelayError::Send(e.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        let message = match self.ws.next().await? {
            Ok(message) => message,
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return None,
            Err(e) => return Some(Err(RelayError::Recv(e.to_string()))),
        };

        // tungstenite answers pings itself; they still surface so the
        // reassembler can skip them.
        let frame = match message {
            Message::Text(text) => Frame::new(FrameKind::Text, true, text.into_bytes()),
            Message::Binary(data) => Frame::new(FrameKind::Binary, true, data),
            Message::Ping(data) => Frame::new(FrameKind::Ping, true, data),
            Message::Pong(data) => Frame::new(FrameKind::Pong, true, data),
            Message::Close(_) => Frame::close(),
            Message::Frame(raw) => {
                let header = raw.header();
                let kind = match header.opcode {
                    OpCode::Data(Data::Continue) => FrameKind::Continuation,
                    OpCode::Data(Data::Text) => FrameKind::Text,
                    OpCode::Data(_) => FrameKind::Binary,
                    OpCode::Control(Control::Close) => FrameKind::Close,
                    OpCode::Control(Control::Ping) => FrameKind::Ping,
                    OpCode::Control(_) => FrameKind::Pong,
                };
                Frame::new(kind, header.is_final, raw.payload().to_vec())
            }
        };
        Some(Ok(frame))
    }

    async fn close(&mut self) -> Result<()> {
        match self.ws.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(RelayError::Send(e.to_string())),
        }
    }
}
