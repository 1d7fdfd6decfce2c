//! Mock AI backend for e2e tests
//!
//! A real WebSocket server on 127.0.0.1 that answers each request with a
//! scripted sequence of replies.

use anyhow::Result;
use docrelay::protocol::{Request, RequestType, decode_request};
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

pub enum Reply {
    Text(String),
    /// Close the socket instead of answering further
    Close,
}

impl Reply {
    pub fn json(value: serde_json::Value) -> Self {
        Reply::Text(value.to_string())
    }

    pub fn streaming(content: &str) -> Self {
        Self::json(serde_json::json!({ "status": "streaming", "content": content }))
    }

    pub fn complete() -> Self {
        Self::json(serde_json::json!({ "status": "complete" }))
    }

    pub fn one_shot(content: &str) -> Self {
        Self::json(serde_json::json!({ "success": true, "content": content }))
    }
}

type Script = Arc<dyn Fn(&Request) -> Vec<Reply> + Send + Sync>;

pub struct MockBackend {
    pub url: String,
    requests: Arc<Mutex<Vec<Request>>>,
    connections: Arc<Mutex<usize>>,
    handle: JoinHandle<()>,
}

impl MockBackend {
    /// Start a backend; health requests are answered with `ok` before the
    /// script is consulted.
    pub async fn start(
        script: impl Fn(&Request) -> Vec<Reply> + Send + Sync + 'static,
    ) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("ws://{}", listener.local_addr()?);
        let script: Script = Arc::new(script);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(0));

        let handle = {
            let requests = Arc::clone(&requests);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    *connections.lock().unwrap() += 1;
                    let script = Arc::clone(&script);
                    let requests = Arc::clone(&requests);
                    tokio::spawn(async move {
                        let _ = serve(stream, script, requests).await;
                    });
                }
            })
        };

        Ok(Self {
            url,
            requests,
            connections,
            handle,
        })
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<RequestType> {
        self.requests().iter().map(|r| r.kind).collect()
    }

    pub fn connections(&self) -> usize {
        *self.connections.lock().unwrap()
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    stream: tokio::net::TcpStream,
    script: Script,
    requests: Arc<Mutex<Vec<Request>>>,
) -> Result<()> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;

    while let Some(message) = ws.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let request = decode_request(&text)?;
        requests.lock().unwrap().push(request.clone());

        let replies = if request.kind == RequestType::Health {
            vec![Reply::json(serde_json::json!({ "success": true, "content": "ok" }))]
        } else {
            script(&request)
        };

        for reply in replies {
            match reply {
                Reply::Text(text) => ws.send(Message::Text(text)).await?,
                Reply::Close => {
                    ws.close(None).await?;
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}
