//! End-to-end tests for docrelay against a mock WebSocket backend
//!
//! These run the whole pipeline over a real socket: connect + health
//! check, request encoding, reply classification, markdown parsing and
//! document writes.

mod mock_backend;

use anyhow::Result;
use docrelay::client::ClientOptions;
use docrelay::pacing::PacingPolicy;
use docrelay::protocol::RequestType;
use docrelay::transport::ConnectionOptions;
use docrelay::{ConnectStage, RelayClient, RelayError, TextDocument, WsConnector};
use mock_backend::{MockBackend, Reply};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn options(url: &str) -> ClientOptions {
    ClientOptions {
        connection: ConnectionOptions {
            url: url.to_string(),
            connect_timeout: Duration::from_secs(2),
            frame_timeout: Duration::from_secs(2),
            health_check: true,
        },
        exchange_timeout: Duration::from_secs(5),
        stream: true,
        max_skipped_frames: 4,
        pacing: PacingPolicy::Off,
    }
}

fn client(url: &str) -> RelayClient<WsConnector> {
    RelayClient::new(WsConnector, options(url))
}

/// A one-shot reply lands in the document verbatim
#[tokio::test]
async fn test_one_shot_answer() -> Result<()> {
    let backend = MockBackend::start(|_| vec![Reply::one_shot("hello")]).await?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("doc.txt");

    let mut opts = options(&backend.url);
    opts.stream = false;
    let mut client = RelayClient::new(WsConnector, opts);
    let mut doc = TextDocument::file(&path);

    let report = client
        .ask("hi", &[], None, &mut doc, &CancellationToken::new())
        .await?;
    client.close().await;

    assert_eq!(std::fs::read_to_string(&path)?, "hello");
    assert_eq!(report.chars_written, 5);
    assert_eq!(backend.kinds(), vec![RequestType::Health, RequestType::Analyze]);
    assert!(!backend.requests()[1].is_stream);
    Ok(())
}

/// Markdown split across stream frames is reassembled into styled output
#[tokio::test]
async fn test_streamed_markdown() -> Result<()> {
    let backend = MockBackend::start(|_| {
        vec![
            Reply::streaming("# Rep"),
            Reply::streaming("ort\nSome **bo"),
            Reply::streaming("ld** text\n| a | b |\n|---|---|\n"),
            Reply::streaming("| c | d |\ndo"),
            Reply::streaming("ne"),
            Reply::complete(),
        ]
    })
    .await?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("doc.txt");
    let mut doc = TextDocument::file(&path);
    let mut client = client(&backend.url);

    let report = client
        .explain("what is this", Some("main.cpp"), &mut doc, &CancellationToken::new())
        .await?;

    assert_eq!(
        std::fs::read_to_string(&path)?,
        "Report\nSome bold text\n| a | b |\n| c | d |\ndone"
    );
    assert_eq!(report.frames, 6);
    assert_eq!(report.skipped_frames, 0);

    let explain = &backend.requests()[1];
    assert_eq!(explain.kind, RequestType::Explain);
    assert_eq!(explain.current_file.as_deref(), Some("main.cpp"));
    assert!(explain.is_stream);
    Ok(())
}

/// Two exchanges share one connection and one health check
#[tokio::test]
async fn test_connection_is_reused() -> Result<()> {
    let backend =
        MockBackend::start(|_| vec![Reply::streaming("x"), Reply::complete()]).await?;
    let dir = tempfile::tempdir()?;
    let mut doc = TextDocument::file(dir.path().join("doc.txt"));
    let mut client = client(&backend.url);
    let cancel = CancellationToken::new();

    client.ask("one", &[], None, &mut doc, &cancel).await?;
    client.ask("two", &[], None, &mut doc, &cancel).await?;

    assert_eq!(backend.connections(), 1);
    assert_eq!(
        backend.kinds(),
        vec![RequestType::Health, RequestType::Analyze, RequestType::Analyze]
    );
    assert_eq!(client.connection().health_checks(), 1);
    Ok(())
}

#[tokio::test]
async fn test_health() -> Result<()> {
    let backend = MockBackend::start(|_| Vec::new()).await?;
    let mut client = client(&backend.url);

    let status = client.health(&CancellationToken::new()).await?;
    assert_eq!(status, "ok");
    assert_eq!(backend.kinds(), vec![RequestType::Health, RequestType::Health]);
    Ok(())
}

#[tokio::test]
async fn test_history_refresh() -> Result<()> {
    let backend = MockBackend::start(|request| match request.kind {
        RequestType::History => vec![Reply::json(serde_json::json!({
            "data": [
                { "message": "explain main", "timestamp": "2024-05-01 10:00:00", "role": "user" },
                { "message": "It starts here.", "timestamp": "2024-05-01 10:00:02", "role": "assistant" }
            ]
        }))],
        _ => Vec::new(),
    })
    .await?;
    let mut client = client(&backend.url);

    let entries = client.refresh_history(&CancellationToken::new()).await?;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].role, "user");
    assert_eq!(entries[1].message, "It starts here.");
    Ok(())
}

/// The backend hanging up mid-stream fails the exchange; the next one reconnects
#[tokio::test]
async fn test_reconnect_after_backend_hangup() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let script_calls = Arc::clone(&calls);
    let backend = MockBackend::start(move |_| {
        if script_calls.fetch_add(1, Ordering::SeqCst) == 0 {
            vec![Reply::streaming("partial"), Reply::Close]
        } else {
            vec![Reply::streaming("again\n"), Reply::complete()]
        }
    })
    .await?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("doc.txt");
    let mut doc = TextDocument::file(&path);
    let mut client = client(&backend.url);
    let cancel = CancellationToken::new();

    let err = client
        .ask("first", &[], None, &mut doc, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Recv(_)), "{:?}", err);
    assert!(!client.connection().is_open());

    client.ask("second", &[], None, &mut doc, &cancel).await?;
    assert_eq!(backend.connections(), 2);
    assert_eq!(std::fs::read_to_string(&path)?, "again\n");
    Ok(())
}

#[tokio::test]
async fn test_stream_error_status() -> Result<()> {
    let backend = MockBackend::start(|_| {
        vec![
            Reply::streaming("half an "),
            Reply::json(serde_json::json!({ "status": "error", "content": "quota exceeded" })),
        ]
    })
    .await?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("doc.txt");
    let mut doc = TextDocument::file(&path);
    let mut client = client(&backend.url);

    let err = client
        .ask("hi", &[], None, &mut doc, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Backend(ref m) if m == "quota exceeded"));
    assert_eq!(std::fs::read_to_string(&path)?, "half an ");
    assert!(client.connection().is_open());
    Ok(())
}

#[tokio::test]
async fn test_silent_backend_times_out() -> Result<()> {
    let backend = MockBackend::start(|_| Vec::new()).await?;
    let dir = tempfile::tempdir()?;
    let mut doc = TextDocument::file(dir.path().join("doc.txt"));
    let mut opts = options(&backend.url);
    opts.connection.frame_timeout = Duration::from_millis(100);
    let mut client = RelayClient::new(WsConnector, opts);

    let err = client
        .ask("hi", &[], None, &mut doc, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Timeout(_)), "{:?}", err);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_backend() -> Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}", listener.local_addr()?);
    drop(listener);

    let mut client = client(&url);
    let err = client.connect().await.unwrap_err();
    assert!(matches!(
        err,
        RelayError::Connect {
            stage: ConnectStage::Connect,
            ..
        }
    ));
    Ok(())
}
