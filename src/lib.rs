//! docrelay: relay prompts to a local AI backend over WebSocket and stream
//! the markdown answer into a document as styled text.

pub mod client;
pub mod config;
pub mod error;
pub mod history;
pub mod id;
pub mod logging;
pub mod markdown;
pub mod pacing;
pub mod protocol;
pub mod sink;
pub mod storage;
pub mod transport;

pub use client::{ClientOptions, ExchangeReport, RelayClient};
pub use error::{ConnectStage, RelayError, Result};
pub use markdown::{EditOp, MarkdownStreamParser, StyledRun, TextStyle};
pub use sink::{DocumentSink, TextDocument, WriteContext};
pub use transport::ws::WsConnector;
