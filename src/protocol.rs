//! Wire protocol between docrelay and the AI backend
//!
//! One compact JSON object per WebSocket message. Requests carry a `type`
//! discriminator; replies are either one-shot (`success`), one event of a
//! streamed reply (`status`), or a history listing (`data`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{RelayError, Result};
use crate::id::new_id;

/// Separator used when several selected files travel in `file_path`
pub const FILE_PATH_SEPARATOR: char = ';';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Analyze,
    Explain,
    History,
    Health,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Analyze => "analyze",
            RequestType::Explain => "explain",
            RequestType::History => "history",
            RequestType::Health => "health",
        }
    }
}

/// Client request to the backend. Built once, serialized once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RequestType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    #[serde(default, rename = "isStream", skip_serializing_if = "is_false")]
    pub is_stream: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Request {
    fn new(kind: RequestType) -> Self {
        Self {
            id: new_id("req"),
            kind,
            prompt: None,
            file_path: None,
            current_file: None,
            is_stream: false,
        }
    }

    /// Analyze `prompt` against the selected files
    pub fn analyze(
        prompt: &str,
        files: &[String],
        current_file: Option<&str>,
        stream: bool,
    ) -> Self {
        let mut request = Self::new(RequestType::Analyze);
        request.prompt = Some(prompt.to_string());
        request.file_path = join_files(files);
        request.current_file = current_file.map(str::to_string);
        request.is_stream = stream;
        request
    }

    /// Explain `prompt` in the context of the current file; always streamed
    pub fn explain(prompt: &str, current_file: Option<&str>) -> Self {
        let mut request = Self::new(RequestType::Explain);
        request.prompt = Some(prompt.to_string());
        request.current_file = current_file.map(str::to_string);
        request.is_stream = true;
        request
    }

    pub fn history() -> Self {
        Self::new(RequestType::History)
    }

    pub fn health() -> Self {
        Self::new(RequestType::Health)
    }

    /// Files carried in `file_path`, split back apart
    pub fn files(&self) -> Vec<String> {
        self.file_path
            .as_deref()
            .map(|joined| {
                joined
                    .split(FILE_PATH_SEPARATOR)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn join_files(files: &[String]) -> Option<String> {
    if files.is_empty() {
        return None;
    }
    let sep = FILE_PATH_SEPARATOR.to_string();
    Some(files.join(&sep))
}

/// Encode a request as compact JSON text
pub fn encode_request(request: &Request) -> Result<String> {
    serde_json::to_string(request).map_err(|e| RelayError::Parse(e.to_string()))
}

/// Decode a request (backend side, and for tests)
pub fn decode_request(text: &str) -> Result<Request> {
    serde_json::from_str(text).map_err(|e| RelayError::Parse(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Streaming,
    Complete,
    Error,
}

impl StreamStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamStatus::Streaming)
    }
}

/// One event of a streamed reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub status: StreamStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// A single complete reply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OneShot {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Structured content: a non-string `content`, or a top-level `data` field
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl OneShot {
    /// Failure message, falling back to the content or a generic text
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.content.clone())
            .unwrap_or_else(|| "backend reported failure".to_string())
    }
}

/// One exchanged turn, as listed by a history reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HistoryEntry {
    pub message: String,
    pub timestamp: String,
    pub role: String,
}

/// A parsed backend message
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    OneShot(OneShot),
    Stream(StreamEvent),
    History(Vec<HistoryEntry>),
}

/// Parse and classify one backend message.
///
/// Invalid JSON is `Parse`; valid JSON with no recognizable shape is
/// `Malformed`. Classification: `status` → stream event, `success` →
/// one-shot, `data` array → history.
pub fn read_response(text: &str) -> Result<Response> {
    let value: Value =
        serde_json::from_str(text.trim()).map_err(|e| RelayError::Parse(e.to_string()))?;
    let Value::Object(obj) = value else {
        return Err(RelayError::Malformed(format!(
            "expected a JSON object, got {}",
            kind_of(&value)
        )));
    };

    if obj.contains_key("status") {
        read_stream_event(&obj).map(Response::Stream)
    } else if obj.contains_key("success") {
        read_one_shot(&obj).map(Response::OneShot)
    } else if let Some(Value::Array(items)) = obj.get("data") {
        read_history_entries(items).map(Response::History)
    } else {
        let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        Err(RelayError::Malformed(format!(
            "no status/success/data field (keys: {})",
            keys.join(", ")
        )))
    }
}

fn read_stream_event(obj: &Map<String, Value>) -> Result<StreamEvent> {
    let status = match obj.get("status") {
        Some(Value::String(s)) => match s.as_str() {
            "streaming" => StreamStatus::Streaming,
            "complete" => StreamStatus::Complete,
            "error" => StreamStatus::Error,
            other => {
                return Err(RelayError::Malformed(format!(
                    "unknown stream status '{}'",
                    other
                )));
            }
        },
        Some(other) => {
            return Err(RelayError::Malformed(format!(
                "status must be a string, got {}",
                kind_of(other)
            )));
        }
        None => return Err(RelayError::Malformed("missing status".to_string())),
    };

    let content = match obj.get("content") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(RelayError::Malformed(format!(
                "stream content must be a string, got {}",
                kind_of(other)
            )));
        }
    };

    Ok(StreamEvent { status, content })
}

fn read_one_shot(obj: &Map<String, Value>) -> Result<OneShot> {
    let success = match obj.get("success") {
        Some(Value::Bool(b)) => *b,
        Some(other) => {
            return Err(RelayError::Malformed(format!(
                "success must be a boolean, got {}",
                kind_of(other)
            )));
        }
        None => return Err(RelayError::Malformed("missing success".to_string())),
    };

    let (content, mut data) = match obj.get("content") {
        None | Some(Value::Null) => (None, None),
        Some(Value::String(s)) => (Some(s.clone()), None),
        Some(structured) => (None, Some(structured.clone())),
    };
    if data.is_none() {
        data = obj.get("data").filter(|v| !v.is_null()).cloned();
    }

    let error = match obj.get("error") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };

    Ok(OneShot {
        success,
        content,
        error,
        data,
    })
}

/// Decode an array of history records. Records that are not objects are
/// rejected; missing fields default to empty strings.
pub fn read_history_entries(items: &[Value]) -> Result<Vec<HistoryEntry>> {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            if !item.is_object() {
                return Err(RelayError::Malformed(format!(
                    "history record {} is {}, expected an object",
                    i,
                    kind_of(item)
                )));
            }
            serde_json::from_value::<HistoryEntry>(item.clone())
                .map_err(|e| RelayError::Malformed(format!("history record {}: {}", i, e)))
        })
        .collect()
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
