//! In-memory log of exchanged turns, rebuilt from the backend on demand.

use chrono::{DateTime, Local};
use serde_json::Value;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::config::HistoryConfig;
use crate::error::{RelayError, Result};
use crate::logging;
use crate::protocol::{self, HistoryEntry, Request, Response};
use crate::storage;
use crate::transport::{Connection, Connector};

#[derive(Debug, Default)]
pub struct HistoryCache {
    entries: Vec<HistoryEntry>,
    refreshed_at: Option<DateTime<Local>>,
    /// Where to keep the raw text of the last reply, if anywhere
    dump_path: Option<PathBuf>,
}

impl HistoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &HistoryConfig) -> Self {
        let dump_path = if config.debug_dump {
            HistoryConfig::dump_path()
        } else {
            None
        };
        Self {
            dump_path,
            ..Self::default()
        }
    }

    pub fn with_dump_path(mut self, path: Option<PathBuf>) -> Self {
        self.dump_path = path;
        self
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Local>> {
        self.refreshed_at
    }

    /// Ask the backend for the full history and replace the cache with it.
    ///
    /// Any failure leaves the previous entries in place.
    pub async fn refresh<C: Connector>(
        &mut self,
        conn: &mut Connection<C>,
        cancel: &CancellationToken,
    ) -> Result<&[HistoryEntry]> {
        if let Err(e) = conn.connect().await {
            logging::clear_context();
            return Err(e);
        }

        let request = Request::history();
        logging::set_request(Some(&request.id));
        let result = async {
            conn.send(&protocol::encode_request(&request)?).await?;
            conn.receive(cancel).await
        }
        .await;
        logging::clear_context();

        let raw = result?;
        self.replace_from_reply(&raw)?;
        Ok(&self.entries)
    }

    /// Parse a raw history reply and, if it holds records, swap them in.
    pub fn replace_from_reply(&mut self, raw: &str) -> Result<usize> {
        self.dump(raw);

        let entries = match protocol::read_response(raw) {
            Ok(response) => entries_from_response(response),
            Err(RelayError::Parse(e) | RelayError::Malformed(e)) => Err(RelayError::History(e)),
            Err(e) => Err(e),
        };
        let entries = match entries {
            Ok(entries) => entries,
            Err(e) => {
                logging::warn(&format!("History refresh rejected: {}", e));
                return Err(e);
            }
        };

        self.entries = entries;
        self.refreshed_at = Some(Local::now());
        logging::info(&format!("History refreshed: {} entries", self.entries.len()));
        Ok(self.entries.len())
    }

    fn dump(&self, raw: &str) {
        let Some(path) = &self.dump_path else {
            return;
        };
        if let Err(e) = storage::write_text(path, raw) {
            logging::warn(&format!("History dump to {} failed: {}", path.display(), e));
        }
    }
}

/// Extract history records from any reply shape the backend uses for them:
/// a `data` listing, or a successful one-shot whose content is the array.
pub fn entries_from_response(response: Response) -> Result<Vec<HistoryEntry>> {
    match response {
        Response::History(entries) => Ok(entries),
        Response::OneShot(shot) if !shot.success => Err(RelayError::Backend(shot.error_message())),
        Response::OneShot(shot) => {
            if let Some(Value::Array(items)) = &shot.data {
                return records(items);
            }
            match shot.content.as_deref().map(|c| serde_json::from_str::<Value>(c.trim())) {
                Some(Ok(Value::Array(items))) => records(&items),
                Some(Ok(_)) | None => Err(RelayError::History(
                    "reply carried no history records".to_string(),
                )),
                Some(Err(e)) => Err(RelayError::History(format!(
                    "history content is not JSON: {}",
                    e
                ))),
            }
        }
        Response::Stream(event) => Err(RelayError::History(format!(
            "expected a history listing, got a '{:?}' stream event",
            event.status
        ))),
    }
}

fn records(items: &[Value]) -> Result<Vec<HistoryEntry>> {
    protocol::read_history_entries(items).map_err(|e| match e {
        RelayError::Malformed(msg) => RelayError::History(msg),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Frame;
    use crate::transport::testing::{MockConnector, options};

    const LISTING: &str = r#"{"data":[
        {"message":"hi","timestamp":"2024-01-01T10:00:00","role":"user"},
        {"message":"hello","timestamp":"2024-01-01T10:00:01","role":"assistant"}
    ]}"#;

    #[test]
    fn test_data_listing() {
        let mut cache = HistoryCache::new();
        assert_eq!(cache.replace_from_reply(LISTING).unwrap(), 2);
        assert_eq!(cache.entries()[1].role, "assistant");
        assert!(cache.refreshed_at().is_some());
    }

    #[test]
    fn test_one_shot_with_array_content() {
        let mut cache = HistoryCache::new();
        let reply = r#"{"success":true,"content":"[{\"message\":\"m\",\"role\":\"user\"}]"}"#;
        assert_eq!(cache.replace_from_reply(reply).unwrap(), 1);
        assert_eq!(cache.entries()[0].message, "m");
        assert_eq!(cache.entries()[0].timestamp, "");

        let structured = r#"{"success":true,"content":[{"message":"s"}]}"#;
        assert_eq!(cache.replace_from_reply(structured).unwrap(), 1);
        assert_eq!(cache.entries()[0].message, "s");
    }

    #[test]
    fn test_refresh_replaces_wholesale() {
        let mut cache = HistoryCache::new();
        cache.replace_from_reply(LISTING).unwrap();
        cache
            .replace_from_reply(r#"{"data":[{"message":"only"}]}"#)
            .unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.entries()[0].message, "only");
    }

    #[test]
    fn test_malformed_reply_leaves_cache_untouched() {
        let mut cache = HistoryCache::new();
        cache.replace_from_reply(LISTING).unwrap();

        for bad in [
            "{not json",
            r#"{"data":[1,2]}"#,
            r#"{"success":true,"content":"plain words"}"#,
            r#"{"something":"else"}"#,
        ] {
            let err = cache.replace_from_reply(bad).unwrap_err();
            assert!(matches!(err, RelayError::History(_)), "{}: {:?}", bad, err);
            assert_eq!(cache.len(), 2);
        }

        let err = cache
            .replace_from_reply(r#"{"success":false,"error":"db down"}"#)
            .unwrap_err();
        assert!(matches!(err, RelayError::Backend(ref m) if m == "db down"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_debug_dump_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_history.txt");
        let mut cache = HistoryCache::new().with_dump_path(Some(path.clone()));

        cache.replace_from_reply(LISTING).unwrap();
        let _ = cache.replace_from_reply("{broken");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{broken");
    }

    #[tokio::test]
    async fn test_refresh_over_connection() {
        let connector = MockConnector::replying(vec![Frame::text(LISTING)]);
        let mut conn = Connection::new(connector.clone(), options());
        let mut cache = HistoryCache::new();

        let entries = cache
            .refresh(&mut conn, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);

        let kinds: Vec<_> = connector
            .sent_requests()
            .iter()
            .map(|r| r.kind.as_str())
            .collect();
        assert_eq!(kinds, vec!["health", "history"]);
    }
}
