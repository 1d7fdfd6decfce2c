//! Logging infrastructure for docrelay
//!
//! Logs to `<app_dir>/logs/` with one file per day; old files are pruned.
//!
//! Supports a thread-local (or tokio-task-local) context carrying the
//! endpoint and the request currently in flight.

use chrono::Local;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);
static TRACE: AtomicBool = AtomicBool::new(false);
static TASK_LOG_CONTEXTS: OnceLock<Mutex<HashMap<String, LogContext>>> = OnceLock::new();

/// Per-thread (or per-task) logging context
#[derive(Default, Clone)]
pub struct LogContext {
    pub endpoint: Option<String>,
    pub request: Option<String>,
}

thread_local! {
    static LOG_CONTEXT: RefCell<LogContext> = RefCell::new(LogContext::default());
}

/// Record the backend endpoint for the current thread/task
pub fn set_endpoint(endpoint: &str) {
    if with_task_context_mut(|ctx| {
        ctx.endpoint = Some(endpoint.to_string());
    }) {
        return;
    }

    LOG_CONTEXT.with(|c| {
        c.borrow_mut().endpoint = Some(endpoint.to_string());
    });
}

/// Record (or clear) the request id currently in flight
pub fn set_request(request: Option<&str>) {
    let request = request.map(|r| crate::id::short_id(r).to_string());
    if with_task_context_mut(|ctx| {
        ctx.request = request.clone();
    }) {
        return;
    }

    LOG_CONTEXT.with(|c| {
        c.borrow_mut().request = request;
    });
}

/// Clear the logging context for the current thread/task.
///
/// Call once a task is done with a request so its entry does not outlive it.
pub fn clear_context() {
    if let Some(task_id) = current_task_id() {
        if let Some(store) = TASK_LOG_CONTEXTS.get() {
            if let Ok(mut contexts) = store.lock() {
                contexts.remove(&task_id);
            }
        }
    }

    LOG_CONTEXT.with(|c| {
        *c.borrow_mut() = LogContext::default();
    });
}

fn context_prefix() -> String {
    if let Some(task_ctx) = task_context_snapshot() {
        return context_prefix_for(&task_ctx);
    }

    LOG_CONTEXT.with(|c| context_prefix_for(&c.borrow()))
}

fn current_task_id() -> Option<String> {
    tokio::task::try_id().map(|id| id.to_string())
}

fn with_task_context_mut(update: impl FnOnce(&mut LogContext)) -> bool {
    let Some(task_id) = current_task_id() else {
        return false;
    };

    let store = TASK_LOG_CONTEXTS.get_or_init(|| Mutex::new(HashMap::new()));
    if let Ok(mut contexts) = store.lock() {
        let ctx = contexts.entry(task_id).or_default();
        update(ctx);
        true
    } else {
        false
    }
}

#[cfg(test)]
pub(crate) fn has_task_context() -> bool {
    task_context_snapshot().is_some()
}

fn task_context_snapshot() -> Option<LogContext> {
    let task_id = current_task_id()?;
    let store = TASK_LOG_CONTEXTS.get()?;
    let contexts = store.lock().ok()?;
    contexts.get(&task_id).cloned()
}

fn context_prefix_for(ctx: &LogContext) -> String {
    let mut parts = Vec::new();

    if let Some(ref request) = ctx.request {
        parts.push(format!("req:{}", request));
    }
    if let Some(ref endpoint) = ctx.endpoint {
        // Host and port are enough to tell endpoints apart
        let short = endpoint
            .split("://")
            .nth(1)
            .unwrap_or(endpoint)
            .trim_end_matches('/');
        parts.push(format!("ep:{}", short));
    }

    if parts.is_empty() {
        String::new()
    } else {
        format!("[{}] ", parts.join("|"))
    }
}

fn log_dir() -> Option<PathBuf> {
    crate::storage::app_dir().ok().map(|d| d.join("logs"))
}

pub struct Logger {
    file: File,
}

impl Logger {
    fn new() -> Option<Self> {
        let log_dir = log_dir()?;
        fs::create_dir_all(&log_dir).ok()?;

        let date = Local::now().format("%Y-%m-%d");
        let path = log_dir.join(format!("docrelay-{}.log", date));

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .ok()?;

        Some(Self { file })
    }

    fn write(&mut self, level: &str, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let ctx = context_prefix();
        let line = format!("[{}] [{}] {}{}\n", timestamp, level, ctx, message);
        let _ = self.file.write_all(line.as_bytes());
        let _ = self.file.flush();
    }
}

/// Initialize the logger (call once at startup)
pub fn init() {
    if let Ok(mut guard) = LOGGER.lock() {
        if guard.is_none() {
            *guard = Logger::new();
        }
    }
}

fn write(level: &str, message: &str) {
    if let Ok(mut guard) = LOGGER.lock() {
        if let Some(logger) = guard.as_mut() {
            logger.write(level, message);
        }
    }
}

/// Log an info message
pub fn info(message: &str) {
    write("INFO", message);
}

/// Log an error message
pub fn error(message: &str) {
    write("ERROR", message);
}

/// Log a warning message
pub fn warn(message: &str) {
    write("WARN", message);
}

/// Turn on debug and wire logging (same as setting DOCRELAY_TRACE)
pub fn set_trace(enabled: bool) {
    TRACE.store(enabled, Ordering::Relaxed);
}

pub fn trace_enabled() -> bool {
    TRACE.load(Ordering::Relaxed) || std::env::var("DOCRELAY_TRACE").is_ok()
}

/// Log a debug message (only when tracing)
pub fn debug(message: &str) {
    if trace_enabled() {
        write("DEBUG", message);
    }
}

/// Log a raw wire payload, truncated
pub fn wire(direction: &str, payload: &str) {
    if trace_enabled() {
        write("WIRE", &format!("{} {}", direction, truncate(payload, 300)));
    }
}

/// Get path to today's log file
pub fn log_path() -> Option<PathBuf> {
    let date = Local::now().format("%Y-%m-%d");
    Some(log_dir()?.join(format!("docrelay-{}.log", date)))
}

/// Clean up old logs (keep last 7 days)
pub fn cleanup_old_logs() {
    if let Some(log_dir) = log_dir() {
        if let Ok(entries) = fs::read_dir(&log_dir) {
            let cutoff = Local::now() - chrono::Duration::days(7);
            for entry in entries.flatten() {
                if let Ok(metadata) = entry.metadata() {
                    if let Ok(modified) = metadata.modified() {
                        let modified: chrono::DateTime<Local> = modified.into();
                        if modified < cutoff {
                            let _ = fs::remove_file(entry.path());
                        }
                    }
                }
            }
        }
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() > max_len {
        let mut end = max_len;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    } else {
        s.to_string()
    }
}
