//! Document sink boundary
//!
//! The host editor is reached only through [`DocumentSink`]. Writes go
//! through a [`WriteContext`], which resolves the active document once and
//! releases it when dropped, whatever path the caller leaves by.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};

use crate::error::{RelayError, Result};
use crate::logging;
use crate::markdown::{EditOp, TextStyle};

/// Opaque reference to a resolved document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentHandle {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStyle {
    Run(TextStyle),
    Heading(u8),
}

impl InsertStyle {
    pub const PLAIN: InsertStyle = InsertStyle::Run(TextStyle::PLAIN);
}

/// What the pipeline needs from a host editor
pub trait DocumentSink: Send {
    /// The document writes should go to; [`RelayError::NoDocument`] if none is open
    fn resolve_active_document(&mut self) -> Result<DocumentHandle>;

    fn insert_at_end(&mut self, doc: &DocumentHandle, text: &str, style: InsertStyle)
    -> Result<()>;

    /// Insert a table. Hosts without tables get tab-separated lines.
    fn insert_table(&mut self, doc: &DocumentHandle, rows: &[Vec<String>]) -> Result<()> {
        for row in rows {
            let line = format!("{}\n", row.join("\t"));
            self.insert_at_end(doc, &line, InsertStyle::PLAIN)?;
        }
        Ok(())
    }

    /// Give back whatever resolving the document acquired
    fn release(&mut self, _doc: DocumentHandle) {}
}

/// Scoped write access to the active document.
///
/// Holds the resolved handle and the insertion position (characters written
/// so far). The handle is released exactly once, on drop.
pub struct WriteContext<'a> {
    sink: &'a mut dyn DocumentSink,
    handle: Option<DocumentHandle>,
    position: usize,
}

impl<'a> WriteContext<'a> {
    pub fn acquire(sink: &'a mut dyn DocumentSink) -> Result<Self> {
        let handle = sink.resolve_active_document()?;
        logging::debug(&format!("Acquired document '{}'", handle.name));
        Ok(Self {
            sink,
            handle: Some(handle),
            position: 0,
        })
    }

    /// Characters written through this context
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn document(&self) -> Option<&DocumentHandle> {
        self.handle.as_ref()
    }

    pub fn write(&mut self, text: &str, style: TextStyle) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        let doc = self.handle.as_ref().ok_or(RelayError::NoDocument)?;
        self.sink.insert_at_end(doc, text, InsertStyle::Run(style))?;
        self.position += text.chars().count();
        Ok(())
    }

    pub fn write_heading(&mut self, level: u8, text: &str) -> Result<()> {
        let doc = self.handle.as_ref().ok_or(RelayError::NoDocument)?;
        let line = format!("{}\n", text);
        self.sink.insert_at_end(doc, &line, InsertStyle::Heading(level))?;
        self.position += line.chars().count();
        Ok(())
    }

    pub fn write_table(&mut self, rows: &[Vec<String>]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let doc = self.handle.as_ref().ok_or(RelayError::NoDocument)?;
        self.sink.insert_table(doc, rows)?;
        self.position += EditOp::Table {
            rows: rows.to_vec(),
        }
        .char_len();
        Ok(())
    }

    /// Apply one edit operation in a single write
    pub fn apply(&mut self, op: &EditOp) -> Result<()> {
        match op {
            EditOp::Text(run) => self.write(&run.text, run.style),
            EditOp::Heading { level, text } => self.write_heading(*level, text),
            EditOp::Table { rows } => self.write_table(rows),
        }
    }
}

impl Drop for WriteContext<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            logging::debug(&format!(
                "Releasing document '{}' after {} chars",
                handle.name, self.position
            ));
            self.sink.release(handle);
        }
    }
}

/// Append `text` verbatim to the active document
pub fn write_once(sink: &mut dyn DocumentSink, text: &str) -> Result<usize> {
    let mut ctx = WriteContext::acquire(sink)?;
    ctx.write(text, TextStyle::PLAIN)?;
    Ok(ctx.position())
}

enum Target {
    Stdout,
    File(PathBuf),
}

/// Plain-text document: a file, or the terminal.
///
/// Styles become ANSI escapes when writing to a terminal and are dropped
/// otherwise.
pub struct TextDocument {
    target: Target,
    ansi: bool,
    writer: Option<Box<dyn Write + Send>>,
    opened: u64,
}

impl TextDocument {
    pub fn stdout() -> Self {
        Self {
            target: Target::Stdout,
            ansi: std::io::stdout().is_terminal(),
            writer: None,
            opened: 0,
        }
    }

    /// Append to `path`, creating it if needed
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            target: Target::File(path.into()),
            ansi: false,
            writer: None,
            opened: 0,
        }
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    fn name(&self) -> String {
        match &self.target {
            Target::Stdout => "<stdout>".to_string(),
            Target::File(path) => path.display().to_string(),
        }
    }

    fn emit(&mut self, text: &str) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(RelayError::NoDocument)?;
        writer
            .write_all(text.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| RelayError::Sink(e.to_string()))
    }
}

fn sgr(style: TextStyle) -> String {
    let mut codes = Vec::new();
    if style.bold {
        codes.push("1");
    }
    if style.italic {
        codes.push("3");
    }
    if style.underline {
        codes.push("4");
    }
    format!("\x1b[{}m", codes.join(";"))
}

impl DocumentSink for TextDocument {
    fn resolve_active_document(&mut self) -> Result<DocumentHandle> {
        if self.writer.is_none() {
            let writer: Box<dyn Write + Send> = match &self.target {
                Target::Stdout => Box::new(std::io::stdout()),
                Target::File(path) => {
                    let file = open_append(path).map_err(|e| {
                        logging::error(&format!("Cannot open {}: {}", path.display(), e));
                        RelayError::NoDocument
                    })?;
                    Box::new(BufWriter::new(file))
                }
            };
            self.writer = Some(writer);
        }
        self.opened += 1;
        Ok(DocumentHandle {
            id: self.opened,
            name: self.name(),
        })
    }

    fn insert_at_end(
        &mut self,
        _doc: &DocumentHandle,
        text: &str,
        style: InsertStyle,
    ) -> Result<()> {
        let styled = match style {
            InsertStyle::Run(run) if self.ansi && !run.is_plain() => {
                // Keep the newline outside the escape so line-based terminals reset cleanly
                let (body, newline) = match text.strip_suffix('\n') {
                    Some(body) => (body, "\n"),
                    None => (text, ""),
                };
                format!("{}{}\x1b[0m{}", sgr(run), body, newline)
            }
            InsertStyle::Heading(_) if self.ansi => {
                let body = text.trim_end_matches('\n');
                format!("\x1b[1;4m{}\x1b[0m\n", body)
            }
            _ => text.to_string(),
        };
        self.emit(&styled)
    }

    fn insert_table(&mut self, _doc: &DocumentHandle, rows: &[Vec<String>]) -> Result<()> {
        let mut out = String::new();
        for row in rows {
            out.push_str("| ");
            out.push_str(&row.join(" | "));
            out.push_str(" |\n");
        }
        self.emit(&out)
    }

    fn release(&mut self, _doc: DocumentHandle) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                logging::warn(&format!("Flush of {} failed: {}", self.name(), e));
            }
        }
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// One entry of a file-type filter, e.g. "Source code" = c, cpp, cc
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFilter {
    pub name: String,
    pub extensions: Vec<String>,
}

impl FileFilter {
    pub fn new(name: &str, extensions: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(ext)))
    }
}

pub fn default_filters() -> Vec<FileFilter> {
    vec![
        FileFilter::new("Source code", &["c", "cpp", "cc"]),
        FileFilter::new("Headers", &["h", "hpp"]),
    ]
}

/// Host file-selection boundary
pub trait FilePicker {
    /// Selected paths; [`RelayError::Cancelled`] when the user picked nothing
    fn pick_files(&mut self, filters: &[FileFilter]) -> Result<Vec<PathBuf>>;
}

/// Non-interactive picker: expands glob patterns and keeps files any
/// filter accepts. An empty filter list accepts every file.
#[derive(Debug, Clone, Default)]
pub struct GlobFilePicker {
    patterns: Vec<String>,
}

impl GlobFilePicker {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }
}

impl FilePicker for GlobFilePicker {
    fn pick_files(&mut self, filters: &[FileFilter]) -> Result<Vec<PathBuf>> {
        if self.patterns.is_empty() {
            return Err(RelayError::Cancelled);
        }

        let mut picked = Vec::new();
        for pattern in &self.patterns {
            let paths = glob::glob(pattern)
                .map_err(|e| RelayError::Picker(format!("bad pattern '{}': {}", pattern, e)))?;
            for path in paths.flatten() {
                if !path.is_file() {
                    continue;
                }
                if filters.is_empty() || filters.iter().any(|f| f.matches(&path)) {
                    picked.push(path);
                }
            }
        }

        picked.sort();
        picked.dedup();
        if picked.is_empty() {
            return Err(RelayError::Picker(format!(
                "no files matched {}",
                self.patterns.join(", ")
            )));
        }
        Ok(picked)
    }
}
