//! Incremental markdown → document edit operations
//!
//! Text arrives in arbitrary chunks. Anything that cannot be classified yet
//! (a `*` at the end of a chunk, a `#` or `|` line without its newline) stays
//! in the pending buffer and is re-scanned with the next chunk, so the
//! emitted operations never depend on where the chunk boundaries fell.

use regex::Regex;
use std::sync::LazyLock;

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+)$").expect("valid heading regex"));
static TABLE_SEPARATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\s|:-]+$").expect("valid separator regex"));

/// Inline formatting of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TextStyle {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
}

impl TextStyle {
    pub const PLAIN: TextStyle = TextStyle {
        bold: false,
        italic: false,
        underline: false,
    };

    pub const BOLD: TextStyle = TextStyle {
        bold: true,
        italic: false,
        underline: false,
    };

    pub fn is_plain(&self) -> bool {
        *self == Self::PLAIN
    }
}

/// Contiguous text sharing one style
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyledRun {
    pub text: String,
    pub style: TextStyle,
}

impl StyledRun {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            style: TextStyle::PLAIN,
        }
    }

    pub fn styled(text: impl Into<String>, style: TextStyle) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }
}

/// One operation against the document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp {
    Text(StyledRun),
    Heading { level: u8, text: String },
    Table { rows: Vec<Vec<String>> },
}

impl EditOp {
    /// Characters this operation puts into the document
    pub fn char_len(&self) -> usize {
        match self {
            EditOp::Text(run) => run.text.chars().count(),
            EditOp::Heading { text, .. } => text.chars().count() + 1,
            EditOp::Table { rows } => rows
                .iter()
                .map(|row| row.iter().map(|c| c.chars().count()).sum::<usize>() + row.len())
                .sum(),
        }
    }
}

/// Formatting state carried between chunks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParserState {
    pub is_bold: bool,
    pub is_italic: bool,
    pub is_underline: bool,
    pub is_table_mode: bool,
    /// Raw text not yet classified
    pub pending_buffer: String,
    /// Raw table rows waiting for the end of the table block
    pub table_row_buffer: Vec<String>,
}

impl ParserState {
    fn style(&self) -> TextStyle {
        TextStyle {
            bold: self.is_bold,
            italic: self.is_italic,
            underline: self.is_underline,
        }
    }
}

enum Step {
    /// Progress was made; keep scanning
    Continue,
    /// Need more input (or the buffer is exhausted)
    Wait,
}

#[derive(Clone, Copy)]
enum Marker {
    Bold,
    Italic,
    Underline,
}

/// Streaming parser. One instance per streamed reply.
#[derive(Debug, Clone)]
pub struct MarkdownStreamParser {
    state: ParserState,
    /// Classified text of the current run, not yet emitted
    run: String,
    at_line_start: bool,
}

impl Default for MarkdownStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkdownStreamParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::default(),
            run: String::new(),
            at_line_start: true,
        }
    }

    /// Parse a complete text in one pass
    pub fn parse_all(text: &str) -> Vec<EditOp> {
        let mut parser = Self::new();
        let mut ops = parser.push(text);
        ops.extend(parser.finish());
        ops
    }

    pub fn state(&self) -> &ParserState {
        &self.state
    }

    /// Forget everything, ready for a new stream
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Feed one chunk; returns the operations it completed.
    ///
    /// Text is only released at a style toggle, a newline or [`finish`].
    /// A long paragraph streamed without either stays buffered until the
    /// end of the stream, which keeps the output the same for any chunking.
    ///
    /// [`finish`]: Self::finish
    pub fn push(&mut self, chunk: &str) -> Vec<EditOp> {
        let mut out = Vec::new();
        self.state.pending_buffer.push_str(chunk);
        self.scan(&mut out, false);
        out
    }

    /// End of stream: resolve held tokens, close an open table, emit the
    /// unfinished run as plain text, and reset.
    pub fn finish(&mut self) -> Vec<EditOp> {
        let mut out = Vec::new();
        self.scan(&mut out, true);
        self.close_table(&mut out);

        let mut leftover = std::mem::take(&mut self.run);
        leftover.push_str(&self.state.pending_buffer);
        if !leftover.is_empty() {
            out.push(EditOp::Text(StyledRun::plain(leftover)));
        }

        self.reset();
        out
    }

    fn scan(&mut self, out: &mut Vec<EditOp>, at_end: bool) {
        let buf = std::mem::take(&mut self.state.pending_buffer);
        let mut pos = 0;

        while pos < buf.len() {
            let step = if self.at_line_start {
                self.scan_line_start(&buf, &mut pos, out, at_end)
            } else {
                self.scan_inline(&buf, &mut pos, out, at_end)
            };
            if let Step::Wait = step {
                break;
            }
        }

        self.state.pending_buffer = buf[pos..].to_string();
    }

    fn scan_line_start(
        &mut self,
        buf: &str,
        pos: &mut usize,
        out: &mut Vec<EditOp>,
        at_end: bool,
    ) -> Step {
        let rest = &buf[*pos..];
        let Some(first) = rest.chars().next() else {
            return Step::Wait;
        };

        if first != '#' && first != '|' {
            self.close_table(out);
            self.at_line_start = false;
            return Step::Continue;
        }

        // Headings and table rows are classified on the whole line
        let (line, consumed) = match rest.find('\n') {
            Some(end) => (&rest[..end], end + 1),
            None if at_end => (rest, rest.len()),
            None => return Step::Wait,
        };
        let line = line.trim_end_matches('\r');

        if first == '|' {
            self.push_table_row(line);
            *pos += consumed;
            return Step::Continue;
        }

        self.close_table(out);
        if let Some((level, text)) = parse_heading(line) {
            out.push(EditOp::Heading { level, text });
            *pos += consumed;
        } else {
            // `#tag` and friends are ordinary text
            self.at_line_start = false;
        }
        Step::Continue
    }

    fn scan_inline(
        &mut self,
        buf: &str,
        pos: &mut usize,
        out: &mut Vec<EditOp>,
        at_end: bool,
    ) -> Step {
        while let Some(c) = buf[*pos..].chars().next() {
            let next = buf[*pos + c.len_utf8()..].chars().next();
            match c {
                '\n' => {
                    self.run.push('\n');
                    *pos += 1;
                    self.emit_run(out);
                    self.at_line_start = true;
                    return Step::Continue;
                }
                '*' => match next {
                    Some('*') => {
                        self.toggle(Marker::Bold, out);
                        *pos += 2;
                    }
                    Some(_) => {
                        self.toggle(Marker::Italic, out);
                        *pos += 1;
                    }
                    None if at_end => {
                        self.toggle(Marker::Italic, out);
                        *pos += 1;
                    }
                    None => return Step::Wait,
                },
                '_' => match next {
                    Some('_') => {
                        self.toggle(Marker::Underline, out);
                        *pos += 2;
                    }
                    None if !at_end => return Step::Wait,
                    _ => {
                        self.run.push('_');
                        *pos += 1;
                    }
                },
                _ => {
                    self.run.push(c);
                    *pos += c.len_utf8();
                }
            }
        }
        Step::Wait
    }

    fn toggle(&mut self, marker: Marker, out: &mut Vec<EditOp>) {
        self.emit_run(out);
        let flag = match marker {
            Marker::Bold => &mut self.state.is_bold,
            Marker::Italic => &mut self.state.is_italic,
            Marker::Underline => &mut self.state.is_underline,
        };
        *flag = !*flag;
    }

    fn emit_run(&mut self, out: &mut Vec<EditOp>) {
        if self.run.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.run);
        out.push(EditOp::Text(StyledRun::styled(text, self.state.style())));
    }

    fn push_table_row(&mut self, line: &str) {
        self.state.is_table_mode = true;
        let trimmed = line.trim();
        if trimmed.contains('-') && TABLE_SEPARATOR_RE.is_match(trimmed) {
            return;
        }
        self.state.table_row_buffer.push(trimmed.to_string());
    }

    fn close_table(&mut self, out: &mut Vec<EditOp>) {
        if !self.state.is_table_mode {
            return;
        }
        self.state.is_table_mode = false;
        let rows: Vec<Vec<String>> = std::mem::take(&mut self.state.table_row_buffer)
            .iter()
            .map(|row| split_cells(row))
            .collect();
        if !rows.is_empty() {
            out.push(EditOp::Table { rows });
        }
    }
}

fn parse_heading(line: &str) -> Option<(u8, String)> {
    let caps = HEADING_RE.captures(line)?;
    let level = caps.get(1)?.as_str().len() as u8;
    let text = strip_inline_markers(caps.get(2)?.as_str().trim());
    Some((level, text))
}

fn split_cells(row: &str) -> Vec<String> {
    let inner = row.trim();
    let inner = inner.strip_prefix('|').unwrap_or(inner);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner
        .split('|')
        .map(|cell| strip_inline_markers(cell.trim()))
        .collect()
}

/// Drop emphasis markers from text that is styled as a whole (headings, cells)
pub fn strip_inline_markers(text: &str) -> String {
    text.replace("**", "").replace("__", "").replace('*', "")
}
