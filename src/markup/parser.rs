//! Tag stream parser — turns the agent's growing output buffer into text
//! segments and tag nodes.
//!
//! The parser is handed the whole buffer accumulated so far on every update,
//! never a delta: the transport may deliver overlapping or duplicated chunks,
//! so only the caller knows what the buffer really is. Internally the parser
//! keeps its committed output, the open-tag stack, and two offsets:
//!
//! - `scan_from`: end of the last committed tag match. Everything before it
//!   is final unless a later closing tag splices it into a node's content.
//! - `probe_from`: first `<` whose meaning is still undecided because the
//!   buffer ends inside it (`<execute-comm`, or an attribute list with no
//!   `>` yet). Scanning stops there and resumes there.
//!
//! When the new buffer extends the old one, only `probe_from..` is scanned.
//! When it does not (the buffer was replaced, reordered or truncated), the
//! parser falls back to a full rescan. Both paths run the same scan loop, so
//! their output is identical.

use std::collections::BTreeMap;

use super::types::{Attributes, ParseContext, ParseResult, Segment, TagNode, ToolStatus};
use super::vocabulary::{is_tag_name_char, ToolTag};

// ─── Public API ─────────────────────────────────────────────────────────────

/// Parse a complete buffer in one shot with an anonymous context.
pub fn parse_tags(buffer: &str) -> ParseResult {
    parse_tags_with(buffer, ParseContext::anonymous())
}

/// Parse a complete buffer, stamping nodes with `ctx`.
///
/// The buffer is treated as final: see [`TagStreamParser::finish`].
pub fn parse_tags_with(buffer: &str, ctx: ParseContext) -> ParseResult {
    let mut parser = TagStreamParser::new(ctx);
    parser.update(buffer);
    parser.finish();
    parser.result()
}

/// How an [`TagStreamParser::update`] call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// The buffer did not change.
    Unchanged,
    /// The buffer grew; only the new suffix was scanned.
    Incremental,
    /// The buffer was not an extension of the previous one.
    FullRescan,
}

/// Incremental parser over one agent turn's output buffer.
#[derive(Debug, Clone)]
pub struct TagStreamParser {
    ctx: ParseContext,
    buffer: String,
    /// Output up to `scan_from`.
    committed: Vec<Segment>,
    /// Indices into `committed` of nodes that are still open, oldest first.
    stack: Vec<usize>,
    scan_from: usize,
    probe_from: usize,
}

impl TagStreamParser {
    pub fn new(ctx: ParseContext) -> Self {
        Self {
            ctx,
            buffer: String::new(),
            committed: Vec::new(),
            stack: Vec::new(),
            scan_from: 0,
            probe_from: 0,
        }
    }

    /// The buffer as of the last update.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn context(&self) -> &ParseContext {
        &self.ctx
    }

    /// Replace the context used for nodes created from now on and rescan.
    pub fn set_context(&mut self, ctx: ParseContext) {
        self.ctx = ctx;
        let buffer = std::mem::take(&mut self.buffer);
        self.reset();
        self.buffer = buffer;
        self.scan();
    }

    /// Drop all state and start a new, empty buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.committed.clear();
        self.stack.clear();
        self.scan_from = 0;
        self.probe_from = 0;
    }

    /// Bring the parser up to date with the full buffer `text`.
    pub fn update(&mut self, text: &str) -> ScanMode {
        if text.len() == self.buffer.len() && text == self.buffer {
            return ScanMode::Unchanged;
        }
        let old_len = self.buffer.len();
        let mode = if text.starts_with(self.buffer.as_str()) {
            self.buffer.push_str(&text[old_len..]);
            ScanMode::Incremental
        } else {
            tracing::debug!(
                old_len,
                new_len = text.len(),
                "buffer is not an extension, rescanning"
            );
            self.reset();
            self.buffer.push_str(text);
            ScanMode::FullRescan
        };
        self.scan();
        mode
    }

    /// Append a chunk to the buffer and scan it.
    pub fn push_str(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.buffer.push_str(chunk);
        self.scan();
    }

    /// Declare the buffer complete and settle every undecided `<`.
    ///
    /// An opening tag whose attribute list has an unbalanced `"` ends at the
    /// first `>` after its name, dropping the malformed attributes. Anything
    /// else still undecided is plain text. Appending after `finish` is
    /// allowed but no longer guaranteed to match a full rescan.
    pub fn finish(&mut self) {
        self.scan_with(true);
    }

    /// Snapshot of the current output: committed segments, the uncommitted
    /// tail as text, and the open-node map.
    pub fn result(&self) -> ParseResult {
        let mut segments = self.committed.clone();
        if self.scan_from < self.buffer.len() {
            segments.push(Segment::Text {
                text: self.buffer[self.scan_from..].to_string(),
            });
        }

        let mut open = BTreeMap::new();
        for &idx in &self.stack {
            if let Some(node) = self.committed[idx].as_tag() {
                open.insert(node.tag, node.clone());
            }
        }

        ParseResult { segments, open }
    }

    // ─── Scan Loop ──────────────────────────────────────────────────────

    fn scan(&mut self) {
        self.scan_with(false);
    }

    fn scan_with(&mut self, final_buffer: bool) {
        let mut pos = self.probe_from;

        while let Some(rel) = self.buffer[pos..].find('<') {
            let at = pos + rel;
            let matched = match match_tag_at(&self.buffer, at) {
                TagMatch::Incomplete if final_buffer => match_open_lenient(&self.buffer, at),
                other => other,
            };
            match matched {
                TagMatch::Open {
                    tag,
                    attributes,
                    end,
                    self_closing,
                } => {
                    self.flush_text(at);
                    self.open_node(tag, attributes, at, end, self_closing);
                    self.scan_from = end;
                    pos = end;
                }
                TagMatch::Close { tag, end } => {
                    self.flush_text(at);
                    self.close_node(tag, at, end);
                    self.scan_from = end;
                    pos = end;
                }
                TagMatch::NoMatch => pos = at + 1,
                TagMatch::Incomplete => {
                    self.probe_from = at;
                    return;
                }
            }
        }

        self.probe_from = self.buffer.len();
    }

    fn flush_text(&mut self, until: usize) {
        if until > self.scan_from {
            self.committed.push(Segment::Text {
                text: self.buffer[self.scan_from..until].to_string(),
            });
        }
    }

    fn open_node(
        &mut self,
        tag: ToolTag,
        attributes: Attributes,
        start: usize,
        end: usize,
        self_closing: bool,
    ) {
        let node = TagNode {
            id: format!("{}:{start}", self.ctx.source),
            tag,
            attributes,
            content: String::new(),
            is_closed: self_closing,
            side: self.ctx.side,
            paired_with: None,
            status: ToolStatus::Running,
            timestamp: self.ctx.timestamp,
            span: start..end,
            content_start: end,
        };
        self.committed.push(Segment::Tag { node });
        if !self_closing {
            self.stack.push(self.committed.len() - 1);
        }
    }

    fn close_node(&mut self, tag: ToolTag, start: usize, end: usize) {
        let found = self.stack.iter().rposition(|&idx| {
            self.committed[idx]
                .as_tag()
                .is_some_and(|node| node.tag == tag)
        });

        let Some(stack_pos) = found else {
            self.committed.push(Segment::Text {
                text: self.buffer[start..end].to_string(),
            });
            return;
        };

        let seg_idx = self.stack[stack_pos];
        // Anything opened after the match now lives inside its content.
        self.stack.truncate(stack_pos);
        self.committed.truncate(seg_idx + 1);

        if let Some(Segment::Tag { node }) = self.committed.last_mut() {
            node.content = trim_one_newline(&self.buffer[node.content_start..start]).to_string();
            node.is_closed = true;
            node.span.end = end;
        }
    }
}

// ─── Tag Matching ───────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum TagMatch {
    Open {
        tag: ToolTag,
        attributes: Attributes,
        end: usize,
        self_closing: bool,
    },
    Close {
        tag: ToolTag,
        end: usize,
    },
    /// Definitely not vocabulary markup, whatever follows.
    NoMatch,
    /// The buffer ends before the tag could be decided.
    Incomplete,
}

/// Decide what the `<` at byte offset `at` starts.
fn match_tag_at(buffer: &str, at: usize) -> TagMatch {
    let rest = &buffer[at + 1..];
    match rest.strip_prefix('/') {
        Some(after_slash) => match_close(after_slash, at + 2),
        None => match_open(rest, at + 1),
    }
}

/// `text` starts right after `</`; `base` is its offset in the buffer.
fn match_close(text: &str, base: usize) -> TagMatch {
    let name_len = text.find(|c: char| !is_tag_name_char(c)).unwrap_or(text.len());
    if name_len == text.len() {
        return TagMatch::Incomplete;
    }
    let Some(tag) = ToolTag::from_name(&text[..name_len]) else {
        return TagMatch::NoMatch;
    };

    let after_name = &text[name_len..];
    let trimmed = after_name.trim_start();
    if trimmed.is_empty() {
        return TagMatch::Incomplete;
    }
    if !trimmed.starts_with('>') {
        return TagMatch::NoMatch;
    }
    let gt = name_len + (after_name.len() - trimmed.len());
    TagMatch::Close {
        tag,
        end: base + gt + 1,
    }
}

/// `text` starts right after `<`; `base` is its offset in the buffer.
fn match_open(text: &str, base: usize) -> TagMatch {
    let name_len = text.find(|c: char| !is_tag_name_char(c)).unwrap_or(text.len());
    if name_len == text.len() {
        return TagMatch::Incomplete;
    }
    let Some(tag) = ToolTag::from_name(&text[..name_len]) else {
        return TagMatch::NoMatch;
    };

    let after_name = &text[name_len..];
    let first = after_name.chars().next().unwrap_or('>');
    if first == '>' {
        return TagMatch::Open {
            tag,
            attributes: Attributes::new(),
            end: base + name_len + 1,
            self_closing: false,
        };
    }
    if first != '/' && !first.is_whitespace() {
        return TagMatch::NoMatch;
    }

    let Some(gt) = find_unquoted_gt(after_name) else {
        return TagMatch::Incomplete;
    };
    open_match(tag, after_name, gt, base + name_len)
}

/// Settle an undecided `<` at `at` in a buffer that will not grow: an
/// opening tag ends at the first `>` regardless of quotes, anything else is
/// text.
fn match_open_lenient(buffer: &str, at: usize) -> TagMatch {
    let text = &buffer[at + 1..];
    let name_len = text.find(|c: char| !is_tag_name_char(c)).unwrap_or(text.len());
    let Some(tag) = ToolTag::from_name(&text[..name_len]) else {
        return TagMatch::NoMatch;
    };
    let after_name = &text[name_len..];
    if !after_name.starts_with(|c: char| c == '/' || c.is_whitespace()) {
        return TagMatch::NoMatch;
    }
    match after_name.find('>') {
        Some(gt) => open_match(tag, after_name, gt, at + 1 + name_len),
        None => TagMatch::NoMatch,
    }
}

/// Build the open match for attribute text `after_name[..gt]`, where
/// `after_name` starts at buffer offset `base`.
fn open_match(tag: ToolTag, after_name: &str, gt: usize, base: usize) -> TagMatch {
    let inner = &after_name[..gt];
    let (inner, self_closing) = match inner.trim_end().strip_suffix('/') {
        Some(stripped) => (stripped, true),
        None => (inner, false),
    };

    TagMatch::Open {
        tag,
        attributes: parse_attributes(inner),
        end: base + gt + 1,
        self_closing,
    }
}

/// Offset of the first `>` outside double quotes.
fn find_unquoted_gt(text: &str) -> Option<usize> {
    let mut in_quotes = false;
    for (i, c) in text.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '>' if !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

/// Parse `key="value"` pairs. Tokens of any other shape are dropped.
fn parse_attributes(raw: &str) -> Attributes {
    let mut attrs = Attributes::new();
    for token in split_unquoted_whitespace(raw) {
        let Some((key, quoted)) = token.split_once('=') else {
            continue;
        };
        let valid_key = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ':');
        if !valid_key || quoted.len() < 2 || !quoted.starts_with('"') || !quoted.ends_with('"') {
            continue;
        }
        let value = &quoted[1..quoted.len() - 1];
        if value.contains('"') {
            continue;
        }
        attrs.insert(key, value);
    }
    attrs
}

/// Split on whitespace that is not inside double quotes.
fn split_unquoted_whitespace(raw: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut in_quotes = false;
    let mut start: Option<usize> = None;

    for (i, c) in raw.char_indices() {
        if c == '"' {
            in_quotes = !in_quotes;
        }
        if c.is_whitespace() && !in_quotes {
            if let Some(s) = start.take() {
                tokens.push(&raw[s..i]);
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        tokens.push(&raw[s..]);
    }
    tokens
}

/// Strip at most one leading and one trailing newline (`\n` or `\r\n`).
fn trim_one_newline(text: &str) -> &str {
    let text = text
        .strip_prefix("\r\n")
        .or_else(|| text.strip_prefix('\n'))
        .unwrap_or(text);
    text.strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(text)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
