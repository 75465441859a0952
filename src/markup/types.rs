//! Shared types for the markup parser and the pairing engine.

use std::collections::BTreeMap;
use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::vocabulary::ToolTag;

// ─── Attributes ─────────────────────────────────────────────────────────────

/// Ordered `key="value"` attributes of a tag, in source order.
///
/// Equality for pairing purposes is map equality (see [`Attributes::same_as`]),
/// not sequence equality: `a="1" b="2"` matches `b="2" a="1"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value. A repeated key keeps its first position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Key-for-key equality, ignoring order.
    pub fn same_as(&self, other: &Attributes) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attrs = Attributes::new();
        for (k, v) in iter {
            attrs.insert(k, v);
        }
        attrs
    }
}

// ─── Tag Nodes ──────────────────────────────────────────────────────────────

/// Which logical output a tag node was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Agent output: the tool invocation.
    Call,
    /// Tool-result output.
    Result,
}

/// Execution status of a call-side node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Running,
    Completed,
}

/// One inline tool call or tool result extracted from streamed text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagNode {
    /// Stable identity: `{source}:{byte offset of the opening tag}`.
    pub id: String,
    pub tag: ToolTag,
    pub attributes: Attributes,
    /// Inner text. Empty while the node is open, final once closed.
    pub content: String,
    pub is_closed: bool,
    pub side: Side,
    /// Id of the node on the other side this one was paired with.
    pub paired_with: Option<String>,
    pub status: ToolStatus,
    pub timestamp: DateTime<Utc>,
    /// Byte range of the raw markup in the source buffer. Covers the opening
    /// tag through the closing tag once closed, only the opening tag while open.
    pub span: Range<usize>,
    /// Byte offset where the inner text begins.
    pub content_start: usize,
}

impl TagNode {
    pub fn tag_name(&self) -> &'static str {
        self.tag.as_str()
    }
}

// ─── Parse Output ───────────────────────────────────────────────────────────

/// One element of the parser's ordered output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text { text: String },
    Tag { node: TagNode },
}

impl Segment {
    pub fn as_tag(&self) -> Option<&TagNode> {
        match self {
            Segment::Tag { node } => Some(node),
            Segment::Text { .. } => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Segment::Text { text } => Some(text),
            Segment::Tag { .. } => None,
        }
    }
}

/// Where the parsed buffer came from; stamped onto every node it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseContext {
    /// Identity prefix for node ids (a message id or `stream:{run_id}`).
    pub source: String,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
}

impl ParseContext {
    pub fn new(source: impl Into<String>, side: Side, timestamp: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            side,
            timestamp,
        }
    }

    /// Context for ad-hoc parsing: call side, epoch timestamp, source `buffer`.
    pub fn anonymous() -> Self {
        Self::new("buffer", Side::Call, DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// Ordered segments plus the currently open nodes, keyed by tag.
///
/// The open map holds at most one node per tag: when two same-named tags are
/// open at once, the most recently opened one wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseResult {
    pub segments: Vec<Segment>,
    pub open: BTreeMap<ToolTag, TagNode>,
}

impl ParseResult {
    /// All tag nodes in output order, open and closed.
    pub fn nodes(&self) -> impl Iterator<Item = &TagNode> {
        self.segments.iter().filter_map(Segment::as_tag)
    }

    pub fn closed_nodes(&self) -> impl Iterator<Item = &TagNode> {
        self.nodes().filter(|n| n.is_closed)
    }

    /// Concatenated plain text, tags removed.
    pub fn plain_text(&self) -> String {
        self.segments.iter().filter_map(Segment::as_text).collect()
    }

    /// Text streamed so far inside the open `tag`, read from `buffer`.
    pub fn partial_content<'a>(&self, tag: ToolTag, buffer: &'a str) -> Option<&'a str> {
        let node = self.open.get(&tag)?;
        buffer.get(node.content_start..)
    }
}
