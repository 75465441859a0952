//! Call/result pairing — matches tool invocations to their results.
//!
//! Nodes are grouped by tag. Inside a group, each call takes the first
//! result (in discovery order) that is not yet taken and whose attributes
//! equal the call's key-for-key. This is first-fit, not nearest-in-time:
//! interleaved same-named calls with identical attributes pair in discovery
//! order, which may not be the order they actually ran in.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use super::types::{Side, TagNode, ToolStatus};
use super::vocabulary::ToolTag;

// ─── ToolCallEntry ──────────────────────────────────────────────────────────

/// One row of the paired view handed to presentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolCallEntry {
    /// A call and its result.
    Paired { call: TagNode, result: TagNode },
    /// A call with no result yet.
    PendingCall { call: TagNode },
    /// A result whose call was never seen.
    OrphanResult { result: TagNode },
}

impl ToolCallEntry {
    pub fn tag(&self) -> ToolTag {
        match self {
            ToolCallEntry::Paired { call, .. } | ToolCallEntry::PendingCall { call } => call.tag,
            ToolCallEntry::OrphanResult { result } => result.tag,
        }
    }

    /// Id of the node that anchors this entry: the call, or the lone result.
    pub fn id(&self) -> &str {
        match self {
            ToolCallEntry::Paired { call, .. } | ToolCallEntry::PendingCall { call } => &call.id,
            ToolCallEntry::OrphanResult { result } => &result.id,
        }
    }

    pub fn status(&self) -> ToolStatus {
        match self {
            ToolCallEntry::PendingCall { .. } => ToolStatus::Running,
            ToolCallEntry::Paired { .. } | ToolCallEntry::OrphanResult { .. } => {
                ToolStatus::Completed
            }
        }
    }

    pub fn call(&self) -> Option<&TagNode> {
        match self {
            ToolCallEntry::Paired { call, .. } | ToolCallEntry::PendingCall { call } => Some(call),
            ToolCallEntry::OrphanResult { .. } => None,
        }
    }

    pub fn result(&self) -> Option<&TagNode> {
        match self {
            ToolCallEntry::Paired { result, .. } | ToolCallEntry::OrphanResult { result } => {
                Some(result)
            }
            ToolCallEntry::PendingCall { .. } => None,
        }
    }
}

// ─── Pairing ────────────────────────────────────────────────────────────────

/// Pair a set of nodes in one pass.
///
/// Nodes repeating an id already seen are skipped. Entries come out in the
/// discovery order of their anchoring node.
pub fn pair_nodes<'a, I>(nodes: I) -> Vec<ToolCallEntry>
where
    I: IntoIterator<Item = &'a TagNode>,
{
    let mut seen: HashSet<&str> = HashSet::new();
    let mut distinct: Vec<&TagNode> = Vec::new();
    for node in nodes {
        if seen.insert(node.id.as_str()) {
            distinct.push(node);
        }
    }

    // tag -> (call indices, result indices), both in discovery order
    let mut groups: BTreeMap<ToolTag, (Vec<usize>, Vec<usize>)> = BTreeMap::new();
    for (idx, node) in distinct.iter().enumerate() {
        let group = groups.entry(node.tag).or_default();
        match node.side {
            Side::Call => group.0.push(idx),
            Side::Result => group.1.push(idx),
        }
    }

    let mut keyed: Vec<(usize, ToolCallEntry)> = Vec::with_capacity(distinct.len());
    for (calls, results) in groups.values() {
        let mut taken = vec![false; results.len()];

        for &call_idx in calls {
            let call = distinct[call_idx];
            let hit = results.iter().enumerate().position(|(slot, &result_idx)| {
                !taken[slot] && distinct[result_idx].attributes.same_as(&call.attributes)
            });

            let entry = match hit {
                Some(slot) => {
                    taken[slot] = true;
                    let mut call = call.clone();
                    let mut result = distinct[results[slot]].clone();
                    call.status = ToolStatus::Completed;
                    call.paired_with = Some(result.id.clone());
                    result.status = ToolStatus::Completed;
                    result.paired_with = Some(call.id.clone());
                    ToolCallEntry::Paired { call, result }
                }
                None => {
                    let mut call = call.clone();
                    call.status = ToolStatus::Running;
                    call.paired_with = None;
                    ToolCallEntry::PendingCall { call }
                }
            };
            keyed.push((call_idx, entry));
        }

        for (slot, &result_idx) in results.iter().enumerate() {
            if !taken[slot] {
                let mut result = distinct[result_idx].clone();
                result.status = ToolStatus::Completed;
                result.paired_with = None;
                keyed.push((result_idx, ToolCallEntry::OrphanResult { result }));
            }
        }
    }

    keyed.sort_by_key(|(idx, _)| *idx);
    keyed.into_iter().map(|(_, entry)| entry).collect()
}

// ─── PairingEngine ──────────────────────────────────────────────────────────

/// Retained paired view across repeated passes.
///
/// Each pass merges its nodes into the known set by id: a node seen before is
/// updated in place (its content may have grown, it may have closed), a new
/// node is appended. The view is then recomputed, so an entry emitted by an
/// earlier pass is updated rather than emitted a second time.
#[derive(Debug, Default)]
pub struct PairingEngine {
    known: Vec<TagNode>,
    index: HashMap<String, usize>,
    entries: Vec<ToolCallEntry>,
}

impl PairingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `nodes` into the view and return the updated entries.
    pub fn ingest<'a, I>(&mut self, nodes: I) -> &[ToolCallEntry]
    where
        I: IntoIterator<Item = &'a TagNode>,
    {
        for node in nodes {
            match self.index.get(&node.id) {
                Some(&pos) => self.known[pos] = node.clone(),
                None => {
                    self.index.insert(node.id.clone(), self.known.len());
                    self.known.push(node.clone());
                }
            }
        }
        self.entries = pair_nodes(&self.known);
        &self.entries
    }

    pub fn entries(&self) -> &[ToolCallEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.known.clear();
        self.index.clear();
        self.entries.clear();
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
