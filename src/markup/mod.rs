//! Markup — inline tool-call tags in agent output.
//!
//! Submodules:
//! - `vocabulary`: The closed set of tag names treated as markup
//! - `parser`: Incremental parser from text buffer to segments + tag nodes
//! - `pairing`: Call/result pairing and the retained paired view
//! - `types`: Tag nodes, segments, parse results

pub mod pairing;
pub mod parser;
pub mod types;
pub mod vocabulary;

// Re-exports for convenience
pub use pairing::{pair_nodes, PairingEngine, ToolCallEntry};
pub use parser::{parse_tags, parse_tags_with, ScanMode, TagStreamParser};
pub use types::{Attributes, ParseContext, ParseResult, Segment, Side, TagNode, ToolStatus};
pub use vocabulary::ToolTag;
