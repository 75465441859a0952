//! The closed tag vocabulary the agent uses for inline tool calls.
//!
//! Anything outside this list is inert text to the parser: `<div>`,
//! `<execute-commands>` or `<Execute-Command>` never become tag nodes.

use serde::{Deserialize, Serialize};

// ─── ToolTag ────────────────────────────────────────────────────────────────

/// A tag name from the closed vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolTag {
    // Files
    CreateFile,
    DeleteFile,
    FullFileRewrite,
    StrReplace,
    // Shell
    ExecuteCommand,
    CheckCommandOutput,
    TerminateCommand,
    ListCommands,
    // Web
    WebSearch,
    CrawlWebpage,
    ScrapeWebpage,
    // Browser
    BrowserNavigateTo,
    BrowserGoBack,
    BrowserWait,
    BrowserClickElement,
    BrowserInputText,
    BrowserSendKeys,
    BrowserSwitchTab,
    BrowserCloseTab,
    BrowserScrollDown,
    BrowserScrollUp,
    BrowserScrollToText,
    BrowserGetDropdownOptions,
    BrowserSelectDropdownOption,
    BrowserDragDrop,
    BrowserClickCoordinates,
    // Data providers
    ExecuteDataProviderCall,
    GetDataProviderEndpoints,
    // Misc
    SeeImage,
    ExposePort,
    Deploy,
    Ask,
    Complete,
}

impl ToolTag {
    /// Every tag in the vocabulary.
    pub const ALL: &'static [ToolTag] = &[
        ToolTag::CreateFile,
        ToolTag::DeleteFile,
        ToolTag::FullFileRewrite,
        ToolTag::StrReplace,
        ToolTag::ExecuteCommand,
        ToolTag::CheckCommandOutput,
        ToolTag::TerminateCommand,
        ToolTag::ListCommands,
        ToolTag::WebSearch,
        ToolTag::CrawlWebpage,
        ToolTag::ScrapeWebpage,
        ToolTag::BrowserNavigateTo,
        ToolTag::BrowserGoBack,
        ToolTag::BrowserWait,
        ToolTag::BrowserClickElement,
        ToolTag::BrowserInputText,
        ToolTag::BrowserSendKeys,
        ToolTag::BrowserSwitchTab,
        ToolTag::BrowserCloseTab,
        ToolTag::BrowserScrollDown,
        ToolTag::BrowserScrollUp,
        ToolTag::BrowserScrollToText,
        ToolTag::BrowserGetDropdownOptions,
        ToolTag::BrowserSelectDropdownOption,
        ToolTag::BrowserDragDrop,
        ToolTag::BrowserClickCoordinates,
        ToolTag::ExecuteDataProviderCall,
        ToolTag::GetDataProviderEndpoints,
        ToolTag::SeeImage,
        ToolTag::ExposePort,
        ToolTag::Deploy,
        ToolTag::Ask,
        ToolTag::Complete,
    ];

    /// The tag name as it appears in markup.
    pub fn as_str(self) -> &'static str {
        match self {
            ToolTag::CreateFile => "create-file",
            ToolTag::DeleteFile => "delete-file",
            ToolTag::FullFileRewrite => "full-file-rewrite",
            ToolTag::StrReplace => "str-replace",
            ToolTag::ExecuteCommand => "execute-command",
            ToolTag::CheckCommandOutput => "check-command-output",
            ToolTag::TerminateCommand => "terminate-command",
            ToolTag::ListCommands => "list-commands",
            ToolTag::WebSearch => "web-search",
            ToolTag::CrawlWebpage => "crawl-webpage",
            ToolTag::ScrapeWebpage => "scrape-webpage",
            ToolTag::BrowserNavigateTo => "browser-navigate-to",
            ToolTag::BrowserGoBack => "browser-go-back",
            ToolTag::BrowserWait => "browser-wait",
            ToolTag::BrowserClickElement => "browser-click-element",
            ToolTag::BrowserInputText => "browser-input-text",
            ToolTag::BrowserSendKeys => "browser-send-keys",
            ToolTag::BrowserSwitchTab => "browser-switch-tab",
            ToolTag::BrowserCloseTab => "browser-close-tab",
            ToolTag::BrowserScrollDown => "browser-scroll-down",
            ToolTag::BrowserScrollUp => "browser-scroll-up",
            ToolTag::BrowserScrollToText => "browser-scroll-to-text",
            ToolTag::BrowserGetDropdownOptions => "browser-get-dropdown-options",
            ToolTag::BrowserSelectDropdownOption => "browser-select-dropdown-option",
            ToolTag::BrowserDragDrop => "browser-drag-drop",
            ToolTag::BrowserClickCoordinates => "browser-click-coordinates",
            ToolTag::ExecuteDataProviderCall => "execute-data-provider-call",
            ToolTag::GetDataProviderEndpoints => "get-data-provider-endpoints",
            ToolTag::SeeImage => "see-image",
            ToolTag::ExposePort => "expose-port",
            ToolTag::Deploy => "deploy",
            ToolTag::Ask => "ask",
            ToolTag::Complete => "complete",
        }
    }

    /// Look up a tag by its exact markup name. Matching is case-sensitive.
    pub fn from_name(name: &str) -> Option<ToolTag> {
        ToolTag::ALL.iter().copied().find(|tag| tag.as_str() == name)
    }
}

impl std::fmt::Display for ToolTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Characters that may appear in a vocabulary tag name.
pub(crate) fn is_tag_name_char(c: char) -> bool {
    c.is_ascii_lowercase() || c == '-'
}
