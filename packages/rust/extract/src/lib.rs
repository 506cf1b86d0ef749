//! Readable-text extraction from fetched pages.
//!
//! [`extract`] strips markup and boilerplate (scripts, styles, navigation,
//! ad containers), normalizes whitespace, drops characters outside the
//! allow-list, and scores how much of the visible text survived cleaning.
//! The whole module is pure: no I/O and no shared state.

mod cleanup;

use harvester_shared::ExtractConfig;
use scraper::Html;
use scraper::node::{Element, Node};
use tracing::debug;

/// Elements removed together with their whole subtree.
const REMOVED_TAGS: &[&str] = &[
    "script", "style", "meta", "link", "noscript", "iframe", "template", "svg", "nav", "footer",
];

/// Class names that mark layout chrome or advertising.
const REMOVED_CLASSES: &[&str] = &["sidebar", "nav", "header", "advertisement", "ad"];

/// Element ids that mark layout chrome.
const REMOVED_IDS: &[&str] = &["sidebar", "nav", "header"];

/// Lowest confidence reported when almost nothing survived cleaning.
const CONFIDENCE_CEILING_FOR_FLOOR: f64 = 0.5;

/// Thresholds for extraction quality.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractOptions {
    /// Cleaned text shorter than this (in characters) is only `Partial`.
    pub min_content_length: usize,
    /// Confidence reported when the preservation ratio is below every band.
    pub min_confidence: f64,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self::from(&ExtractConfig::default())
    }
}

impl From<&ExtractConfig> for ExtractOptions {
    fn from(config: &ExtractConfig) -> Self {
        Self {
            min_content_length: config.min_content_length,
            min_confidence: config.min_confidence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStatus {
    /// Enough readable text survived.
    Success,
    /// Some text survived, but less than the minimum length.
    Partial,
    /// Nothing readable was found.
    Failed,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

/// Result of extracting one page.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub cleaned_text: String,
    /// Length of `cleaned_text` in characters.
    pub content_length: usize,
    /// Length of the visible text before cleanup, in characters.
    pub raw_text_length: usize,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    pub status: ExtractionStatus,
}

impl Extraction {
    /// No visible text, so the ratio is undefined and the floor applies.
    fn failed(opts: &ExtractOptions) -> Self {
        Self {
            cleaned_text: String::new(),
            content_length: 0,
            raw_text_length: 0,
            confidence: confidence_for_ratio(0.0, opts.min_confidence),
            status: ExtractionStatus::Failed,
        }
    }
}

/// Extract readable text from a raw HTML (or plain text) document.
pub fn extract(raw: &str, opts: &ExtractOptions) -> Extraction {
    if raw.trim().is_empty() {
        return Extraction::failed(opts);
    }

    let visible = visible_text(raw);
    let raw_text_length = visible.chars().count();
    if raw_text_length == 0 {
        debug!(raw_bytes = raw.len(), "no visible text in document");
        return Extraction::failed(opts);
    }

    let cleaned_text = cleanup::run_pipeline(&visible);
    let content_length = cleaned_text.chars().count();

    let ratio = content_length as f64 / raw_text_length as f64;
    let confidence = confidence_for_ratio(ratio, opts.min_confidence);

    let status = if content_length == 0 {
        ExtractionStatus::Failed
    } else if content_length < opts.min_content_length {
        ExtractionStatus::Partial
    } else {
        ExtractionStatus::Success
    };

    debug!(
        raw_text_length,
        content_length,
        confidence,
        status = status.as_str(),
        "extracted page text"
    );

    Extraction {
        cleaned_text,
        content_length,
        raw_text_length,
        confidence,
        status,
    }
}

/// Map the content-preservation ratio (cleaned length / visible length) to a
/// confidence score. Monotonically non-decreasing in `ratio`.
pub fn confidence_for_ratio(ratio: f64, floor: f64) -> f64 {
    let floor = if floor.is_nan() {
        0.0
    } else {
        floor.clamp(0.0, CONFIDENCE_CEILING_FOR_FLOOR)
    };

    if ratio >= 0.7 {
        0.95
    } else if ratio >= 0.5 {
        0.85
    } else if ratio >= 0.3 {
        0.70
    } else if ratio >= 0.1 {
        0.50
    } else {
        floor
    }
}

/// Visible text of a document: every text node outside removed subtrees,
/// trimmed and joined with single spaces.
pub fn visible_text(raw: &str) -> String {
    let document = Html::parse_document(raw);
    let mut pieces: Vec<&str> = Vec::new();

    let mut stack = vec![document.tree.root()];
    while let Some(node) = stack.pop() {
        match node.value() {
            Node::Text(text) => {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    pieces.push(trimmed);
                }
            }
            Node::Element(element) if is_boilerplate(element) => continue,
            _ => {}
        }
        stack.extend(node.children().rev());
    }

    pieces.join(" ")
}

fn is_boilerplate(element: &Element) -> bool {
    let name = element.name();
    if REMOVED_TAGS.contains(&name) {
        return true;
    }
    if element.id().is_some_and(|id| REMOVED_IDS.contains(&id)) {
        return true;
    }
    element.classes().any(|class| REMOVED_CLASSES.contains(&class))
}
