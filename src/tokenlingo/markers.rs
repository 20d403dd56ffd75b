//! Per-message scans: the optional plain-language gloss and evolution markers.
//!
//! Detection is heuristic. Each marker has its own [`MarkerDetector`], a pure function of the
//! text and iteration, so detectors can be replaced or tested in isolation.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Caps runs only count once the conversation has had time to settle.
pub const CAPS_MIN_ITERATION: u32 = 5;
/// Brevity only counts after this many turns.
pub const BREVITY_MIN_ITERATION: u32 = 10;
/// Output shorter than this many characters (after trimming) counts as brief.
pub const BREVITY_MAX_CHARS: usize = 100;

/// A detected compression behavior in one message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionMarker {
    /// Directional glyphs such as `→`, `⇒`, `->`.
    ArrowNotation,
    /// `A::B` style namespacing.
    DoubleColon,
    /// `a/b` compaction.
    SlashNotation,
    /// Runs of all-caps tokens.
    CapsCompression,
    /// Unusually short output late in the conversation.
    ExtremeBrevity,
}

impl EvolutionMarker {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvolutionMarker::ArrowNotation => "arrow_notation",
            EvolutionMarker::DoubleColon => "double_colon",
            EvolutionMarker::SlashNotation => "slash_notation",
            EvolutionMarker::CapsCompression => "caps_compression",
            EvolutionMarker::ExtremeBrevity => "extreme_brevity",
        }
    }
}

impl fmt::Display for EvolutionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detector inspects `(text, iteration)` and reports at most one marker.
pub type MarkerDetector = fn(&str, u32) -> Option<EvolutionMarker>;

static TRANSLATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\[\s*(?:translation|meaning|decode)\s*:\s*(.+?)\s*\]").expect("static regex")
});

static SLASH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z0-9]{1,16}/[A-Za-z0-9]{1,16}\b").expect("static regex"));

static CAPS_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z]{2,}\b").expect("static regex"));

const ARROWS: [&str; 9] = ["→", "←", "↔", "⇒", "⇐", "⇔", "➜", "->", "=>"];

/// Extract the gloss from a `[translation: ...]`, `[meaning: ...]` or `[decode: ...]` marker.
///
/// ```
/// use tokenlingo::markers::extract_translation;
///
/// assert_eq!(
///     extract_translation("SYNC→OK [translation: synchronization complete]").as_deref(),
///     Some("synchronization complete")
/// );
/// assert_eq!(extract_translation("no gloss here"), None);
/// ```
pub fn extract_translation(text: &str) -> Option<String> {
    TRANSLATION
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Text with any translation marker removed and surrounding whitespace trimmed.
///
/// ```
/// use tokenlingo::markers::strip_translation;
///
/// assert_eq!(strip_translation("ACK→GO [meaning: proceed]"), "ACK→GO");
/// ```
pub fn strip_translation(text: &str) -> String {
    TRANSLATION.replace_all(text, "").trim().to_string()
}

pub fn detect_arrows(text: &str, _iteration: u32) -> Option<EvolutionMarker> {
    ARROWS
        .iter()
        .any(|arrow| text.contains(arrow))
        .then_some(EvolutionMarker::ArrowNotation)
}

pub fn detect_double_colon(text: &str, _iteration: u32) -> Option<EvolutionMarker> {
    text.contains("::").then_some(EvolutionMarker::DoubleColon)
}

pub fn detect_slash(text: &str, _iteration: u32) -> Option<EvolutionMarker> {
    let stripped = text.replace("://", " ");
    SLASH
        .is_match(&stripped)
        .then_some(EvolutionMarker::SlashNotation)
}

pub fn detect_caps(text: &str, iteration: u32) -> Option<EvolutionMarker> {
    if iteration <= CAPS_MIN_ITERATION {
        return None;
    }
    (CAPS_TOKEN.find_iter(text).count() >= 2).then_some(EvolutionMarker::CapsCompression)
}

pub fn detect_brevity(text: &str, iteration: u32) -> Option<EvolutionMarker> {
    if iteration <= BREVITY_MIN_ITERATION {
        return None;
    }
    let len = strip_translation(text).chars().count();
    (len > 0 && len < BREVITY_MAX_CHARS).then_some(EvolutionMarker::ExtremeBrevity)
}

/// The detectors the orchestrator runs on every accepted message.
pub const DEFAULT_DETECTORS: [MarkerDetector; 5] = [
    detect_arrows,
    detect_double_colon,
    detect_slash,
    detect_caps,
    detect_brevity,
];

/// Run `detectors` over `text`, returning each marker at most once in detector order.
pub fn scan_with(detectors: &[MarkerDetector], text: &str, iteration: u32) -> Vec<EvolutionMarker> {
    let mut markers = Vec::new();
    for detector in detectors {
        if let Some(marker) = detector(text, iteration) {
            if !markers.contains(&marker) {
                markers.push(marker);
            }
        }
    }
    markers
}

/// Run [`DEFAULT_DETECTORS`].
///
/// ```
/// use tokenlingo::markers::{scan_evolution_markers, EvolutionMarker};
///
/// let markers = scan_evolution_markers("plan→exec; io::wait", 2);
/// assert_eq!(markers, vec![EvolutionMarker::ArrowNotation, EvolutionMarker::DoubleColon]);
/// ```
pub fn scan_evolution_markers(text: &str, iteration: u32) -> Vec<EvolutionMarker> {
    scan_with(&DEFAULT_DETECTORS, text, iteration)
}
