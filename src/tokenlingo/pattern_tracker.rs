//! Communication evolution tracking.
//!
//! The [`PatternTracker`] mines each accepted message for reusable shorthand and keeps a
//! registry keyed by `(kind, literal)`. Three extractors run independently:
//!
//! * `[literal: meaning]` pairs become [`PatternKind::Symbol`] entries,
//! * 2–4 letter all-caps tokens followed by a colon and text become
//!   [`PatternKind::Abbreviation`] entries,
//! * capitalized compound words containing `Protocol` become [`PatternKind::Protocol`] entries.
//!
//! A hit on an existing key bumps its adoption count; a new key is attributed to the speaker
//! and iteration that produced it. Entries are never removed. The registry lives for one
//! session and is rebuilt by [`PatternTracker::replay`] when a session is reloaded.
//!
//! ```
//! use tokenlingo::pattern_tracker::{PatternKind, PatternTracker};
//!
//! let mut tracker = PatternTracker::new();
//! tracker.observe("Ada", 1, "Proposal [fx: fast execution] for the deploy.");
//! tracker.observe("Grace", 2, "Agreed, fx it. [fx: fast execution]");
//!
//! let fx = tracker.get(PatternKind::Symbol, "fx").unwrap();
//! assert_eq!(fx.meaning, "fast execution");
//! assert_eq!(fx.adoption_count, 2);
//! assert_eq!(fx.introduced_by, "Ada");
//! assert_eq!(tracker.len(), 1);
//! ```

use crate::tokenlingo::session::ConversationMessage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

/// Entries shown in per-speaker guidance.
pub const GUIDANCE_SIZE: usize = 5;
/// Entries summarized in the context system note.
pub const SYSTEM_NOTE_SIZE: usize = 3;

const MAX_MEANING_CHARS: usize = 80;

/// Bracket keywords reserved for translations; never mined as symbols.
const RESERVED_SYMBOLS: [&str; 3] = ["translation", "meaning", "decode"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Symbol,
    Abbreviation,
    Protocol,
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternKind::Symbol => f.write_str("symbol"),
            PatternKind::Abbreviation => f.write_str("abbreviation"),
            PatternKind::Protocol => f.write_str("protocol"),
        }
    }
}

/// A structured hit produced by an extractor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatternHit {
    pub kind: PatternKind,
    pub literal: String,
    /// Meaning as stated in this occurrence, if the text stated one.
    pub meaning: Option<String>,
    /// The textual form observed in this occurrence.
    pub variation: String,
}

/// Pure extractor over one message's text.
pub type PatternExtractor = fn(&str) -> Vec<PatternHit>;

/// One mined shorthand unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionPattern {
    pub literal: String,
    pub kind: PatternKind,
    pub introduced_by: String,
    pub first_iteration: u32,
    pub adoption_count: u32,
    pub variations: BTreeSet<String>,
    pub meaning: String,
}

/// Outcome of observing one message, per distinct key.
#[derive(Clone, Debug, PartialEq)]
pub enum PatternUpdate {
    Discovered(EvolutionPattern),
    Adopted {
        kind: PatternKind,
        literal: String,
        adoption_count: u32,
    },
}

/// Coarse maturity of the shared vocabulary, a function of registry size only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommunicationLevel {
    Basic,
    Evolving,
    Advanced,
    HighlyEvolved,
}

impl CommunicationLevel {
    pub fn for_registry_size(size: usize) -> Self {
        match size {
            0..=2 => CommunicationLevel::Basic,
            3..=7 => CommunicationLevel::Evolving,
            8..=14 => CommunicationLevel::Advanced,
            _ => CommunicationLevel::HighlyEvolved,
        }
    }
}

impl fmt::Display for CommunicationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CommunicationLevel::Basic => "basic",
            CommunicationLevel::Evolving => "evolving",
            CommunicationLevel::Advanced => "advanced",
            CommunicationLevel::HighlyEvolved => "highly-evolved",
        };
        f.write_str(label)
    }
}

static SYMBOL_PAIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\[\]:\n]{1,40}):\s*([^\[\]\n]+?)\s*\]").expect("static regex"));

static ABBREVIATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z]{2,4}):[ \t]*([^\s\]][^\n\]]*)").expect("static regex"));

static PROTOCOL_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Z][A-Za-z0-9]*Protocol[A-Za-z0-9]*|Protocol[A-Z0-9][A-Za-z0-9]*)\b")
        .expect("static regex")
});

fn truncate_chars(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(max).collect();
        format!("{}…", cut.trim_end())
    }
}

/// `[literal: meaning]` pairs.
pub fn extract_symbols(text: &str) -> Vec<PatternHit> {
    SYMBOL_PAIR
        .captures_iter(text)
        .filter_map(|caps| {
            let literal = caps.get(1)?.as_str().trim();
            let meaning = caps.get(2)?.as_str().trim();
            if literal.is_empty() || meaning.is_empty() {
                return None;
            }
            if RESERVED_SYMBOLS
                .iter()
                .any(|reserved| literal.eq_ignore_ascii_case(reserved))
            {
                return None;
            }
            let meaning = truncate_chars(meaning, MAX_MEANING_CHARS);
            Some(PatternHit {
                kind: PatternKind::Symbol,
                literal: literal.to_string(),
                meaning: Some(meaning.clone()),
                variation: meaning,
            })
        })
        .collect()
}

/// `ABC: trailing text`, skipping occurrences that open a bracketed symbol pair.
pub fn extract_abbreviations(text: &str) -> Vec<PatternHit> {
    ABBREVIATION
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            if text[..whole.start()].ends_with('[') {
                return None;
            }
            let literal = caps.get(1)?.as_str();
            let trailing = truncate_chars(caps.get(2)?.as_str(), MAX_MEANING_CHARS);
            if trailing.is_empty() {
                return None;
            }
            Some(PatternHit {
                kind: PatternKind::Abbreviation,
                literal: literal.to_string(),
                meaning: Some(trailing.clone()),
                variation: trailing,
            })
        })
        .collect()
}

/// Capitalized compounds such as `SyncProtocol` or `ProtocolDelta`.
pub fn extract_protocols(text: &str) -> Vec<PatternHit> {
    PROTOCOL_NAME
        .captures_iter(text)
        .filter_map(|caps| {
            let literal = caps.get(1)?.as_str();
            Some(PatternHit {
                kind: PatternKind::Protocol,
                literal: literal.to_string(),
                meaning: None,
                variation: literal.to_string(),
            })
        })
        .collect()
}

/// The extractors a new tracker runs.
pub const DEFAULT_EXTRACTORS: [PatternExtractor; 3] =
    [extract_symbols, extract_abbreviations, extract_protocols];

/// Registry of mined shorthand for one session.
#[derive(Clone, Debug)]
pub struct PatternTracker {
    extractors: Vec<PatternExtractor>,
    /// Insertion order; most recently established last.
    patterns: Vec<EvolutionPattern>,
    index: HashMap<(PatternKind, String), usize>,
}

impl Default for PatternTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternTracker {
    pub fn new() -> Self {
        Self::with_extractors(DEFAULT_EXTRACTORS.to_vec())
    }

    /// Build a tracker that runs a custom extractor set.
    pub fn with_extractors(extractors: Vec<PatternExtractor>) -> Self {
        PatternTracker {
            extractors,
            patterns: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Rebuild a tracker by observing `messages` in order.
    pub fn replay<'a, I>(messages: I) -> Self
    where
        I: IntoIterator<Item = &'a ConversationMessage>,
    {
        let mut tracker = PatternTracker::new();
        for message in messages {
            tracker.observe(&message.participant_name, message.iteration, &message.content);
        }
        tracker
    }

    /// Mine one message. Each key counts at most once per message.
    pub fn observe(&mut self, speaker: &str, iteration: u32, text: &str) -> Vec<PatternUpdate> {
        let hits: Vec<PatternHit> = self
            .extractors
            .iter()
            .flat_map(|extract| extract(text))
            .collect();

        let mut seen: HashSet<(PatternKind, String)> = HashSet::new();
        let mut updates = Vec::new();

        for hit in hits {
            let key = (hit.kind, hit.literal.clone());
            if !seen.insert(key.clone()) {
                continue;
            }

            match self.index.get(&key) {
                Some(&position) => {
                    let pattern = &mut self.patterns[position];
                    pattern.adoption_count += 1;
                    pattern.variations.insert(hit.variation);
                    updates.push(PatternUpdate::Adopted {
                        kind: pattern.kind,
                        literal: pattern.literal.clone(),
                        adoption_count: pattern.adoption_count,
                    });
                }
                None => {
                    let meaning = hit.meaning.unwrap_or_else(|| match hit.kind {
                        PatternKind::Protocol => format!("protocol named by {}", speaker),
                        _ => hit.literal.clone(),
                    });
                    let mut variations = BTreeSet::new();
                    variations.insert(hit.variation);
                    let pattern = EvolutionPattern {
                        literal: hit.literal,
                        kind: hit.kind,
                        introduced_by: speaker.to_string(),
                        first_iteration: iteration,
                        adoption_count: 1,
                        variations,
                        meaning,
                    };
                    self.index.insert(key, self.patterns.len());
                    self.patterns.push(pattern.clone());
                    updates.push(PatternUpdate::Discovered(pattern));
                }
            }
        }

        updates
    }

    pub fn get(&self, kind: PatternKind, literal: &str) -> Option<&EvolutionPattern> {
        self.index
            .get(&(kind, literal.to_string()))
            .map(|&position| &self.patterns[position])
    }

    /// All entries, oldest first.
    pub fn patterns(&self) -> &[EvolutionPattern] {
        &self.patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The `n` most recently established entries, newest first.
    pub fn most_recent(&self, n: usize) -> Vec<&EvolutionPattern> {
        self.patterns.iter().rev().take(n).collect()
    }

    pub fn communication_level(&self) -> CommunicationLevel {
        CommunicationLevel::for_registry_size(self.patterns.len())
    }

    /// Coaching directives for `speaker`, built from the five most recent entries.
    pub fn guidance_for(&self, speaker: &str) -> String {
        self.guidance_with_size(speaker, GUIDANCE_SIZE)
    }

    pub fn guidance_with_size(&self, speaker: &str, size: usize) -> String {
        let recent = self.most_recent(size);
        if recent.is_empty() {
            return format!(
                "{}, no shared shorthand exists yet. Introduce 1-2 compact symbols or abbreviations, \
                 each defined inline as [symbol: meaning].",
                speaker
            );
        }

        let mut out = format!("{}, the group's shorthand so far:\n", speaker);
        for pattern in &recent {
            let origin = if pattern.introduced_by == speaker {
                "yours".to_string()
            } else {
                format!("from {}", pattern.introduced_by)
            };
            out.push_str(&format!(
                "- {} ({}, {}, used {}x): {}\n",
                pattern.literal, pattern.kind, origin, pattern.adoption_count, pattern.meaning
            ));
        }
        out.push_str("Reuse these patterns wherever they fit.\n");
        out.push_str("Create 1-2 new complementary patterns that build on them.\n");
        out.push_str("Demonstrate that you understand the existing set by using it correctly.");
        out
    }

    /// One-line summary of the `n` most recently established entries, or `None` when empty.
    pub fn system_note(&self, n: usize) -> Option<String> {
        let recent = self.most_recent(n);
        if recent.is_empty() {
            return None;
        }
        let listed: Vec<String> = recent
            .iter()
            .map(|p| {
                format!(
                    "{} = {} ({} at turn {})",
                    p.literal, p.meaning, p.introduced_by, p.first_iteration
                )
            })
            .collect();
        Some(format!("Established shorthand: {}", listed.join("; ")))
    }
}
