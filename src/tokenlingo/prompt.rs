//! Prompt composition for one turn.
//!
//! [`compose`] is a pure function: identical [`PromptContext`]s always produce identical
//! prompts. The coaching phase comes from iteration progress alone.
//!
//! ```
//! use tokenlingo::prompt::{compose, EvolutionPhase, PromptContext};
//!
//! let ctx = PromptContext {
//!     topic: "Designing a cache eviction policy",
//!     scenario: "problem-solving",
//!     speaker: "Ada",
//!     iteration: 1,
//!     max_iterations: 10,
//!     window: &[],
//!     instruction: None,
//!     guidance: "",
//! };
//! let prompt = compose(&ctx);
//! assert!(prompt.contains("Designing a cache eviction policy"));
//! assert_eq!(compose(&ctx), prompt);
//! assert_eq!(ctx.phase(), EvolutionPhase::Early);
//! ```

use crate::tokenlingo::session::ConversationMessage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coaching regime derived from `iteration / max_iterations`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvolutionPhase {
    Early,
    Middle,
    Late,
}

impl EvolutionPhase {
    /// `early` up to 30% progress, `middle` up to 70%, `late` after.
    pub fn for_progress(iteration: u32, max_iterations: u32) -> Self {
        if max_iterations == 0 {
            return EvolutionPhase::Late;
        }
        let progress = iteration as f64 / max_iterations as f64;
        if progress <= 0.3 {
            EvolutionPhase::Early
        } else if progress <= 0.7 {
            EvolutionPhase::Middle
        } else {
            EvolutionPhase::Late
        }
    }

    fn coaching(&self) -> &'static str {
        match self {
            EvolutionPhase::Early => {
                "Start introducing shorthand: coin one or two compact symbols or abbreviations \
                 for ideas that keep coming up, and define each inline as [symbol: meaning]."
            }
            EvolutionPhase::Middle => {
                "Compound the shorthand: combine established symbols into denser expressions, \
                 use arrows and :: to chain ideas, and drop filler words."
            }
            EvolutionPhase::Late => {
                "Maximize compression: say as much as possible in as few tokens as possible, \
                 relying on the shared vocabulary wherever it fits."
            }
        }
    }
}

impl fmt::Display for EvolutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvolutionPhase::Early => f.write_str("early"),
            EvolutionPhase::Middle => f.write_str("middle"),
            EvolutionPhase::Late => f.write_str("late"),
        }
    }
}

/// Framing for a scenario tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScenarioSeed {
    pub tag: &'static str,
    /// How participants relate to each other.
    pub framing: &'static str,
    /// Instruction for the very first turn of a session.
    pub opening: &'static str,
}

const GENERIC_SEED: ScenarioSeed = ScenarioSeed {
    tag: "general",
    framing: "You are in a focused multi-party discussion.",
    opening: "Open the discussion: state your initial position on the topic in a few sentences.",
};

const SCENARIO_SEEDS: [ScenarioSeed; 5] = [
    ScenarioSeed {
        tag: "problem-solving",
        framing: "You are collaborating with other agents to solve a concrete problem.",
        opening: "Open by breaking the problem into its key sub-problems and proposing where to start.",
    },
    ScenarioSeed {
        tag: "debate",
        framing: "You are debating other agents, each defending a distinct position.",
        opening: "Open by stating a clear position on the topic and your strongest argument for it.",
    },
    ScenarioSeed {
        tag: "brainstorm",
        framing: "You are brainstorming with other agents; quantity and novelty of ideas matter.",
        opening: "Open with three distinct ideas on the topic, one line each.",
    },
    ScenarioSeed {
        tag: "negotiation",
        framing: "You are negotiating with other agents who have partly conflicting interests.",
        opening: "Open by stating what you want, what you can offer, and what you will not accept.",
    },
    ScenarioSeed {
        tag: "teaching",
        framing: "You are part of a group explaining a subject so that every participant understands it.",
        opening: "Open by explaining the single most important idea of the topic in plain terms.",
    },
];

/// Seed for `tag`, falling back to a generic discussion seed for unknown tags.
pub fn scenario_seed(tag: &str) -> &'static ScenarioSeed {
    let tag = tag.trim();
    SCENARIO_SEEDS
        .iter()
        .find(|seed| seed.tag.eq_ignore_ascii_case(tag))
        .unwrap_or(&GENERIC_SEED)
}

/// Known scenario tags.
pub fn scenario_tags() -> Vec<&'static str> {
    SCENARIO_SEEDS.iter().map(|seed| seed.tag).collect()
}

/// Everything the composer looks at.
#[derive(Clone, Copy, Debug)]
pub struct PromptContext<'a> {
    pub topic: &'a str,
    pub scenario: &'a str,
    pub speaker: &'a str,
    /// The 1-based iteration this prompt will produce.
    pub iteration: u32,
    pub max_iterations: u32,
    /// Trailing window of prior messages, oldest first.
    pub window: &'a [ConversationMessage],
    pub instruction: Option<&'a str>,
    /// Output of the pattern tracker's guidance for `speaker`; may be empty.
    pub guidance: &'a str,
}

impl PromptContext<'_> {
    pub fn phase(&self) -> EvolutionPhase {
        EvolutionPhase::for_progress(self.iteration, self.max_iterations)
    }
}

/// Build the instruction text for one turn.
pub fn compose(ctx: &PromptContext<'_>) -> String {
    let seed = scenario_seed(ctx.scenario);
    let phase = ctx.phase();
    let mut sections: Vec<String> = Vec::new();

    sections.push(format!(
        "{} You are {}. Topic: {}.",
        seed.framing, ctx.speaker, ctx.topic
    ));

    if ctx.iteration <= 1 {
        sections.push(seed.opening.to_string());
    } else {
        let reply_to = ctx
            .window
            .iter()
            .rev()
            .find(|m| m.participant_name != ctx.speaker)
            .map(|m| m.participant_name.as_str());
        sections.push(match reply_to {
            Some(other) => format!(
                "Turn {} of {}. Continue the conversation, responding directly to {}'s latest point.",
                ctx.iteration, ctx.max_iterations, other
            ),
            None => format!(
                "Turn {} of {}. Continue the conversation and move it forward.",
                ctx.iteration, ctx.max_iterations
            ),
        });
    }

    if let Some(instruction) = ctx.instruction.map(str::trim).filter(|s| !s.is_empty()) {
        sections.push(format!("Additional instruction: {}", instruction));
    }

    sections.push(format!("Phase: {}. {}", phase, phase.coaching()));

    if !ctx.guidance.trim().is_empty() {
        sections.push(ctx.guidance.trim().to_string());
    }

    sections.push(
        "End your message with a plain-language gloss of any shorthand you used, \
         in the form [translation: ...]."
            .to_string(),
    );

    sections.join("\n\n")
}
