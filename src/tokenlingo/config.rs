//! Configuration for the session orchestrator.
//!
//! [`OrchestratorConfig`] is a plain struct. Build it with [`Default`] and the `with_*`
//! setters; no config files are read.
//!
//! # Example
//!
//! ```rust
//! use tokenlingo::OrchestratorConfig;
//! use std::path::PathBuf;
//!
//! let config = OrchestratorConfig::default()
//!     .with_context_window(6)
//!     .with_production(true);
//! assert_eq!(config.context_window, 6);
//! assert_eq!(config.session_dir, PathBuf::from("sessions"));
//! ```

use std::path::PathBuf;

#[derive(Clone, Debug, PartialEq)]
pub struct OrchestratorConfig {
    /// Prior messages sent as context with each turn.
    pub context_window: usize,
    /// Recent patterns summarized in the context system note.
    pub pattern_note_size: usize,
    /// Recent patterns rendered into per-speaker guidance.
    pub guidance_size: usize,
    /// Output budget per turn unless a participant's config sets `max_tokens`.
    pub default_max_output_tokens: usize,
    pub min_participants: usize,
    pub max_participants: usize,
    /// When set, user-visible failures omit the underlying cause.
    pub production: bool,
    /// Where [`JsonlSessionStore::from_config`](crate::store::JsonlSessionStore::from_config) keeps session files.
    pub session_dir: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            context_window: 10,
            pattern_note_size: 3,
            guidance_size: 5,
            default_max_output_tokens: 1024,
            min_participants: 2,
            max_participants: 5,
            production: false,
            session_dir: PathBuf::from("sessions"),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_context_window(mut self, context_window: usize) -> Self {
        self.context_window = context_window;
        self
    }

    pub fn with_pattern_note_size(mut self, size: usize) -> Self {
        self.pattern_note_size = size;
        self
    }

    pub fn with_guidance_size(mut self, size: usize) -> Self {
        self.guidance_size = size;
        self
    }

    pub fn with_default_max_output_tokens(mut self, tokens: usize) -> Self {
        self.default_max_output_tokens = tokens;
        self
    }

    pub fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    pub fn with_session_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.session_dir = dir.into();
        self
    }
}
