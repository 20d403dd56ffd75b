//! # tokenlingo
//!
//! tokenlingo runs rotating conversations between several independently hosted language
//! models and coaches them, turn by turn, toward inventing a shared shorthand that spends
//! fewer tokens.
//!
//! The crate is layered from pure leaves up to one stateful root:
//!
//! * **Token efficiency**: [`efficiency`] turns token counts into 0–100 scores and trends.
//! * **Pattern tracking**: [`pattern_tracker`] mines symbols, abbreviations and protocol names
//!   out of each message and renders per-speaker coaching.
//! * **Prompt composition**: [`prompt`] builds the deterministic instruction for a turn.
//! * **Providers**: [`provider::ModelProvider`] is implemented for OpenAI, Anthropic Claude,
//!   Google Gemini and xAI Grok in [`clients`]; all faults map into [`error::ProviderError`].
//! * **Persistence**: [`store::SessionStore`] with in-memory and hash-chained JSONL backends.
//! * **Orchestration**: [`SessionOrchestrator`] owns the live session, the turn loop, the
//!   busy flag and the failure policy.
//! * **HTTP**: the `api-server` feature exposes the orchestrator through an axum `Router`.
//!
//! ## Running a session
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokenlingo::orchestrator::StartRequest;
//! use tokenlingo::provider::ProviderRegistry;
//! use tokenlingo::session::ParticipantSpec;
//! use tokenlingo::store::JsonlSessionStore;
//! use tokenlingo::{OrchestratorConfig, SessionOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     tokenlingo::init_logger();
//!
//!     let config = OrchestratorConfig::default();
//!     let store = Arc::new(JsonlSessionStore::from_config(&config)?);
//!     let orchestrator = SessionOrchestrator::new(ProviderRegistry::from_env(), store, config);
//!
//!     let started = orchestrator
//!         .start(StartRequest::new(
//!             "How should a CDN invalidate stale objects?",
//!             "brainstorm",
//!             vec![
//!                 ParticipantSpec::new("Ada", "openai", "gpt-4.1-mini"),
//!                 ParticipantSpec::new("Grace", "claude", "claude-haiku-4-5"),
//!                 ParticipantSpec::new("Linus", "grok", "grok-4-fast"),
//!             ],
//!             9,
//!         ))
//!         .await?;
//!     println!("estimated cost: ${:.4}", started.estimated_cost);
//!
//!     loop {
//!         match orchestrator.send_next_message(&started.session.id, None).await {
//!             Ok(message) => println!("[{}] {}", message.participant_name, message.content),
//!             Err(err) if err.is_retryable() => continue,
//!             Err(err) => {
//!                 println!("stopped: {}", err);
//!                 break;
//!             }
//!         }
//!     }
//!
//!     let report = orchestrator.status(&started.session.id).await?;
//!     println!("{} patterns, level {}", report.patterns.len(), report.communication_level);
//!     Ok(())
//! }
//! ```
//!
//! ## Logging
//!
//! Every module logs through the [`log`] facade. Call [`init_logger`] once to install
//! `env_logger`, then control verbosity with `RUST_LOG`:
//!
//! ```bash
//! RUST_LOG=tokenlingo=debug cargo run
//! ```

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// ```rust
/// tokenlingo::init_logger();
/// tokenlingo::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `tokenlingo` module.
pub mod tokenlingo;

// Re-exporting key items for easier external access.
pub use tokenlingo::clients;
pub use tokenlingo::config;
pub use tokenlingo::config::OrchestratorConfig;
pub use tokenlingo::efficiency;
pub use tokenlingo::error;
pub use tokenlingo::error::{PersistenceError, ProviderError, SessionError};
pub use tokenlingo::event;
pub use tokenlingo::event::{EventHandler, SessionEvent};
pub use tokenlingo::markers;
pub use tokenlingo::orchestrator;
pub use tokenlingo::orchestrator::{SessionOrchestrator, StartRequest};
pub use tokenlingo::pattern_tracker;
pub use tokenlingo::prompt;
pub use tokenlingo::provider;
pub use tokenlingo::provider::{ModelProvider, ProviderKind, ProviderRegistry};
pub use tokenlingo::session;
pub use tokenlingo::store;

#[cfg(feature = "api-server")]
pub use tokenlingo::api;
