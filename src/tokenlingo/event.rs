//! Session event system.
//!
//! Implement [`EventHandler`] to observe what a
//! [`SessionOrchestrator`](crate::orchestrator::SessionOrchestrator) is doing: session
//! lifecycle, turn boundaries, provider faults, and newly discovered shorthand. The default
//! implementation is a no-op, so override only what you need.
//!
//! # Example
//!
//! ```rust,no_run
//! use tokenlingo::event::{EventHandler, SessionEvent};
//! use async_trait::async_trait;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_session_event(&self, event: &SessionEvent) {
//!         if let SessionEvent::TurnCompleted { speaker, iteration, total_tokens, .. } = event {
//!             println!("#{} {} spent {} tokens", iteration, speaker, total_tokens);
//!         }
//!     }
//! }
//! ```

use crate::tokenlingo::error::{PersistenceError, SessionError};
use crate::tokenlingo::pattern_tracker::{CommunicationLevel, PatternKind};
use crate::tokenlingo::session::SessionStatus;
use async_trait::async_trait;

/// Events emitted by the orchestrator.
///
/// During a successful `send_next_message` the order is:
///
/// ```text
/// TurnStarted
/// TurnCompleted
/// PatternDiscovered*            (one per new registry entry)
/// CommunicationLevelChanged?    (when the registry crosses a level boundary)
/// StatusChanged?                (when the turn completes the session)
/// PersistenceFailed?            (when that status could not be stored)
/// ```
#[derive(Debug, Clone)]
pub enum SessionEvent {
    SessionStarted {
        session_id: String,
        topic: String,
        participants: Vec<String>,
        max_iterations: u32,
    },
    SessionLoaded {
        session_id: String,
        status: SessionStatus,
        current_iteration: u32,
        patterns: usize,
    },
    TurnStarted {
        session_id: String,
        speaker: String,
        /// The iteration being produced.
        iteration: u32,
    },
    TurnCompleted {
        session_id: String,
        speaker: String,
        iteration: u32,
        total_tokens: u64,
        efficiency_score: f64,
        processing_time_ms: u64,
    },
    /// The provider call or the append failed. `retryable` mirrors
    /// [`SessionError::is_retryable`].
    TurnFailed {
        session_id: String,
        speaker: String,
        iteration: u32,
        error: SessionError,
        retryable: bool,
    },
    PatternDiscovered {
        session_id: String,
        literal: String,
        kind: PatternKind,
        introduced_by: String,
        iteration: u32,
    },
    CommunicationLevelChanged {
        session_id: String,
        from: CommunicationLevel,
        to: CommunicationLevel,
    },
    StatusChanged {
        session_id: String,
        from: SessionStatus,
        to: SessionStatus,
    },
    /// A status the session already holds in memory could not be stored, even after a retry.
    /// The stored copy still shows the previous status until the next successful write.
    PersistenceFailed {
        session_id: String,
        status: SessionStatus,
        error: PersistenceError,
    },
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for every [`SessionEvent`]. Default is a no-op.
    async fn on_session_event(&self, _event: &SessionEvent) {}
}
