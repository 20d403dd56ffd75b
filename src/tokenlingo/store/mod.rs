//! Persistence collaborator.
//!
//! The orchestrator never writes storage directly; it talks to a [`SessionStore`]. The store
//! is the durable source of truth used on reload, so its one load-bearing primitive is
//! [`SessionStore::append_message`]: the message and the session/participant rollups it
//! implies are applied together or not at all.
//!
//! Two implementations ship with the crate:
//!
//! * [`InMemorySessionStore`] for tests and embedders that persist elsewhere,
//! * [`JsonlSessionStore`], one append-only, hash-chained `.jsonl` file per session.
//!
//! Both publish a [`ChangeEvent`] feed through a `tokio::sync::broadcast` channel. Delivery is
//! at-least-once from the subscriber's point of view; dedupe messages by id.

mod jsonl;
mod memory;

pub use jsonl::JsonlSessionStore;
pub use memory::InMemorySessionStore;

use crate::tokenlingo::error::PersistenceError;
use crate::tokenlingo::session::{
    AnalyticsAggregate, ConversationMessage, Participant, Session, SessionStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Buffered change-feed events per subscriber before it starts lagging.
pub const CHANGE_FEED_CAPACITY: usize = 256;

/// Persisted message shape.
pub type MessageRecord = ConversationMessage;

/// Durable session header.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub status: SessionStatus,
    pub topic: String,
    pub scenario: String,
    #[serde(default)]
    pub instruction: Option<String>,
    pub max_iterations: u32,
    pub current_iteration: u32,
    pub total_tokens: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn from_session(session: &Session) -> Self {
        SessionRecord {
            id: session.id.clone(),
            status: session.status,
            topic: session.config.topic.clone(),
            scenario: session.config.scenario.clone(),
            instruction: session.config.instruction.clone(),
            max_iterations: session.config.max_iterations,
            current_iteration: session.current_iteration,
            total_tokens: session.analytics.total_tokens,
            created_at: session.created_at,
            updated_at: session.updated_at,
            completed_at: session.completed_at,
        }
    }
}

/// Rollup changes that travel with one appended message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollupUpdate {
    pub participant_id: String,
    /// New `current_iteration` of the session; must equal the message's iteration.
    pub current_iteration: u32,
    pub tokens_delta: u64,
    pub updated_at: DateTime<Utc>,
}

impl RollupUpdate {
    pub fn for_message(message: &ConversationMessage) -> Self {
        RollupUpdate {
            participant_id: message.participant_id.clone(),
            current_iteration: message.iteration,
            tokens_delta: message.token_usage.total_tokens,
            updated_at: message.created_at,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRollup {
    pub message_count: u32,
    pub total_tokens: u64,
}

/// Everything a store holds for one session.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredSession {
    pub record: SessionRecord,
    pub participants: Vec<Participant>,
    /// Keyed by participant id.
    pub participant_rollups: BTreeMap<String, ParticipantRollup>,
    pub messages: Vec<ConversationMessage>,
    /// Last mirrored analytics. Not authoritative.
    pub analytics_snapshot: Option<AnalyticsAggregate>,
}

impl StoredSession {
    pub fn new(record: SessionRecord, participants: Vec<Participant>) -> Self {
        let participant_rollups = participants
            .iter()
            .map(|p| (p.id.clone(), ParticipantRollup::default()))
            .collect();
        StoredSession {
            record,
            participants,
            participant_rollups,
            messages: Vec::new(),
            analytics_snapshot: None,
        }
    }

    /// Reject appends that would break the iteration sequence or name an unknown author.
    pub fn check_append(
        &self,
        message: &ConversationMessage,
        rollup: &RollupUpdate,
    ) -> Result<(), PersistenceError> {
        let expected = self.record.current_iteration + 1;
        if message.session_id != self.record.id {
            return Err(PersistenceError::Conflict(format!(
                "message {} belongs to session {}, not {}",
                message.id, message.session_id, self.record.id
            )));
        }
        if message.iteration != expected || rollup.current_iteration != message.iteration {
            return Err(PersistenceError::Conflict(format!(
                "session {} expects iteration {}, got message {} / rollup {}",
                self.record.id, expected, message.iteration, rollup.current_iteration
            )));
        }
        if !self.participant_rollups.contains_key(&rollup.participant_id) {
            return Err(PersistenceError::Conflict(format!(
                "participant {} is not part of session {}",
                rollup.participant_id, self.record.id
            )));
        }
        Ok(())
    }

    /// Apply a checked append. Callers run [`StoredSession::check_append`] first.
    pub fn apply_message(&mut self, message: ConversationMessage, rollup: &RollupUpdate) {
        self.record.current_iteration = rollup.current_iteration;
        self.record.total_tokens += rollup.tokens_delta;
        self.record.updated_at = rollup.updated_at;
        let entry = self
            .participant_rollups
            .entry(rollup.participant_id.clone())
            .or_default();
        entry.message_count += 1;
        entry.total_tokens += rollup.tokens_delta;
        self.messages.push(message);
    }

    pub fn apply_status(&mut self, status: SessionStatus, at: DateTime<Utc>) {
        self.record.status = status;
        self.record.updated_at = at;
        if status.is_terminal() && self.record.completed_at.is_none() {
            self.record.completed_at = Some(at);
        }
    }
}

/// Change-feed notification.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeEvent {
    SessionCreated { session_id: String },
    MessageAppended {
        session_id: String,
        message: ConversationMessage,
    },
    StatusChanged {
        session_id: String,
        status: SessionStatus,
    },
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create the session and its participants together. Fails with
    /// [`PersistenceError::Conflict`] when the id is taken.
    async fn create_session(
        &self,
        record: &SessionRecord,
        participants: &[Participant],
    ) -> Result<(), PersistenceError>;

    /// Append one message and apply its rollups atomically. The message iteration must be
    /// exactly one past the stored `current_iteration`.
    async fn append_message(
        &self,
        message: &MessageRecord,
        rollup: &RollupUpdate,
    ) -> Result<(), PersistenceError>;

    async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    /// Mirror the current analytics for history. Never read back as authoritative.
    async fn save_analytics_snapshot(
        &self,
        session_id: &str,
        analytics: &AnalyticsAggregate,
    ) -> Result<(), PersistenceError>;

    /// `Ok(None)` when no such session exists.
    async fn load_session(&self, session_id: &str) -> Result<Option<StoredSession>, PersistenceError>;

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}
