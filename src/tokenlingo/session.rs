//! Session data model.
//!
//! A [`Session`] is owned by exactly one
//! [`SessionOrchestrator`](crate::orchestrator::SessionOrchestrator) at a time. Messages are
//! append-only and ordered by iteration; [`AnalyticsAggregate`] is derived from them and can
//! always be rebuilt with [`AnalyticsAggregate::from_messages`].

use crate::tokenlingo::efficiency::EfficiencyScore;
use crate::tokenlingo::markers::EvolutionMarker;
use crate::tokenlingo::provider::{ProviderKind, TokenUsage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// `idle → running → {completed | stopped | error}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Running,
    Completed,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Stopped | SessionStatus::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a caller is stopping a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    #[default]
    Manual,
    Timeout,
    Completed,
}

impl StopReason {
    /// The terminal status this reason leads to.
    pub fn target_status(&self) -> SessionStatus {
        match self {
            StopReason::Completed => SessionStatus::Completed,
            StopReason::Manual | StopReason::Timeout => SessionStatus::Stopped,
        }
    }
}

impl FromStr for StopReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(StopReason::Manual),
            "timeout" => Ok(StopReason::Timeout),
            "completed" => Ok(StopReason::Completed),
            other => Err(other.to_string()),
        }
    }
}

fn default_temperature() -> f32 {
    0.7
}

/// Participant as supplied by a caller of `start`, before validation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSpec {
    pub name: String,
    /// Provider tag, e.g. `openai` or `anthropic`.
    pub provider: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub config: Value,
}

impl ParticipantSpec {
    pub fn new(name: &str, provider: &str, model: &str) -> Self {
        ParticipantSpec {
            name: name.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            temperature: default_temperature(),
            config: Value::Null,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// A validated conversation participant. Immutable once the session is created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub model: String,
    pub temperature: f32,
    #[serde(default)]
    pub config: Value,
}

impl Participant {
    /// Output budget override carried in the opaque config under `max_tokens`.
    pub fn max_tokens_override(&self) -> Option<usize> {
        self.config
            .get("max_tokens")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
    }
}

/// Fixed configuration of a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub topic: String,
    pub scenario: String,
    /// Turn rotation order.
    pub participants: Vec<Participant>,
    pub max_iterations: u32,
    #[serde(default)]
    pub instruction: Option<String>,
}

/// One accepted turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: String,
    pub session_id: String,
    pub participant_id: String,
    pub participant_name: String,
    /// 1-based, one per message.
    pub iteration: u32,
    pub prompt: String,
    pub content: String,
    #[serde(default)]
    pub translation: Option<String>,
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub processing_time_ms: Option<u64>,
    #[serde(default)]
    pub evolution_markers: Vec<EvolutionMarker>,
    pub efficiency: EfficiencyScore,
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn efficiency_score(&self) -> f64 {
        self.efficiency.efficiency_score
    }
}

/// Per-participant rollup.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantStats {
    pub message_count: u32,
    pub total_tokens: u64,
    pub average_tokens: f64,
    /// Mean latency over messages that reported one.
    pub average_processing_ms: Option<f64>,
    #[serde(default)]
    timed_messages: u32,
    #[serde(default)]
    total_processing_ms: u64,
}

impl ParticipantStats {
    fn record(&mut self, message: &ConversationMessage) {
        self.message_count += 1;
        self.total_tokens += message.token_usage.total_tokens;
        self.average_tokens = self.total_tokens as f64 / self.message_count as f64;
        if let Some(ms) = message.processing_time_ms {
            self.timed_messages += 1;
            self.total_processing_ms += ms;
            self.average_processing_ms =
                Some(self.total_processing_ms as f64 / self.timed_messages as f64);
        }
    }
}

/// One evolution marker observed in one message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerEvent {
    pub iteration: u32,
    pub participant_name: String,
    pub marker: EvolutionMarker,
}

/// Rolling analytics, recomputed incrementally on every accepted message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsAggregate {
    pub total_tokens: u64,
    pub message_count: u32,
    pub average_tokens_per_message: f64,
    /// Efficiency score of every message, in iteration order.
    pub efficiency_trend: Vec<f64>,
    pub participant_stats: BTreeMap<String, ParticipantStats>,
    pub evolution_events: Vec<MarkerEvent>,
}

impl AnalyticsAggregate {
    pub fn from_messages<'a, I>(messages: I) -> Self
    where
        I: IntoIterator<Item = &'a ConversationMessage>,
    {
        let mut aggregate = AnalyticsAggregate::default();
        for message in messages {
            aggregate.record(message);
        }
        aggregate
    }

    pub fn record(&mut self, message: &ConversationMessage) {
        self.total_tokens += message.token_usage.total_tokens;
        self.message_count += 1;
        self.average_tokens_per_message = self.total_tokens as f64 / self.message_count as f64;
        self.efficiency_trend.push(message.efficiency_score());
        self.participant_stats
            .entry(message.participant_name.clone())
            .or_default()
            .record(message);
        for marker in &message.evolution_markers {
            self.evolution_events.push(MarkerEvent {
                iteration: message.iteration,
                participant_name: message.participant_name.clone(),
                marker: *marker,
            });
        }
    }
}

/// Index of the participant who speaks after `current_iteration` accepted messages.
///
/// ```
/// use tokenlingo::session::turn_index;
///
/// assert_eq!(turn_index(0, 3), 0);
/// assert_eq!(turn_index(4, 3), 1);
/// ```
pub fn turn_index(current_iteration: u32, participant_count: usize) -> usize {
    if participant_count == 0 {
        return 0;
    }
    current_iteration as usize % participant_count
}

/// Complete in-memory state of one session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub config: SessionConfig,
    /// Iteration of the last accepted message, 0 when none.
    pub current_iteration: u32,
    pub messages: Vec<ConversationMessage>,
    pub analytics: AnalyticsAggregate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Read-only copy handed to callers.
pub type SessionSnapshot = Session;

impl Session {
    pub fn participants(&self) -> &[Participant] {
        &self.config.participants
    }

    /// Who speaks next, by rotation.
    pub fn next_speaker(&self) -> Option<&Participant> {
        let participants = self.participants();
        participants.get(turn_index(self.current_iteration, participants.len()))
    }

    pub fn has_turns_left(&self) -> bool {
        self.current_iteration < self.config.max_iterations
    }

    pub fn last_message(&self) -> Option<&ConversationMessage> {
        self.messages.last()
    }

    /// Move to `status`, stamping `completed_at` when it is terminal.
    pub fn transition(&mut self, status: SessionStatus, at: DateTime<Utc>) {
        self.status = status;
        self.updated_at = at;
        if status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(at);
        }
    }

    /// Append an accepted message and fold it into the analytics.
    pub fn accept(&mut self, message: ConversationMessage) {
        self.current_iteration = message.iteration;
        self.updated_at = message.created_at;
        self.analytics.record(&message);
        self.messages.push(message);
    }

    /// Per-message total tokens in iteration order.
    pub fn token_series(&self) -> Vec<u64> {
        self.messages
            .iter()
            .map(|m| m.token_usage.total_tokens)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(name: &str, iteration: u32, total: u64, latency: Option<u64>) -> ConversationMessage {
        ConversationMessage {
            id: format!("m{}", iteration),
            session_id: "s".to_string(),
            participant_id: format!("p-{}", name),
            participant_name: name.to_string(),
            iteration,
            prompt: String::new(),
            content: "x".to_string(),
            translation: None,
            token_usage: TokenUsage::new(total / 2, total - total / 2),
            processing_time_ms: latency,
            evolution_markers: vec![EvolutionMarker::ArrowNotation],
            efficiency: EfficiencyScore::neutral(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_turn_rotation() {
        let order: Vec<usize> = (0..6).map(|i| turn_index(i, 3)).collect();
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(turn_index(7, 0), 0);
    }

    #[test]
    fn test_analytics_rollups() {
        let messages = vec![
            message("A", 1, 100, Some(20)),
            message("B", 2, 60, None),
            message("A", 3, 40, Some(40)),
        ];
        let analytics = AnalyticsAggregate::from_messages(&messages);
        assert_eq!(analytics.total_tokens, 200);
        assert_eq!(analytics.message_count, 3);
        assert!((analytics.average_tokens_per_message - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(analytics.efficiency_trend.len(), 3);
        assert_eq!(analytics.evolution_events.len(), 3);

        let a = &analytics.participant_stats["A"];
        assert_eq!(a.message_count, 2);
        assert_eq!(a.total_tokens, 140);
        assert_eq!(a.average_processing_ms, Some(30.0));
        assert_eq!(analytics.participant_stats["B"].average_processing_ms, None);
    }

    #[test]
    fn test_stop_reason_targets() {
        assert_eq!(StopReason::Manual.target_status(), SessionStatus::Stopped);
        assert_eq!(StopReason::Timeout.target_status(), SessionStatus::Stopped);
        assert_eq!(StopReason::Completed.target_status(), SessionStatus::Completed);
        assert_eq!("TIMEOUT".parse::<StopReason>(), Ok(StopReason::Timeout));
    }

    #[test]
    fn test_participant_max_tokens_override() {
        let mut participant = Participant {
            id: "p".into(),
            name: "A".into(),
            provider: ProviderKind::OpenAI,
            model: "gpt-4.1-mini".into(),
            temperature: 0.7,
            config: Value::Null,
        };
        assert_eq!(participant.max_tokens_override(), None);
        participant.config = serde_json::json!({"max_tokens": 256});
        assert_eq!(participant.max_tokens_override(), Some(256));
    }
}
