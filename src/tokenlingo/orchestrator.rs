//! The session orchestrator.
//!
//! [`SessionOrchestrator`] owns at most one live [`Session`] and drives its turn loop:
//!
//! ```text
//! send_next_message
//!   ├─ busy flag acquired (concurrent calls fail with AlreadyProcessing)
//!   ├─ speaker = participants[current_iteration % len]
//!   ├─ prompt composed, context window + pattern note assembled
//!   ├─ provider call (no locks held)
//!   ├─ translation / markers / efficiency computed
//!   ├─ store.append_message (message + rollups, atomic)
//!   ├─ in-memory accept, pattern tracker + analytics updated
//!   └─ auto-complete when current_iteration == max_iterations
//! ```
//!
//! Retries are driven by the caller. A retryable provider fault leaves the session `running`
//! with its iteration unchanged; anything else fatal to the turn moves it to `error`.
//!
//! Status writes that follow an automatic transition to `completed` or `error` are retried
//! once. If the store still refuses, the in-memory status stands and a
//! [`SessionEvent::PersistenceFailed`] is emitted.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokenlingo::orchestrator::{SessionOrchestrator, StartRequest};
//! use tokenlingo::provider::ProviderRegistry;
//! use tokenlingo::session::ParticipantSpec;
//! use tokenlingo::store::InMemorySessionStore;
//! use tokenlingo::OrchestratorConfig;
//!
//! # async fn demo() -> Result<(), tokenlingo::error::SessionError> {
//! let orchestrator = SessionOrchestrator::new(
//!     ProviderRegistry::from_env(),
//!     Arc::new(InMemorySessionStore::new()),
//!     OrchestratorConfig::default(),
//! );
//!
//! let started = orchestrator
//!     .start(StartRequest::new(
//!         "Designing a cache eviction policy",
//!         "problem-solving",
//!         vec![
//!             ParticipantSpec::new("Ada", "openai", "gpt-4.1-mini"),
//!             ParticipantSpec::new("Grace", "anthropic", "claude-sonnet-4-5"),
//!         ],
//!         6,
//!     ))
//!     .await?;
//!
//! for _ in 0..6 {
//!     let message = orchestrator.send_next_message(&started.session.id, None).await?;
//!     println!("#{} {}: {}", message.iteration, message.participant_name, message.content);
//! }
//! # Ok(())
//! # }
//! ```

use crate::tokenlingo::config::OrchestratorConfig;
use crate::tokenlingo::efficiency::{score, trend_over_series, EfficiencyScore, SeriesTrend};
use crate::tokenlingo::error::SessionError;
use crate::tokenlingo::event::{EventHandler, SessionEvent};
use crate::tokenlingo::markers::{
    extract_translation, scan_with, strip_translation, MarkerDetector, DEFAULT_DETECTORS,
};
use crate::tokenlingo::pattern_tracker::{
    CommunicationLevel, EvolutionPattern, PatternTracker, PatternUpdate,
};
use crate::tokenlingo::prompt::{compose, PromptContext};
use crate::tokenlingo::provider::{
    Message, ModelProvider, ProviderKind, ProviderRegistry, ProviderRequest, Role,
};
use crate::tokenlingo::session::{
    AnalyticsAggregate, ConversationMessage, Participant, ParticipantSpec, Session,
    SessionConfig, SessionSnapshot, SessionStatus, StopReason,
};
use crate::tokenlingo::store::{RollupUpdate, SessionRecord, SessionStore, StoredSession};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Tokens per turn assumed by the start-time cost estimate.
pub const ESTIMATED_TOKENS_PER_TURN: u64 = 500;

const MAX_TEMPERATURE: f32 = 2.0;

fn default_scenario() -> String {
    "general".to_string()
}

/// Input of [`SessionOrchestrator::start`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub topic: String,
    #[serde(default = "default_scenario")]
    pub scenario: String,
    pub participants: Vec<ParticipantSpec>,
    pub max_iterations: u32,
    #[serde(default)]
    pub instruction: Option<String>,
}

impl StartRequest {
    pub fn new(
        topic: &str,
        scenario: &str,
        participants: Vec<ParticipantSpec>,
        max_iterations: u32,
    ) -> Self {
        StartRequest {
            topic: topic.to_string(),
            scenario: scenario.to_string(),
            participants,
            max_iterations,
            instruction: None,
        }
    }

    pub fn with_instruction(mut self, instruction: &str) -> Self {
        self.instruction = Some(instruction.to_string());
        self
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedSession {
    pub session: SessionSnapshot,
    /// USD, from each adapter's `cost_per_token` and [`ESTIMATED_TOKENS_PER_TURN`].
    pub estimated_cost: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    pub session_id: String,
    pub status: SessionStatus,
    /// The session was already terminal; nothing changed.
    pub already_terminal: bool,
}

/// Everything `GET session-status` reports.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusReport {
    pub session: SessionSnapshot,
    pub analytics: AnalyticsAggregate,
    pub communication_level: CommunicationLevel,
    pub patterns: Vec<EvolutionPattern>,
    /// Advisory only; phase selection uses iteration progress.
    pub series_trend: SeriesTrend,
}

struct LiveSession {
    session: Session,
    tracker: PatternTracker,
    /// Adapters keyed by participant id.
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    series_trend: SeriesTrend,
}

impl LiveSession {
    fn report(&self) -> SessionStatusReport {
        SessionStatusReport {
            session: self.session.clone(),
            analytics: self.session.analytics.clone(),
            communication_level: self.tracker.communication_level(),
            patterns: self.tracker.patterns().to_vec(),
            series_trend: self.series_trend,
        }
    }
}

/// Held for the duration of one turn-advancing call; releases the flag on drop.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, SessionError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| BusyGuard(flag))
            .map_err(|_| SessionError::AlreadyProcessing)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Work prepared under the session lock for one provider call.
struct TurnPlan {
    session_id: String,
    speaker: Participant,
    iteration: u32,
    provider: Arc<dyn ModelProvider>,
    request: ProviderRequest,
    previous_total: Option<u64>,
}

pub struct SessionOrchestrator {
    registry: ProviderRegistry,
    store: Arc<dyn SessionStore>,
    config: OrchestratorConfig,
    event_handler: Option<Arc<dyn EventHandler>>,
    detectors: Vec<MarkerDetector>,
    busy: AtomicBool,
    live: Mutex<Option<LiveSession>>,
}

impl SessionOrchestrator {
    pub fn new(
        registry: ProviderRegistry,
        store: Arc<dyn SessionStore>,
        config: OrchestratorConfig,
    ) -> Self {
        SessionOrchestrator {
            registry,
            store,
            config,
            event_handler: None,
            detectors: DEFAULT_DETECTORS.to_vec(),
            busy: AtomicBool::new(false),
            live: Mutex::new(None),
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Replace the evolution-marker detectors run on every accepted message.
    pub fn with_marker_detectors(mut self, detectors: Vec<MarkerDetector>) -> Self {
        self.detectors = detectors;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<dyn SessionStore> {
        self.store.clone()
    }

    /// Whether a turn-advancing call is in flight.
    pub fn is_processing(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    async fn emit(&self, event: SessionEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_session_event(&event).await;
        }
    }

    async fn emit_all(&self, events: Vec<SessionEvent>) {
        for event in events {
            self.emit(event).await;
        }
    }

    /// Validate the request, create durable records and make the new session live.
    ///
    /// A previously live session is released from memory; its stored copy is untouched and
    /// can be reloaded.
    pub async fn start(&self, request: StartRequest) -> Result<StartedSession, SessionError> {
        let _busy = BusyGuard::acquire(&self.busy)?;

        let participants = self.validate_start(&request)?;
        let providers = self.resolve_providers(&participants)?;

        let estimated_cost = estimate_cost(&participants, &providers, request.max_iterations);

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            status: SessionStatus::Running,
            config: SessionConfig {
                topic: request.topic.trim().to_string(),
                scenario: request.scenario.trim().to_string(),
                participants,
                max_iterations: request.max_iterations,
                instruction: request
                    .instruction
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
            },
            current_iteration: 0,
            messages: Vec::new(),
            analytics: AnalyticsAggregate::default(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        // Stored as running in one write; no idle record is persisted.
        self.store
            .create_session(&SessionRecord::from_session(&session), session.participants())
            .await?;

        log::info!(
            "tokenlingo::orchestrator::start(...): session {} started on '{}' with {} participants, {} iterations",
            session.id,
            session.config.topic,
            session.participants().len(),
            session.config.max_iterations
        );

        let snapshot = session.clone();
        let events = vec![
            SessionEvent::SessionStarted {
                session_id: session.id.clone(),
                topic: session.config.topic.clone(),
                participants: session.participants().iter().map(|p| p.name.clone()).collect(),
                max_iterations: session.config.max_iterations,
            },
            SessionEvent::StatusChanged {
                session_id: session.id.clone(),
                from: SessionStatus::Idle,
                to: SessionStatus::Running,
            },
        ];

        {
            let mut live = self.live.lock().await;
            if let Some(previous) = live.as_ref() {
                if previous.session.status == SessionStatus::Running {
                    log::warn!(
                        "tokenlingo::orchestrator::start(...): releasing running session {} from memory",
                        previous.session.id
                    );
                }
            }
            *live = Some(LiveSession {
                session,
                tracker: PatternTracker::new(),
                providers,
                series_trend: SeriesTrend::default(),
            });
        }

        self.emit_all(events).await;

        Ok(StartedSession {
            session: snapshot,
            estimated_cost,
        })
    }

    fn validate_start(&self, request: &StartRequest) -> Result<Vec<Participant>, SessionError> {
        if request.topic.trim().is_empty() {
            return Err(SessionError::Validation("topic must not be empty".to_string()));
        }
        let count = request.participants.len();
        if count < self.config.min_participants || count > self.config.max_participants {
            return Err(SessionError::Validation(format!(
                "a session needs between {} and {} participants, got {}",
                self.config.min_participants, self.config.max_participants, count
            )));
        }
        if request.max_iterations < 1 {
            return Err(SessionError::Validation(
                "maxIterations must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for spec in &request.participants {
            let name = spec.name.trim();
            if name.is_empty() {
                return Err(SessionError::Validation(
                    "participant names must not be empty".to_string(),
                ));
            }
            if !seen.insert(name.to_lowercase()) {
                return Err(SessionError::Validation(format!(
                    "participant name '{}' is used more than once",
                    name
                )));
            }
            if spec.model.trim().is_empty() {
                return Err(SessionError::Validation(format!(
                    "participant '{}' has no model",
                    name
                )));
            }
            if !spec.temperature.is_finite()
                || spec.temperature < 0.0
                || spec.temperature > MAX_TEMPERATURE
            {
                return Err(SessionError::Validation(format!(
                    "participant '{}' temperature {} is outside 0..={}",
                    name, spec.temperature, MAX_TEMPERATURE
                )));
            }
        }

        request
            .participants
            .iter()
            .map(|spec| {
                let provider = spec
                    .provider
                    .parse::<ProviderKind>()
                    .map_err(SessionError::ProviderUnavailable)?;
                Ok(Participant {
                    id: Uuid::new_v4().to_string(),
                    name: spec.name.trim().to_string(),
                    provider,
                    model: spec.model.trim().to_string(),
                    temperature: spec.temperature,
                    config: spec.config.clone(),
                })
            })
            .collect()
    }

    fn resolve_providers(
        &self,
        participants: &[Participant],
    ) -> Result<HashMap<String, Arc<dyn ModelProvider>>, SessionError> {
        participants
            .iter()
            .map(|p| {
                self.registry
                    .resolve(p.provider, &p.model)
                    .map(|provider| (p.id.clone(), provider))
                    .ok_or_else(|| SessionError::ProviderUnavailable(p.provider.tag().to_string()))
            })
            .collect()
    }

    /// Produce the next turn of the live session.
    ///
    /// `context_window_override` replaces the configured number of prior messages sent as
    /// context for this call only.
    pub async fn send_next_message(
        &self,
        session_id: &str,
        context_window_override: Option<usize>,
    ) -> Result<ConversationMessage, SessionError> {
        let _busy = BusyGuard::acquire(&self.busy)?;

        let plan = self.plan_turn(session_id, context_window_override).await?;

        self.emit(SessionEvent::TurnStarted {
            session_id: plan.session_id.clone(),
            speaker: plan.speaker.name.clone(),
            iteration: plan.iteration,
        })
        .await;

        let started = Instant::now();
        let result = plan.provider.send(&plan.request).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let response = match result {
            Ok(response) => response,
            Err(err) => return Err(self.fail_turn(&plan, err.into()).await),
        };

        let total = response.token_usage.total_tokens;
        let efficiency = match plan.previous_total {
            Some(previous) => score(previous, total),
            None => EfficiencyScore::neutral(),
        };

        let message = ConversationMessage {
            id: Uuid::new_v4().to_string(),
            session_id: plan.session_id.clone(),
            participant_id: plan.speaker.id.clone(),
            participant_name: plan.speaker.name.clone(),
            iteration: plan.iteration,
            prompt: plan.request.prompt.clone(),
            translation: extract_translation(&response.text),
            evolution_markers: scan_with(&self.detectors, &response.text, plan.iteration),
            content: response.text,
            token_usage: response.token_usage,
            processing_time_ms: Some(elapsed_ms),
            efficiency,
            created_at: Utc::now(),
        };

        let mut events = Vec::new();
        {
            let mut guard = self.live.lock().await;
            let live = match guard.as_mut() {
                Some(live) if live.session.id == plan.session_id => live,
                _ => return Err(SessionError::SessionNotFound(plan.session_id.clone())),
            };

            if let Err(err) = self
                .store
                .append_message(&message, &RollupUpdate::for_message(&message))
                .await
            {
                drop(guard);
                return Err(self.fail_turn(&plan, err.into()).await);
            }

            let level_before = live.tracker.communication_level();
            live.session.accept(message.clone());
            let updates = live
                .tracker
                .observe(&plan.speaker.name, plan.iteration, &message.content);
            live.series_trend = trend_over_series(&live.session.token_series());

            log::debug!(
                "tokenlingo::orchestrator::send_next_message(...): #{} {} spent {} tokens, efficiency {:.1}",
                message.iteration,
                message.participant_name,
                total,
                message.efficiency_score()
            );

            events.push(SessionEvent::TurnCompleted {
                session_id: plan.session_id.clone(),
                speaker: plan.speaker.name.clone(),
                iteration: plan.iteration,
                total_tokens: total,
                efficiency_score: message.efficiency_score(),
                processing_time_ms: elapsed_ms,
            });

            for update in updates {
                if let PatternUpdate::Discovered(pattern) = update {
                    log::info!(
                        "tokenlingo::orchestrator::send_next_message(...): {} introduced {} '{}' ({})",
                        pattern.introduced_by,
                        pattern.kind,
                        pattern.literal,
                        pattern.meaning
                    );
                    events.push(SessionEvent::PatternDiscovered {
                        session_id: plan.session_id.clone(),
                        literal: pattern.literal,
                        kind: pattern.kind,
                        introduced_by: pattern.introduced_by,
                        iteration: pattern.first_iteration,
                    });
                }
            }

            let level_after = live.tracker.communication_level();
            if level_after != level_before {
                events.push(SessionEvent::CommunicationLevelChanged {
                    session_id: plan.session_id.clone(),
                    from: level_before,
                    to: level_after,
                });
            }

            if live.session.status == SessionStatus::Running && !live.session.has_turns_left() {
                let now = Utc::now();
                live.session.transition(SessionStatus::Completed, now);
                let persist_failed = self
                    .persist_status(&plan.session_id, SessionStatus::Completed, now)
                    .await;
                self.snapshot_analytics(&live.session).await;
                log::info!(
                    "tokenlingo::orchestrator::send_next_message(...): session {} completed after {} iterations",
                    plan.session_id,
                    live.session.current_iteration
                );
                events.push(SessionEvent::StatusChanged {
                    session_id: plan.session_id.clone(),
                    from: SessionStatus::Running,
                    to: SessionStatus::Completed,
                });
                events.extend(persist_failed);
            }
        }

        self.emit_all(events).await;
        Ok(message)
    }

    async fn plan_turn(
        &self,
        session_id: &str,
        context_window_override: Option<usize>,
    ) -> Result<TurnPlan, SessionError> {
        let guard = self.live.lock().await;
        let live = guard.as_ref().ok_or(SessionError::NoSession)?;
        let session = &live.session;

        if session.id != session_id {
            return Err(SessionError::SessionNotFound(session_id.to_string()));
        }
        if !session.has_turns_left() {
            return Err(SessionError::SessionComplete);
        }
        if session.status != SessionStatus::Running {
            return Err(SessionError::SessionNotRunning(session.status));
        }

        let speaker = session
            .next_speaker()
            .cloned()
            .ok_or_else(|| SessionError::Validation("session has no participants".to_string()))?;
        let iteration = session.current_iteration + 1;

        let provider = match live.providers.get(&speaker.id) {
            Some(provider) => provider.clone(),
            None => self
                .registry
                .resolve(speaker.provider, &speaker.model)
                .ok_or_else(|| SessionError::ProviderUnavailable(speaker.provider.tag().to_string()))?,
        };

        let window_size = context_window_override.unwrap_or(self.config.context_window);
        let skip = session.messages.len().saturating_sub(window_size);
        let window = &session.messages[skip..];

        let guidance = live
            .tracker
            .guidance_with_size(&speaker.name, self.config.guidance_size);
        let prompt = compose(&PromptContext {
            topic: &session.config.topic,
            scenario: &session.config.scenario,
            speaker: &speaker.name,
            iteration,
            max_iterations: session.config.max_iterations,
            window,
            instruction: session.config.instruction.as_deref(),
            guidance: &guidance,
        });

        let request = ProviderRequest {
            prompt,
            model: speaker.model.clone(),
            temperature: speaker.temperature,
            max_tokens: speaker
                .max_tokens_override()
                .unwrap_or(self.config.default_max_output_tokens),
            context: build_context(window, &speaker, &live.tracker, self.config.pattern_note_size),
        };

        Ok(TurnPlan {
            session_id: session.id.clone(),
            speaker,
            iteration,
            provider,
            request,
            previous_total: session.last_message().map(|m| m.token_usage.total_tokens),
        })
    }

    /// Apply the failure policy for a turn and return the error to surface.
    async fn fail_turn(&self, plan: &TurnPlan, error: SessionError) -> SessionError {
        let retryable = error.is_retryable();
        let cause = match &error {
            SessionError::Provider(inner) => inner.to_string(),
            SessionError::Persistence(inner) => inner.to_string(),
            other => other.to_string(),
        };

        let mut events = vec![SessionEvent::TurnFailed {
            session_id: plan.session_id.clone(),
            speaker: plan.speaker.name.clone(),
            iteration: plan.iteration,
            error: error.clone(),
            retryable,
        }];

        if retryable {
            log::warn!(
                "tokenlingo::orchestrator::send_next_message(...): retryable fault on turn {} of {} ({}): {}",
                plan.iteration,
                plan.session_id,
                error.reason_code(),
                cause
            );
        } else {
            log::error!(
                "tokenlingo::orchestrator::send_next_message(...): fatal fault on turn {} of {} ({}): {}",
                plan.iteration,
                plan.session_id,
                error.reason_code(),
                cause
            );
            let mut guard = self.live.lock().await;
            if let Some(live) = guard.as_mut() {
                if live.session.id == plan.session_id
                    && live.session.status == SessionStatus::Running
                {
                    let now = Utc::now();
                    live.session.transition(SessionStatus::Error, now);
                    let persist_failed = self
                        .persist_status(&plan.session_id, SessionStatus::Error, now)
                        .await;
                    self.snapshot_analytics(&live.session).await;
                    events.push(SessionEvent::StatusChanged {
                        session_id: plan.session_id.clone(),
                        from: SessionStatus::Running,
                        to: SessionStatus::Error,
                    });
                    events.extend(persist_failed);
                }
            }
        }

        self.emit_all(events).await;
        error
    }

    /// Write a status the session has already taken in memory, retrying once.
    ///
    /// Returns a [`SessionEvent::PersistenceFailed`] when both attempts fail; the in-memory
    /// status stands and the stored copy keeps its previous status.
    async fn persist_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> Option<SessionEvent> {
        let first = match self.store.update_status(session_id, status, at).await {
            Ok(()) => return None,
            Err(err) => err,
        };
        log::warn!(
            "tokenlingo::orchestrator::persist_status(...): writing {} for {} failed, retrying: {}",
            status,
            session_id,
            first
        );
        match self.store.update_status(session_id, status, at).await {
            Ok(()) => None,
            Err(err) => {
                log::error!(
                    "tokenlingo::orchestrator::persist_status(...): could not persist {} for {}: {}",
                    status,
                    session_id,
                    err
                );
                Some(SessionEvent::PersistenceFailed {
                    session_id: session_id.to_string(),
                    status,
                    error: err,
                })
            }
        }
    }

    async fn snapshot_analytics(&self, session: &Session) {
        if let Err(err) = self
            .store
            .save_analytics_snapshot(&session.id, &session.analytics)
            .await
        {
            log::warn!(
                "tokenlingo::orchestrator: analytics snapshot for {} failed: {}",
                session.id,
                err
            );
        }
    }

    /// Mark a session `completed` or `stopped`. Stopping a terminal session is a no-op.
    ///
    /// A turn already in flight is not interrupted; its message is still recorded, but no
    /// further turns are allowed.
    pub async fn stop(&self, session_id: &str, reason: StopReason) -> Result<StopOutcome, SessionError> {
        let target = reason.target_status();
        let mut guard = self.live.lock().await;

        if let Some(live) = guard.as_mut().filter(|live| live.session.id == session_id) {
            let from = live.session.status;
            if from.is_terminal() {
                return Ok(StopOutcome {
                    session_id: session_id.to_string(),
                    status: from,
                    already_terminal: true,
                });
            }

            let now = Utc::now();
            self.store.update_status(session_id, target, now).await?;
            live.session.transition(target, now);
            self.snapshot_analytics(&live.session).await;
            drop(guard);

            log::info!(
                "tokenlingo::orchestrator::stop(...): session {} is now {} ({:?})",
                session_id,
                target,
                reason
            );
            self.emit(SessionEvent::StatusChanged {
                session_id: session_id.to_string(),
                from,
                to: target,
            })
            .await;

            return Ok(StopOutcome {
                session_id: session_id.to_string(),
                status: target,
                already_terminal: false,
            });
        }
        drop(guard);

        let stored = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        let from = stored.record.status;
        if from.is_terminal() {
            return Ok(StopOutcome {
                session_id: session_id.to_string(),
                status: from,
                already_terminal: true,
            });
        }

        self.store.update_status(session_id, target, Utc::now()).await?;
        log::info!(
            "tokenlingo::orchestrator::stop(...): stored session {} is now {} ({:?})",
            session_id,
            target,
            reason
        );
        self.emit(SessionEvent::StatusChanged {
            session_id: session_id.to_string(),
            from,
            to: target,
        })
        .await;

        Ok(StopOutcome {
            session_id: session_id.to_string(),
            status: target,
            already_terminal: false,
        })
    }

    /// Rehydrate a stored session and make it live, replaying its history through a fresh
    /// pattern tracker.
    pub async fn load(&self, session_id: &str) -> Result<SessionSnapshot, SessionError> {
        let _busy = BusyGuard::acquire(&self.busy)?;

        let stored = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        let session = session_from_stored(stored);
        let tracker = PatternTracker::replay(&session.messages);
        let series_trend = trend_over_series(&session.token_series());

        let mut providers = HashMap::new();
        for participant in session.participants() {
            match self.registry.resolve(participant.provider, &participant.model) {
                Some(provider) => {
                    providers.insert(participant.id.clone(), provider);
                }
                None => log::warn!(
                    "tokenlingo::orchestrator::load(...): no adapter for {} ({}); its turns will fail",
                    participant.name,
                    participant.provider
                ),
            }
        }

        log::info!(
            "tokenlingo::orchestrator::load(...): session {} loaded ({}, iteration {}/{}, {} patterns)",
            session.id,
            session.status,
            session.current_iteration,
            session.config.max_iterations,
            tracker.len()
        );

        let event = SessionEvent::SessionLoaded {
            session_id: session.id.clone(),
            status: session.status,
            current_iteration: session.current_iteration,
            patterns: tracker.len(),
        };
        let snapshot = session.clone();
        *self.live.lock().await = Some(LiveSession {
            session,
            tracker,
            providers,
            series_trend,
        });
        self.emit(event).await;

        Ok(snapshot)
    }

    /// Session, analytics and pattern registry. Falls back to a read-only rehydration from
    /// the store when `session_id` is not live.
    pub async fn status(&self, session_id: &str) -> Result<SessionStatusReport, SessionError> {
        {
            let guard = self.live.lock().await;
            if let Some(live) = guard.as_ref().filter(|live| live.session.id == session_id) {
                return Ok(live.report());
            }
        }

        let stored = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        let session = session_from_stored(stored);
        let tracker = PatternTracker::replay(&session.messages);
        Ok(SessionStatusReport {
            analytics: session.analytics.clone(),
            communication_level: tracker.communication_level(),
            patterns: tracker.patterns().to_vec(),
            series_trend: trend_over_series(&session.token_series()),
            session,
        })
    }

    /// Snapshot of the live session, if any.
    pub async fn current_session(&self) -> Option<SessionSnapshot> {
        self.live.lock().await.as_ref().map(|live| live.session.clone())
    }

    /// Pattern registry of the live session, oldest first.
    pub async fn patterns(&self) -> Vec<EvolutionPattern> {
        self.live
            .lock()
            .await
            .as_ref()
            .map(|live| live.tracker.patterns().to_vec())
            .unwrap_or_default()
    }

    pub async fn communication_level(&self) -> CommunicationLevel {
        self.live
            .lock()
            .await
            .as_ref()
            .map(|live| live.tracker.communication_level())
            .unwrap_or(CommunicationLevel::Basic)
    }
}

/// Sum over participants of cost per token × tokens per turn × turns they will take.
fn estimate_cost(
    participants: &[Participant],
    providers: &HashMap<String, Arc<dyn ModelProvider>>,
    max_iterations: u32,
) -> f64 {
    let count = participants.len() as u32;
    if count == 0 {
        return 0.0;
    }
    participants
        .iter()
        .enumerate()
        .map(|(index, participant)| {
            let turns = max_iterations / count + u32::from((index as u32) < max_iterations % count);
            let cost = providers
                .get(&participant.id)
                .map(|p| p.cost_per_token())
                .unwrap_or(0.0);
            cost * (ESTIMATED_TOKENS_PER_TURN * turns as u64) as f64
        })
        .sum()
}

/// System note (when patterns exist) followed by the attributed window, oldest first.
fn build_context(
    window: &[ConversationMessage],
    speaker: &Participant,
    tracker: &PatternTracker,
    note_size: usize,
) -> Vec<Message> {
    let mut context = Vec::with_capacity(window.len() + 1);
    if let Some(note) = tracker.system_note(note_size) {
        context.push(Message::new(Role::System, note));
    }
    for message in window {
        let role = if message.participant_id == speaker.id {
            Role::Assistant
        } else {
            Role::User
        };
        let mut utterance = format!(
            "[{}]: {}",
            message.participant_name,
            strip_translation(&message.content)
        );
        if let Some(translation) = &message.translation {
            utterance.push_str(&format!(" [translation: {}]", translation));
        }
        context.push(Message::new(role, utterance));
    }
    context
}

/// Rebuild an in-memory session from the store's durable copy. Messages are authoritative
/// for `current_iteration` and analytics.
fn session_from_stored(stored: StoredSession) -> Session {
    let StoredSession {
        record,
        participants,
        mut messages,
        ..
    } = stored;
    messages.sort_by_key(|m| m.iteration);

    let current_iteration = messages.last().map(|m| m.iteration).unwrap_or(0);
    let status = if record.status == SessionStatus::Idle {
        log::warn!(
            "tokenlingo::orchestrator: session {} was stored as idle; treating it as running",
            record.id
        );
        SessionStatus::Running
    } else {
        record.status
    };
    if current_iteration != record.current_iteration {
        log::warn!(
            "tokenlingo::orchestrator: session {} record says iteration {}, messages say {}",
            record.id,
            record.current_iteration,
            current_iteration
        );
    }

    Session {
        analytics: AnalyticsAggregate::from_messages(&messages),
        id: record.id,
        status,
        config: SessionConfig {
            topic: record.topic,
            scenario: record.scenario,
            participants,
            max_iterations: record.max_iterations,
            instruction: record.instruction,
        },
        current_iteration,
        messages,
        created_at: record.created_at,
        updated_at: record.updated_at,
        completed_at: record.completed_at,
    }
}
