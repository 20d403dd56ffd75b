use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokenlingo::efficiency::NEUTRAL_SCORE;
use tokenlingo::error::{PersistenceError, ProviderError, SessionError};
use tokenlingo::event::{EventHandler, SessionEvent};
use tokenlingo::markers::EvolutionMarker;
use tokenlingo::orchestrator::{SessionOrchestrator, StartRequest};
use tokenlingo::pattern_tracker::{CommunicationLevel, PatternKind};
use tokenlingo::provider::{
    FinishReason, ModelProvider, ProviderKind, ProviderRegistry, ProviderRequest,
    ProviderResponse, Role, TokenUsage,
};
use tokenlingo::session::{AnalyticsAggregate, Participant, ParticipantSpec, SessionStatus, StopReason};
use tokenlingo::store::{
    ChangeEvent, InMemorySessionStore, MessageRecord, RollupUpdate, SessionRecord, SessionStore,
    StoredSession,
};
use tokenlingo::OrchestratorConfig;
use tokio::sync::broadcast;

type Scripted = Result<ProviderResponse, ProviderError>;

struct MockProvider {
    script: Mutex<VecDeque<Scripted>>,
    default_text: String,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl MockProvider {
    fn new(default_text: &str) -> Self {
        MockProvider {
            script: Mutex::new(VecDeque::new()),
            default_text: default_text.to_string(),
            delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn with_script(self, script: Vec<Scripted>) -> Self {
        *self.script.lock().unwrap() = script.into();
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn last_request(&self) -> ProviderRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| reply(&self.default_text, 100, 50))
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }

    fn provider_kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }

    fn cost_per_token(&self) -> f64 {
        0.001
    }
}

fn reply(text: &str, input: u64, output: u64) -> Scripted {
    Ok(ProviderResponse {
        text: text.to_string(),
        token_usage: TokenUsage::new(input, output),
        finish_reason: FinishReason::Stop,
    })
}

fn registry_with(provider: Arc<MockProvider>) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register_instance(ProviderKind::OpenAI, provider.clone());
    registry.register_instance(ProviderKind::Anthropic, provider);
    registry
}

fn orchestrator_with(provider: Arc<MockProvider>) -> (SessionOrchestrator, Arc<InMemorySessionStore>) {
    let store = Arc::new(InMemorySessionStore::new());
    let orchestrator = SessionOrchestrator::new(
        registry_with(provider),
        store.clone(),
        OrchestratorConfig::default(),
    );
    (orchestrator, store)
}

fn request(names: &[&str], max_iterations: u32) -> StartRequest {
    let participants = names
        .iter()
        .map(|name| ParticipantSpec::new(name, "openai", "mock-model"))
        .collect();
    StartRequest::new("Consensus on a cache eviction policy", "problem-solving", participants, max_iterations)
}

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<SessionEvent>>,
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn on_session_event(&self, event: &SessionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[tokio::test]
async fn test_three_participants_rotate_and_complete() {
    let provider = Arc::new(MockProvider::new("plain reply"));
    let (orchestrator, store) = orchestrator_with(provider.clone());

    let started = orchestrator.start(request(&["A", "B", "C"], 3)).await.unwrap();
    let id = started.session.id.clone();
    assert_eq!(started.session.current_iteration, 0);
    assert_eq!(started.session.status, SessionStatus::Running);

    let mut speakers = Vec::new();
    let mut iterations = Vec::new();
    for _ in 0..3 {
        let message = orchestrator.send_next_message(&id, None).await.unwrap();
        speakers.push(message.participant_name.clone());
        iterations.push(message.iteration);
    }

    assert_eq!(speakers, vec!["A", "B", "C"]);
    assert_eq!(iterations, vec![1, 2, 3]);

    let session = orchestrator.current_session().await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.current_iteration, 3);
    assert!(session.completed_at.is_some());

    let err = orchestrator.send_next_message(&id, None).await.unwrap_err();
    assert_eq!(err, SessionError::SessionComplete);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

    let stored = store.load_session(&id).await.unwrap().unwrap();
    assert_eq!(stored.record.status, SessionStatus::Completed);
    assert_eq!(stored.record.current_iteration, 3);
    assert_eq!(stored.record.total_tokens, 450);
    assert!(stored.participant_rollups.values().all(|r| r.message_count == 1));
    assert!(stored.analytics_snapshot.is_some());
}

#[tokio::test]
async fn test_rotation_wraps_around() {
    let provider = Arc::new(MockProvider::new("ok"));
    let (orchestrator, _store) = orchestrator_with(provider);
    let id = orchestrator.start(request(&["A", "B"], 5)).await.unwrap().session.id;

    let mut speakers = Vec::new();
    for _ in 0..5 {
        speakers.push(orchestrator.send_next_message(&id, None).await.unwrap().participant_name);
    }
    assert_eq!(speakers, vec!["A", "B", "A", "B", "A"]);
}

#[tokio::test]
async fn test_first_message_is_neutral_then_scored_against_previous() {
    let provider = Arc::new(MockProvider::new("ok").with_script(vec![
        reply("first", 100, 100),
        reply("second", 50, 100),
        reply("third", 400, 400),
    ]));
    let (orchestrator, _store) = orchestrator_with(provider);
    let id = orchestrator.start(request(&["A", "B"], 3)).await.unwrap().session.id;

    let first = orchestrator.send_next_message(&id, None).await.unwrap();
    assert_eq!(first.efficiency_score(), NEUTRAL_SCORE);

    let second = orchestrator.send_next_message(&id, None).await.unwrap();
    assert_eq!(second.efficiency.delta, 50);
    assert_eq!(second.efficiency_score(), 100.0);

    let third = orchestrator.send_next_message(&id, None).await.unwrap();
    assert_eq!(third.efficiency_score(), 0.0);

    let report = orchestrator.status(&id).await.unwrap();
    assert_eq!(report.analytics.efficiency_trend, vec![50.0, 100.0, 0.0]);
    assert!(report
        .analytics
        .efficiency_trend
        .iter()
        .all(|s| (0.0..=100.0).contains(s)));
    assert_eq!(report.series_trend.steps, 2);
}

#[tokio::test]
async fn test_rate_limit_leaves_turn_retryable() {
    let provider = Arc::new(MockProvider::new("ok").with_script(vec![Err(
        ProviderError::from_status(429, "slow down", Some(3)),
    )]));
    let (orchestrator, _store) = orchestrator_with(provider.clone());
    let id = orchestrator.start(request(&["A", "B"], 4)).await.unwrap().session.id;

    let err = orchestrator.send_next_message(&id, None).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(
        err,
        SessionError::Provider(ProviderError::RateLimit {
            retry_after_seconds: Some(3)
        })
    );

    let session = orchestrator.current_session().await.unwrap();
    assert_eq!(session.status, SessionStatus::Running);
    assert_eq!(session.current_iteration, 0);
    assert!(session.messages.is_empty());

    let retried = orchestrator.send_next_message(&id, None).await.unwrap();
    assert_eq!(retried.iteration, 1);
    assert_eq!(retried.participant_name, "A");
    assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_authentication_failure_moves_session_to_error() {
    let provider = Arc::new(MockProvider::new("ok").with_script(vec![
        reply("fine", 10, 10),
        Err(ProviderError::from_status(401, "invalid api key", None)),
    ]));
    let (orchestrator, store) = orchestrator_with(provider);
    let id = orchestrator.start(request(&["A", "B"], 4)).await.unwrap().session.id;

    orchestrator.send_next_message(&id, None).await.unwrap();
    let err = orchestrator.send_next_message(&id, None).await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(err.reason_code(), "authentication");

    let session = orchestrator.current_session().await.unwrap();
    assert_eq!(session.status, SessionStatus::Error);
    assert_eq!(session.current_iteration, 1);

    let stored = store.load_session(&id).await.unwrap().unwrap();
    assert_eq!(stored.record.status, SessionStatus::Error);

    let err = orchestrator.send_next_message(&id, None).await.unwrap_err();
    assert_eq!(err, SessionError::SessionNotRunning(SessionStatus::Error));
}

#[tokio::test]
async fn test_token_limit_is_fatal() {
    let provider = Arc::new(MockProvider::new("ok").with_script(vec![Err(ProviderError::TokenLimit {
        requested: 9000,
        max: 8192,
    })]));
    let (orchestrator, _store) = orchestrator_with(provider);
    let id = orchestrator.start(request(&["A", "B"], 4)).await.unwrap().session.id;

    let err = orchestrator.send_next_message(&id, None).await.unwrap_err();
    assert_eq!(err.reason_code(), "token_limit");
    assert_eq!(
        orchestrator.current_session().await.unwrap().status,
        SessionStatus::Error
    );
}

#[tokio::test]
async fn test_concurrent_sends_fail_fast() {
    let provider = Arc::new(MockProvider::new("ok").with_delay(Duration::from_millis(100)));
    let (orchestrator, _store) = orchestrator_with(provider.clone());
    let id = orchestrator.start(request(&["A", "B"], 4)).await.unwrap().session.id;

    let (first, second) = tokio::join!(
        orchestrator.send_next_message(&id, None),
        orchestrator.send_next_message(&id, None)
    );

    let results = [first, second];
    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let busy = results
        .iter()
        .filter(|r| matches!(r, Err(SessionError::AlreadyProcessing)))
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(busy, 1);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    assert!(!orchestrator.is_processing());

    let session = orchestrator.current_session().await.unwrap();
    assert_eq!(session.messages.len(), 1);
    assert_eq!(session.current_iteration, 1);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let provider = Arc::new(MockProvider::new("ok"));
    let (orchestrator, store) = orchestrator_with(provider);
    let id = orchestrator.start(request(&["A", "B"], 4)).await.unwrap().session.id;

    let first = orchestrator.stop(&id, StopReason::Manual).await.unwrap();
    assert_eq!(first.status, SessionStatus::Stopped);
    assert!(!first.already_terminal);

    let second = orchestrator.stop(&id, StopReason::Completed).await.unwrap();
    assert_eq!(second.status, SessionStatus::Stopped);
    assert!(second.already_terminal);

    let stored = store.load_session(&id).await.unwrap().unwrap();
    assert_eq!(stored.record.status, SessionStatus::Stopped);

    let err = orchestrator.send_next_message(&id, None).await.unwrap_err();
    assert_eq!(err, SessionError::SessionNotRunning(SessionStatus::Stopped));
}

#[tokio::test]
async fn test_stop_during_in_flight_turn_blocks_later_turns() {
    let provider = Arc::new(MockProvider::new("ok").with_delay(Duration::from_millis(100)));
    let (orchestrator, store) = orchestrator_with(provider.clone());
    let id = orchestrator.start(request(&["A", "B"], 3)).await.unwrap().session.id;

    let (sent, stopped) = tokio::join!(orchestrator.send_next_message(&id, None), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        orchestrator.stop(&id, StopReason::Manual).await
    });

    // The call already in flight still lands.
    assert_eq!(sent.unwrap().iteration, 1);
    assert_eq!(stopped.unwrap().status, SessionStatus::Stopped);

    let session = orchestrator.current_session().await.unwrap();
    assert_eq!(session.status, SessionStatus::Stopped);
    assert_eq!(session.current_iteration, 1);

    let stored = store.load_session(&id).await.unwrap().unwrap();
    assert_eq!(stored.record.status, SessionStatus::Stopped);
    assert_eq!(stored.messages.len(), 1);

    assert_eq!(
        orchestrator.send_next_message(&id, None).await.unwrap_err(),
        SessionError::SessionNotRunning(SessionStatus::Stopped)
    );
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_during_final_turn_does_not_complete() {
    let provider = Arc::new(MockProvider::new("ok").with_delay(Duration::from_millis(100)));
    let (orchestrator, store) = orchestrator_with(provider);
    let id = orchestrator.start(request(&["A", "B"], 1)).await.unwrap().session.id;

    let (sent, stopped) = tokio::join!(orchestrator.send_next_message(&id, None), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        orchestrator.stop(&id, StopReason::Timeout).await
    });
    assert!(sent.is_ok());
    assert!(stopped.is_ok());

    let session = orchestrator.current_session().await.unwrap();
    assert_eq!(session.status, SessionStatus::Stopped);
    assert_eq!(session.current_iteration, 1);
    let stored = store.load_session(&id).await.unwrap().unwrap();
    assert_eq!(stored.record.status, SessionStatus::Stopped);
}

#[tokio::test]
async fn test_stop_with_completed_reason() {
    let provider = Arc::new(MockProvider::new("ok"));
    let (orchestrator, _store) = orchestrator_with(provider);
    let id = orchestrator.start(request(&["A", "B"], 4)).await.unwrap().session.id;

    let outcome = orchestrator.stop(&id, StopReason::Completed).await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_stop_unknown_session() {
    let provider = Arc::new(MockProvider::new("ok"));
    let (orchestrator, _store) = orchestrator_with(provider);
    let err = orchestrator.stop("nope", StopReason::Manual).await.unwrap_err();
    assert_eq!(err, SessionError::SessionNotFound("nope".to_string()));
}

#[tokio::test]
async fn test_start_validation() {
    let provider = Arc::new(MockProvider::new("ok"));
    let (orchestrator, store) = orchestrator_with(provider);

    let cases = vec![
        request(&["A"], 3),
        request(&["A", "B", "C", "D", "E", "F"], 3),
        request(&["Ada", "ADA"], 3),
        request(&["A", " "], 3),
        request(&["A", "B"], 0),
        StartRequest::new("   ", "debate", request(&["A", "B"], 3).participants, 3),
    ];
    for case in cases {
        let err = orchestrator.start(case).await.unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)), "got {:?}", err);
    }

    let mut hot = request(&["A", "B"], 3);
    hot.participants[1] = ParticipantSpec::new("B", "openai", "mock-model").with_temperature(2.5);
    assert!(matches!(
        orchestrator.start(hot).await.unwrap_err(),
        SessionError::Validation(_)
    ));

    assert!(store.is_empty());
    assert!(orchestrator.current_session().await.is_none());
}

#[tokio::test]
async fn test_start_rejects_unavailable_providers() {
    let provider = Arc::new(MockProvider::new("ok"));
    let (orchestrator, _store) = orchestrator_with(provider);

    let mut unknown = request(&["A", "B"], 3);
    unknown.participants[0] = ParticipantSpec::new("A", "mistral", "mistral-large");
    assert_eq!(
        orchestrator.start(unknown).await.unwrap_err(),
        SessionError::ProviderUnavailable("mistral".to_string())
    );

    let mut unregistered = request(&["A", "B"], 3);
    unregistered.participants[1] = ParticipantSpec::new("B", "gemini", "gemini-2.5-flash");
    assert_eq!(
        orchestrator.start(unregistered).await.unwrap_err(),
        SessionError::ProviderUnavailable("google".to_string())
    );
}

#[tokio::test]
async fn test_estimated_cost() {
    let provider = Arc::new(MockProvider::new("ok"));
    let (orchestrator, _store) = orchestrator_with(provider);
    let started = orchestrator.start(request(&["A", "B"], 3)).await.unwrap();
    // 0.001 USD/token * 500 tokens/turn * 3 turns
    assert!((started.estimated_cost - 1.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_shared_shorthand_is_tracked() {
    let provider = Arc::new(MockProvider::new("ok").with_script(vec![
        reply("Let's use [fx: fast execution] for the rollout.", 100, 40),
        reply("Agreed, fx it. [fx: fast execution]", 100, 20),
    ]));
    let (orchestrator, _store) = orchestrator_with(provider.clone());
    let id = orchestrator.start(request(&["A", "B"], 4)).await.unwrap().session.id;

    orchestrator.send_next_message(&id, None).await.unwrap();
    orchestrator.send_next_message(&id, None).await.unwrap();

    let patterns = orchestrator.patterns().await;
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].literal, "fx");
    assert_eq!(patterns[0].kind, PatternKind::Symbol);
    assert_eq!(patterns[0].meaning, "fast execution");
    assert_eq!(patterns[0].adoption_count, 2);
    assert_eq!(patterns[0].introduced_by, "A");
    assert_eq!(orchestrator.communication_level().await, CommunicationLevel::Basic);

    // The third turn sees the pattern note and guidance.
    orchestrator.send_next_message(&id, None).await.unwrap();
    let request = provider.last_request();
    assert_eq!(request.context[0].role, Role::System);
    assert!(request.context[0].content.contains("fx = fast execution"));
    assert!(request.prompt.contains("fx"));
}

#[tokio::test]
async fn test_translation_and_markers_are_recorded() {
    let provider = Arc::new(MockProvider::new("ok").with_script(vec![reply(
        "SYNC→ACK::done [translation: synchronized and acknowledged]",
        20,
        10,
    )]));
    let (orchestrator, _store) = orchestrator_with(provider);
    let id = orchestrator.start(request(&["A", "B"], 2)).await.unwrap().session.id;

    let message = orchestrator.send_next_message(&id, None).await.unwrap();
    assert_eq!(
        message.translation.as_deref(),
        Some("synchronized and acknowledged")
    );
    assert!(message.evolution_markers.contains(&EvolutionMarker::ArrowNotation));
    assert!(message.evolution_markers.contains(&EvolutionMarker::DoubleColon));
    assert!(!message.evolution_markers.contains(&EvolutionMarker::CapsCompression));
    assert!(message.processing_time_ms.is_some());
}

#[tokio::test]
async fn test_context_window_and_output_budget() {
    let provider = Arc::new(MockProvider::new("ok"));
    let (orchestrator, _store) = orchestrator_with(provider.clone());
    let mut req = request(&["A", "B"], 6);
    req.participants[0] = ParticipantSpec::new("A", "openai", "mock-model")
        .with_config(serde_json::json!({"max_tokens": 64}));
    let id = orchestrator.start(req).await.unwrap().session.id;

    for _ in 0..4 {
        orchestrator.send_next_message(&id, None).await.unwrap();
    }

    // Turn 5 belongs to A.
    orchestrator.send_next_message(&id, Some(2)).await.unwrap();
    let request = provider.last_request();
    assert_eq!(request.max_tokens, 64);
    assert_eq!(request.context.len(), 2);
    assert_eq!(request.context[0].role, Role::Assistant);
    assert!(request.context[0].content.starts_with("[A]: "));
    assert_eq!(request.context[1].role, Role::User);
    assert!(request.context[1].content.starts_with("[B]: "));

    // Turn 6 belongs to B, which uses the configured default.
    orchestrator.send_next_message(&id, None).await.unwrap();
    let request = provider.last_request();
    assert_eq!(request.max_tokens, 1024);
    assert_eq!(request.context.len(), 5);
}

#[tokio::test]
async fn test_load_replays_history() {
    let provider = Arc::new(MockProvider::new("ok").with_script(vec![
        reply("[fx: fast execution] first", 10, 10),
        reply("ACK: fx works", 10, 10),
    ]));
    let (orchestrator, store) = orchestrator_with(provider.clone());
    let id = orchestrator.start(request(&["A", "B", "C"], 6)).await.unwrap().session.id;
    orchestrator.send_next_message(&id, None).await.unwrap();
    orchestrator.send_next_message(&id, None).await.unwrap();

    let resumed = SessionOrchestrator::new(
        registry_with(provider),
        store.clone(),
        OrchestratorConfig::default(),
    );
    let snapshot = resumed.load(&id).await.unwrap();
    assert_eq!(snapshot.status, SessionStatus::Running);
    assert_eq!(snapshot.current_iteration, 2);
    assert_eq!(snapshot.messages.len(), 2);
    assert_eq!(snapshot.analytics.total_tokens, 40);

    let patterns = resumed.patterns().await;
    assert_eq!(patterns.len(), 2);
    assert_eq!(patterns[0].literal, "fx");
    assert_eq!(patterns[1].literal, "ACK");

    let next = resumed.send_next_message(&id, None).await.unwrap();
    assert_eq!(next.iteration, 3);
    assert_eq!(next.participant_name, "C");
}

#[tokio::test]
async fn test_load_treats_idle_record_as_running() {
    let provider = Arc::new(MockProvider::new("ok"));
    let (orchestrator, store) = orchestrator_with(provider);
    let now = Utc::now();
    let record = SessionRecord {
        id: "legacy-idle".to_string(),
        status: SessionStatus::Idle,
        topic: "Left behind by an interrupted start".to_string(),
        scenario: "debate".to_string(),
        instruction: None,
        max_iterations: 2,
        current_iteration: 0,
        total_tokens: 0,
        created_at: now,
        updated_at: now,
        completed_at: None,
    };
    let participants: Vec<Participant> = ["A", "B"]
        .iter()
        .map(|name| Participant {
            id: format!("id-{}", name),
            name: name.to_string(),
            provider: ProviderKind::OpenAI,
            model: "mock-model".to_string(),
            temperature: 0.7,
            config: serde_json::Value::Null,
        })
        .collect();
    store.create_session(&record, &participants).await.unwrap();

    let snapshot = orchestrator.load("legacy-idle").await.unwrap();
    assert_eq!(snapshot.status, SessionStatus::Running);
    let message = orchestrator.send_next_message("legacy-idle", None).await.unwrap();
    assert_eq!(message.participant_name, "A");
}

#[tokio::test]
async fn test_start_persists_running_record_in_one_write() {
    let provider = Arc::new(MockProvider::new("ok"));
    let (orchestrator, store) = orchestrator_with(provider);
    let mut feed = store.subscribe();
    let id = orchestrator.start(request(&["A", "B"], 2)).await.unwrap().session.id;

    let stored = store.load_session(&id).await.unwrap().unwrap();
    assert_eq!(stored.record.status, SessionStatus::Running);
    assert_eq!(
        feed.recv().await.unwrap(),
        ChangeEvent::SessionCreated { session_id: id.clone() }
    );
    assert!(feed.try_recv().is_err());
}

#[tokio::test]
async fn test_custom_marker_detectors() {
    fn detect_tilde(text: &str, _iteration: u32) -> Option<EvolutionMarker> {
        text.contains("~~").then_some(EvolutionMarker::SlashNotation)
    }

    let provider = Arc::new(MockProvider::new("plan→ship ~~ done"));
    let store = Arc::new(InMemorySessionStore::new());
    let orchestrator = SessionOrchestrator::new(registry_with(provider), store, OrchestratorConfig::default())
        .with_marker_detectors(vec![detect_tilde]);
    let id = orchestrator.start(request(&["A", "B"], 2)).await.unwrap().session.id;

    let message = orchestrator.send_next_message(&id, None).await.unwrap();
    assert_eq!(message.evolution_markers, vec![EvolutionMarker::SlashNotation]);
}

#[tokio::test]
async fn test_load_unknown_session() {
    let provider = Arc::new(MockProvider::new("ok"));
    let (orchestrator, _store) = orchestrator_with(provider);
    assert_eq!(
        orchestrator.load("missing").await.unwrap_err(),
        SessionError::SessionNotFound("missing".to_string())
    );
}

#[tokio::test]
async fn test_status_and_send_without_live_session() {
    let provider = Arc::new(MockProvider::new("ok"));
    let (orchestrator, store) = orchestrator_with(provider.clone());

    assert_eq!(
        orchestrator.send_next_message("x", None).await.unwrap_err(),
        SessionError::NoSession
    );
    assert_eq!(
        orchestrator.status("x").await.unwrap_err(),
        SessionError::SessionNotFound("x".to_string())
    );

    // A stored but not live session is reported read-only.
    let id = orchestrator.start(request(&["A", "B"], 2)).await.unwrap().session.id;
    orchestrator.send_next_message(&id, None).await.unwrap();
    let other = SessionOrchestrator::new(registry_with(provider), store, OrchestratorConfig::default());
    let report = other.status(&id).await.unwrap();
    assert_eq!(report.session.current_iteration, 1);
    assert_eq!(report.analytics.message_count, 1);
    assert!(other.current_session().await.is_none());
}

#[tokio::test]
async fn test_events_are_emitted_in_order() {
    let provider = Arc::new(MockProvider::new("ok").with_script(vec![reply(
        "[fx: fast execution]",
        10,
        10,
    )]));
    let handler = Arc::new(RecordingHandler::default());
    let store = Arc::new(InMemorySessionStore::new());
    let orchestrator = SessionOrchestrator::new(registry_with(provider), store, OrchestratorConfig::default())
        .with_event_handler(handler.clone());

    let id = orchestrator.start(request(&["A", "B"], 1)).await.unwrap().session.id;
    orchestrator.send_next_message(&id, None).await.unwrap();

    let events = handler.events.lock().unwrap();
    let names: Vec<&str> = events
        .iter()
        .map(|e| match e {
            SessionEvent::SessionStarted { .. } => "started",
            SessionEvent::StatusChanged { .. } => "status",
            SessionEvent::TurnStarted { .. } => "turn_started",
            SessionEvent::TurnCompleted { .. } => "turn_completed",
            SessionEvent::PatternDiscovered { .. } => "pattern",
            SessionEvent::CommunicationLevelChanged { .. } => "level",
            SessionEvent::TurnFailed { .. } => "failed",
            SessionEvent::SessionLoaded { .. } => "loaded",
            SessionEvent::PersistenceFailed { .. } => "persist_failed",
        })
        .collect();
    assert_eq!(
        names,
        vec!["started", "status", "turn_started", "turn_completed", "pattern", "status"]
    );
    assert!(matches!(
        events.last(),
        Some(SessionEvent::StatusChanged {
            to: SessionStatus::Completed,
            ..
        })
    ));
}

#[tokio::test]
async fn test_change_feed_delivers_messages() {
    let provider = Arc::new(MockProvider::new("ok"));
    let (orchestrator, store) = orchestrator_with(provider);
    let mut feed = store.subscribe();

    let id = orchestrator.start(request(&["A", "B"], 2)).await.unwrap().session.id;
    let message = orchestrator.send_next_message(&id, None).await.unwrap();

    assert_eq!(
        feed.recv().await.unwrap(),
        ChangeEvent::SessionCreated { session_id: id.clone() }
    );
    match feed.recv().await.unwrap() {
        ChangeEvent::MessageAppended { message: fed, .. } => assert_eq!(fed.id, message.id),
        other => panic!("unexpected {:?}", other),
    }
}

/// Delegates to an in-memory store but refuses message appends.
struct BrokenAppendStore {
    inner: InMemorySessionStore,
}

#[async_trait]
impl SessionStore for BrokenAppendStore {
    async fn create_session(
        &self,
        record: &SessionRecord,
        participants: &[Participant],
    ) -> Result<(), PersistenceError> {
        self.inner.create_session(record, participants).await
    }

    async fn append_message(
        &self,
        _message: &MessageRecord,
        _rollup: &RollupUpdate,
    ) -> Result<(), PersistenceError> {
        Err(PersistenceError::Io("disk full".to_string()))
    }

    async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        self.inner.update_status(session_id, status, at).await
    }

    async fn save_analytics_snapshot(
        &self,
        session_id: &str,
        analytics: &AnalyticsAggregate,
    ) -> Result<(), PersistenceError> {
        self.inner.save_analytics_snapshot(session_id, analytics).await
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<StoredSession>, PersistenceError> {
        self.inner.load_session(session_id).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.subscribe()
    }
}

#[tokio::test]
async fn test_persistence_failure_is_fatal() {
    let provider = Arc::new(MockProvider::new("ok"));
    let store = Arc::new(BrokenAppendStore {
        inner: InMemorySessionStore::new(),
    });
    let orchestrator = SessionOrchestrator::new(registry_with(provider), store.clone(), OrchestratorConfig::default());
    let id = orchestrator.start(request(&["A", "B"], 3)).await.unwrap().session.id;

    let err = orchestrator.send_next_message(&id, None).await.unwrap_err();
    assert_eq!(err.reason_code(), "persistence");
    assert!(std::error::Error::source(&err).unwrap().to_string().contains("disk full"));

    let session = orchestrator.current_session().await.unwrap();
    assert_eq!(session.status, SessionStatus::Error);
    assert_eq!(session.current_iteration, 0);
    assert!(session.messages.is_empty());

    let stored = store.load_session(&id).await.unwrap().unwrap();
    assert_eq!(stored.record.status, SessionStatus::Error);
    assert!(stored.messages.is_empty());
}

#[tokio::test]
async fn test_starting_again_replaces_live_session() {
    let provider = Arc::new(MockProvider::new("ok"));
    let (orchestrator, store) = orchestrator_with(provider);
    let first = orchestrator.start(request(&["A", "B"], 2)).await.unwrap().session.id;
    let second = orchestrator.start(request(&["C", "D"], 2)).await.unwrap().session.id;
    assert_ne!(first, second);

    assert_eq!(
        orchestrator.send_next_message(&first, None).await.unwrap_err(),
        SessionError::SessionNotFound(first.clone())
    );
    assert_eq!(
        orchestrator.send_next_message(&second, None).await.unwrap().participant_name,
        "C"
    );

    // The released session can still be stopped through the store.
    let outcome = orchestrator.stop(&first, StopReason::Timeout).await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Stopped);
    assert_eq!(
        store.load_session(&first).await.unwrap().unwrap().record.status,
        SessionStatus::Stopped
    );
}

/// Delegates to an in-memory store but refuses the next `failures` status writes.
struct FlakyStatusStore {
    inner: InMemorySessionStore,
    failures: AtomicUsize,
    status_writes: AtomicUsize,
}

impl FlakyStatusStore {
    fn new(failures: usize) -> Self {
        FlakyStatusStore {
            inner: InMemorySessionStore::new(),
            failures: AtomicUsize::new(failures),
            status_writes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionStore for FlakyStatusStore {
    async fn create_session(
        &self,
        record: &SessionRecord,
        participants: &[Participant],
    ) -> Result<(), PersistenceError> {
        self.inner.create_session(record, participants).await
    }

    async fn append_message(
        &self,
        message: &MessageRecord,
        rollup: &RollupUpdate,
    ) -> Result<(), PersistenceError> {
        self.inner.append_message(message, rollup).await
    }

    async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        let refuse = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(PersistenceError::Io("status volume offline".to_string()));
        }
        self.inner.update_status(session_id, status, at).await
    }

    async fn save_analytics_snapshot(
        &self,
        session_id: &str,
        analytics: &AnalyticsAggregate,
    ) -> Result<(), PersistenceError> {
        self.inner.save_analytics_snapshot(session_id, analytics).await
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<StoredSession>, PersistenceError> {
        self.inner.load_session(session_id).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.subscribe()
    }
}

fn persistence_failures(handler: &RecordingHandler) -> Vec<(SessionStatus, PersistenceError)> {
    handler
        .events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            SessionEvent::PersistenceFailed { status, error, .. } => Some((*status, error.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_completion_write_is_retried_once() {
    let provider = Arc::new(MockProvider::new("ok"));
    let store = Arc::new(FlakyStatusStore::new(1));
    let handler = Arc::new(RecordingHandler::default());
    let orchestrator = SessionOrchestrator::new(registry_with(provider), store.clone(), OrchestratorConfig::default())
        .with_event_handler(handler.clone());
    let id = orchestrator.start(request(&["A", "B"], 1)).await.unwrap().session.id;

    orchestrator.send_next_message(&id, None).await.unwrap();

    assert_eq!(store.status_writes.load(Ordering::SeqCst), 2);
    let stored = store.load_session(&id).await.unwrap().unwrap();
    assert_eq!(stored.record.status, SessionStatus::Completed);
    assert!(persistence_failures(&handler).is_empty());
}

#[tokio::test]
async fn test_unpersisted_completion_is_reported() {
    let provider = Arc::new(MockProvider::new("ok"));
    let store = Arc::new(FlakyStatusStore::new(usize::MAX));
    let handler = Arc::new(RecordingHandler::default());
    let orchestrator = SessionOrchestrator::new(registry_with(provider), store.clone(), OrchestratorConfig::default())
        .with_event_handler(handler.clone());
    let id = orchestrator.start(request(&["A", "B"], 1)).await.unwrap().session.id;

    let message = orchestrator.send_next_message(&id, None).await.unwrap();
    assert_eq!(message.iteration, 1);

    assert_eq!(store.status_writes.load(Ordering::SeqCst), 2);
    assert_eq!(
        orchestrator.current_session().await.unwrap().status,
        SessionStatus::Completed
    );
    let stored = store.load_session(&id).await.unwrap().unwrap();
    assert_eq!(stored.record.status, SessionStatus::Running);
    assert_eq!(stored.messages.len(), 1);

    assert_eq!(
        persistence_failures(&handler),
        vec![(
            SessionStatus::Completed,
            PersistenceError::Io("status volume offline".to_string())
        )]
    );
    assert!(matches!(
        handler.events.lock().unwrap().last(),
        Some(SessionEvent::PersistenceFailed { .. })
    ));
}

#[tokio::test]
async fn test_unpersisted_error_status_is_reported() {
    let provider = Arc::new(MockProvider::new("ok").with_script(vec![Err(
        ProviderError::Authentication {
            message: "revoked".to_string(),
        },
    )]));
    let store = Arc::new(FlakyStatusStore::new(usize::MAX));
    let handler = Arc::new(RecordingHandler::default());
    let orchestrator = SessionOrchestrator::new(registry_with(provider), store.clone(), OrchestratorConfig::default())
        .with_event_handler(handler.clone());
    let id = orchestrator.start(request(&["A", "B"], 3)).await.unwrap().session.id;

    let err = orchestrator.send_next_message(&id, None).await.unwrap_err();
    assert_eq!(err.reason_code(), "authentication");
    assert_eq!(
        orchestrator.current_session().await.unwrap().status,
        SessionStatus::Error
    );
    let failures = persistence_failures(&handler);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, SessionStatus::Error);
}
