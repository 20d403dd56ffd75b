use super::{ChangeEvent, MessageRecord, RollupUpdate, SessionRecord, SessionStore, StoredSession, CHANGE_FEED_CAPACITY};
use crate::tokenlingo::error::PersistenceError;
use crate::tokenlingo::session::{AnalyticsAggregate, Participant, SessionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Process-local store. Everything is lost when it is dropped.
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, StoredSession>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        InMemorySessionStore {
            sessions: Mutex::new(HashMap::new()),
            changes,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, StoredSession>>, PersistenceError> {
        self.sessions
            .lock()
            .map_err(|_| PersistenceError::Io("in-memory session map is poisoned".to_string()))
    }

    fn publish(&self, event: ChangeEvent) {
        // No subscribers is not an error.
        let _ = self.changes.send(event);
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(
        &self,
        record: &SessionRecord,
        participants: &[Participant],
    ) -> Result<(), PersistenceError> {
        {
            let mut sessions = self.lock()?;
            if sessions.contains_key(&record.id) {
                return Err(PersistenceError::Conflict(format!(
                    "session {} already exists",
                    record.id
                )));
            }
            sessions.insert(
                record.id.clone(),
                StoredSession::new(record.clone(), participants.to_vec()),
            );
        }
        self.publish(ChangeEvent::SessionCreated {
            session_id: record.id.clone(),
        });
        Ok(())
    }

    async fn append_message(
        &self,
        message: &MessageRecord,
        rollup: &RollupUpdate,
    ) -> Result<(), PersistenceError> {
        {
            let mut sessions = self.lock()?;
            let stored = sessions
                .get_mut(&message.session_id)
                .ok_or_else(|| PersistenceError::NotFound(message.session_id.clone()))?;
            stored.check_append(message, rollup)?;
            stored.apply_message(message.clone(), rollup);
        }
        self.publish(ChangeEvent::MessageAppended {
            session_id: message.session_id.clone(),
            message: message.clone(),
        });
        Ok(())
    }

    async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        {
            let mut sessions = self.lock()?;
            let stored = sessions
                .get_mut(session_id)
                .ok_or_else(|| PersistenceError::NotFound(session_id.to_string()))?;
            stored.apply_status(status, at);
        }
        self.publish(ChangeEvent::StatusChanged {
            session_id: session_id.to_string(),
            status,
        });
        Ok(())
    }

    async fn save_analytics_snapshot(
        &self,
        session_id: &str,
        analytics: &AnalyticsAggregate,
    ) -> Result<(), PersistenceError> {
        let mut sessions = self.lock()?;
        let stored = sessions
            .get_mut(session_id)
            .ok_or_else(|| PersistenceError::NotFound(session_id.to_string()))?;
        stored.analytics_snapshot = Some(analytics.clone());
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<StoredSession>, PersistenceError> {
        Ok(self.lock()?.get(session_id).cloned())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}
