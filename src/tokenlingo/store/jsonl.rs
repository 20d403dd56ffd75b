//! Append-only JSONL persistence.
//!
//! Each session lives in `{session_dir}/{session_id}.jsonl`. Every line is a [`StoreLine`]: a
//! tagged entry plus a SHA-256 hash chained to the previous line. A message line embeds its
//! rollup, so one `write` carries the whole "append message + update rollups" step.
//!
//! | Field | Description |
//! |---|---|
//! | `index` | 0-based line number |
//! | `prevHash` | hash of the preceding line (empty for the first) |
//! | `hash` | SHA-256 hex of `index|prevHash|entry` |
//! | `entry` | `session`, `participants`, `message`, `status` or `analytics` |
//!
//! The hash covers the entry's canonical JSON (object keys sorted), so a reader can verify a
//! line without knowing the writer's field order.
//!
//! Only newline-terminated lines count. A crash mid-write leaves an unterminated tail; readers
//! ignore it and the next write truncates it before appending. A terminated line that does not
//! parse is an integrity failure.

use super::{ChangeEvent, MessageRecord, RollupUpdate, SessionRecord, SessionStore, StoredSession, CHANGE_FEED_CAPACITY};
use crate::tokenlingo::config::OrchestratorConfig;
use crate::tokenlingo::error::PersistenceError;
use crate::tokenlingo::session::{AnalyticsAggregate, Participant, SessionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StoreEntry {
    Session {
        record: SessionRecord,
    },
    Participants {
        participants: Vec<Participant>,
    },
    Message {
        message: MessageRecord,
        rollup: RollupUpdate,
    },
    Status {
        status: SessionStatus,
        at: DateTime<Utc>,
    },
    Analytics {
        analytics: AnalyticsAggregate,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreLine {
    index: u64,
    prev_hash: String,
    hash: String,
    entry: Value,
}

fn compute_line_hash(index: u64, prev_hash: &str, entry: &Value) -> String {
    let canonical = format!("{}|{}|{}", index, prev_hash, entry);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

const MAX_SESSION_ID_LEN: usize = 128;

/// File name for a session id.
///
/// Ids must be 1 to 128 ASCII alphanumerics, `-` or `_`. Anything else is rejected instead of
/// rewritten, so two ids can never map to the same file.
pub fn session_filename(session_id: &str) -> Result<String, PersistenceError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(PersistenceError::InvalidId(session_id.to_string()));
    }
    Ok(format!("{}.jsonl", session_id))
}

struct SessionFile {
    path: PathBuf,
    state: StoredSession,
    next_index: u64,
    last_hash: String,
    /// Bytes of complete, verified lines on disk.
    len: u64,
}

impl SessionFile {
    /// Serialize `entries` as consecutive chained lines.
    fn encode(&self, entries: &[StoreEntry]) -> Result<(String, u64, String), PersistenceError> {
        let mut buffer = String::new();
        let mut index = self.next_index;
        let mut prev_hash = self.last_hash.clone();
        for entry in entries {
            let entry = serde_json::to_value(entry)?;
            let hash = compute_line_hash(index, &prev_hash, &entry);
            let line = StoreLine {
                index,
                prev_hash,
                hash: hash.clone(),
                entry,
            };
            buffer.push_str(&serde_json::to_string(&line)?);
            buffer.push('\n');
            index += 1;
            prev_hash = hash;
        }
        Ok((buffer, index, prev_hash))
    }

    /// Append `entries` with a single write, then advance the chain head.
    ///
    /// Bytes past the last complete line are dropped first. A failed write is truncated back
    /// to the previous length so the file never ends in a partial line we wrote.
    fn write(&mut self, entries: &[StoreEntry]) -> Result<(), PersistenceError> {
        let (buffer, next_index, last_hash) = self.encode(entries)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let on_disk = file.metadata()?.len();
        if on_disk < self.len {
            return Err(PersistenceError::Integrity(format!(
                "{} shrank from {} to {} bytes",
                self.path.display(),
                self.len,
                on_disk
            )));
        }
        if on_disk > self.len {
            log::warn!(
                "tokenlingo::store::jsonl::write: discarding {} unterminated bytes at the end of {}",
                on_disk - self.len,
                self.path.display()
            );
            file.set_len(self.len)?;
        }

        if let Err(err) = file
            .write_all(buffer.as_bytes())
            .and_then(|_| file.flush())
        {
            if let Err(rollback) = file.set_len(self.len) {
                log::error!(
                    "tokenlingo::store::jsonl::write: could not roll back {}: {}",
                    self.path.display(),
                    rollback
                );
            }
            return Err(err.into());
        }

        self.len += buffer.len() as u64;
        self.next_index = next_index;
        self.last_hash = last_hash;
        Ok(())
    }
}

/// Parsed contents of a session file.
struct FileContents {
    lines: Vec<StoreLine>,
    /// Length of the newline-terminated prefix.
    valid_len: u64,
    /// Unterminated bytes after `valid_len`.
    torn_len: u64,
}

fn read_lines(path: &Path) -> Result<FileContents, PersistenceError> {
    let bytes = fs::read(path)?;
    let valid_len = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|end| end + 1)
        .unwrap_or(0);
    let text = std::str::from_utf8(&bytes[..valid_len]).map_err(|err| {
        PersistenceError::Integrity(format!("{} is not UTF-8: {}", path.display(), err))
    })?;

    let mut lines = Vec::new();
    for (number, raw) in text.lines().enumerate() {
        if raw.trim().is_empty() {
            continue;
        }
        let line = serde_json::from_str::<StoreLine>(raw).map_err(|err| {
            PersistenceError::Integrity(format!(
                "{} line {} is unreadable: {}",
                path.display(),
                number + 1,
                err
            ))
        })?;
        lines.push(line);
    }
    Ok(FileContents {
        lines,
        valid_len: valid_len as u64,
        torn_len: (bytes.len() - valid_len) as u64,
    })
}

fn chain_is_intact(lines: &[StoreLine]) -> bool {
    let mut prev_hash = String::new();
    for (position, line) in lines.iter().enumerate() {
        if line.index != position as u64 || line.prev_hash != prev_hash {
            return false;
        }
        if line.hash != compute_line_hash(line.index, &line.prev_hash, &line.entry) {
            return false;
        }
        prev_hash = line.hash.clone();
    }
    true
}

/// Rebuild a session by replaying its verified lines.
fn replay(path: &Path, contents: FileContents) -> Result<SessionFile, PersistenceError> {
    let FileContents {
        lines,
        valid_len,
        torn_len,
    } = contents;
    if torn_len > 0 {
        log::warn!(
            "tokenlingo::store::jsonl::replay: {} ends with {} unterminated bytes; ignoring them",
            path.display(),
            torn_len
        );
    }
    if !chain_is_intact(&lines) {
        return Err(PersistenceError::Integrity(format!(
            "hash chain broken in {}",
            path.display()
        )));
    }
    let next_index = lines.len() as u64;
    let last_hash = lines.last().map(|l| l.hash.clone()).unwrap_or_default();

    let mut state: Option<StoredSession> = None;
    for line in lines {
        let entry: StoreEntry = serde_json::from_value(line.entry)?;
        match (entry, state.as_mut()) {
            (StoreEntry::Session { record }, None) => {
                state = Some(StoredSession::new(record, Vec::new()));
            }
            (StoreEntry::Participants { participants }, Some(stored)) => {
                *stored = StoredSession::new(stored.record.clone(), participants);
            }
            (StoreEntry::Message { message, rollup }, Some(stored)) => {
                stored.check_append(&message, &rollup)?;
                stored.apply_message(message, &rollup);
            }
            (StoreEntry::Status { status, at }, Some(stored)) => stored.apply_status(status, at),
            (StoreEntry::Analytics { analytics }, Some(stored)) => {
                stored.analytics_snapshot = Some(analytics);
            }
            (_, _) => {
                return Err(PersistenceError::Integrity(format!(
                    "{} line {} is out of order",
                    path.display(),
                    line.index
                )))
            }
        }
    }

    let state = state.ok_or_else(|| {
        PersistenceError::Integrity(format!("{} has no session header", path.display()))
    })?;
    Ok(SessionFile {
        path: path.to_path_buf(),
        state,
        next_index,
        last_hash,
        len: valid_len,
    })
}

/// Durable store backed by one hash-chained `.jsonl` file per session.
///
/// ```rust,no_run
/// use tokenlingo::store::{JsonlSessionStore, SessionStore};
///
/// # async fn demo() -> Result<(), tokenlingo::error::PersistenceError> {
/// let store = JsonlSessionStore::open("sessions")?;
/// if let Some(stored) = store.load_session("3f2a9c1e").await? {
///     println!("{} messages", stored.messages.len());
/// }
/// # Ok(())
/// # }
/// ```
///
/// Sessions are cached while live and dropped from the cache once they reach a terminal
/// status; later reads replay the file again.
pub struct JsonlSessionStore {
    dir: PathBuf,
    open_files: Mutex<HashMap<String, SessionFile>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl JsonlSessionStore {
    /// Use `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(JsonlSessionStore {
            dir,
            open_files: Mutex::new(HashMap::new()),
            changes,
        })
    }

    /// Use the `session_dir` of `config`.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self, PersistenceError> {
        Self::open(config.session_dir.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session_path(&self, session_id: &str) -> Result<PathBuf, PersistenceError> {
        Ok(self.dir.join(session_filename(session_id)?))
    }

    /// Sessions currently held in memory.
    pub fn open_session_count(&self) -> usize {
        self.lock().map(|files| files.len()).unwrap_or(0)
    }

    /// Re-read the session file from disk and check every hash link.
    ///
    /// A file with an unterminated tail or an unreadable line does not verify.
    pub fn verify_integrity(&self, session_id: &str) -> Result<bool, PersistenceError> {
        let path = self.session_path(session_id)?;
        if !path.exists() {
            return Err(PersistenceError::NotFound(session_id.to_string()));
        }
        match read_lines(&path) {
            Ok(contents) => Ok(contents.torn_len == 0 && chain_is_intact(&contents.lines)),
            Err(PersistenceError::Integrity(_)) => Ok(false),
            Err(other) => Err(other),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, SessionFile>>, PersistenceError> {
        self.open_files
            .lock()
            .map_err(|_| PersistenceError::Io("session file table is poisoned".to_string()))
    }

    /// Run `f` on the session's open file, loading it from disk first if needed.
    fn with_file<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionFile) -> Result<T, PersistenceError>,
    ) -> Result<T, PersistenceError> {
        let mut files = self.lock()?;
        if !files.contains_key(session_id) {
            let path = self.session_path(session_id)?;
            if !path.exists() {
                return Err(PersistenceError::NotFound(session_id.to_string()));
            }
            let file = replay(&path, read_lines(&path)?)?;
            files.insert(session_id.to_string(), file);
        }
        let (result, finished) = match files.get_mut(session_id) {
            Some(file) => {
                let result = f(file);
                (result, file.state.record.status.is_terminal())
            }
            None => return Err(PersistenceError::NotFound(session_id.to_string())),
        };
        if finished {
            files.remove(session_id);
        }
        result
    }

    fn publish(&self, event: ChangeEvent) {
        let _ = self.changes.send(event);
    }
}

#[async_trait]
impl SessionStore for JsonlSessionStore {
    async fn create_session(
        &self,
        record: &SessionRecord,
        participants: &[Participant],
    ) -> Result<(), PersistenceError> {
        {
            let mut files = self.lock()?;
            let path = self.session_path(&record.id)?;
            if files.contains_key(&record.id) || path.exists() {
                return Err(PersistenceError::Conflict(format!(
                    "session {} already exists",
                    record.id
                )));
            }
            let mut file = SessionFile {
                path,
                state: StoredSession::new(record.clone(), participants.to_vec()),
                next_index: 0,
                last_hash: String::new(),
                len: 0,
            };
            file.write(&[
                StoreEntry::Session {
                    record: record.clone(),
                },
                StoreEntry::Participants {
                    participants: participants.to_vec(),
                },
            ])?;
            log::debug!(
                "tokenlingo::store::jsonl: created {}",
                file.path.display()
            );
            files.insert(record.id.clone(), file);
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
        self.with_file(&message.session_id, |file| {
            file.state.check_append(message, rollup)?;
            file.write(&[StoreEntry::Message {
                message: message.clone(),
                rollup: rollup.clone(),
            }])?;
            file.state.apply_message(message.clone(), rollup);
            Ok(())
        })?;
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
        self.with_file(session_id, |file| {
            file.write(&[StoreEntry::Status { status, at }])?;
            file.state.apply_status(status, at);
            Ok(())
        })?;
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
        self.with_file(session_id, |file| {
            file.write(&[StoreEntry::Analytics {
                analytics: analytics.clone(),
            }])?;
            file.state.analytics_snapshot = Some(analytics.clone());
            Ok(())
        })
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<StoredSession>, PersistenceError> {
        match self.with_file(session_id, |file| Ok(file.state.clone())) {
            Ok(stored) => Ok(Some(stored)),
            Err(PersistenceError::NotFound(_)) | Err(PersistenceError::InvalidId(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}
