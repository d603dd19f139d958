//! Durable session store.
//!
//! Each session is a JSON metadata file plus an append-only JSONL history.
//! File locks keep concurrent server instances sharing one directory from
//! corrupting either file.

use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use parley_protocol::HistoryMessage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_SESSION_ID_LEN: usize = 128;

/// Lifecycle of a stored session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }
}

/// Stored session metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: i64,
    pub last_activity: i64,
}

impl StoredSession {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Invalid session id: {0:?}")]
    InvalidId(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt session record: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Session ids become file names, so only a conservative alphabet is allowed.
pub fn validate_session_id(id: &str) -> StorageResult<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidId(id.to_string()))
    }
}

/// Session storage manager.
#[derive(Debug)]
pub struct SessionStorage {
    sessions_dir: PathBuf,
    history_dir: PathBuf,
}

impl SessionStorage {
    /// Opens (and creates if needed) a store rooted at `base_dir`.
    pub fn new(base_dir: impl AsRef<Path>) -> StorageResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let sessions_dir = base_dir.join("sessions");
        let history_dir = base_dir.join("history");

        fs::create_dir_all(&sessions_dir)?;
        fs::create_dir_all(&history_dir)?;

        info!("Session storage initialized at {:?}", base_dir);

        Ok(Self {
            sessions_dir,
            history_dir,
        })
    }

    /// Creates a new active session with a fresh id.
    pub fn create_session(&self) -> StorageResult<StoredSession> {
        let now = chrono::Utc::now().timestamp();
        let session = StoredSession {
            id: Uuid::new_v4().to_string(),
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
        };
        self.save_session(&session)?;
        info!(session_id = %session.id, "Created session");
        Ok(session)
    }

    /// Writes session metadata under an exclusive lock.
    pub fn save_session(&self, session: &StoredSession) -> StorageResult<()> {
        validate_session_id(&session.id)?;
        let path = self.session_path(&session.id);
        // Truncated only once the lock is held.
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        file.lock_exclusive()?;
        let result = write_metadata(&file, session);
        file.unlock()?;

        result?;
        debug!("Saved session {} to {:?}", session.id, path);
        Ok(())
    }

    /// Loads, modifies and rewrites session metadata under one exclusive
    /// lock. `update` returns whether anything changed.
    fn update_session<F>(&self, id: &str, update: F) -> StorageResult<StoredSession>
    where
        F: FnOnce(&mut StoredSession) -> bool,
    {
        validate_session_id(id)?;
        let path = self.session_path(id);
        let file = match fs::OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        file.lock_exclusive()?;
        let result = update_metadata(&file, update);
        file.unlock()?;

        result
    }

    /// Reads session metadata under a shared lock.
    pub fn load_session(&self, id: &str) -> StorageResult<StoredSession> {
        validate_session_id(id)?;
        let path = self.session_path(id);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        file.lock_shared()?;
        let result = serde_json::from_reader(BufReader::new(&file));
        file.unlock()?;

        Ok(result?)
    }

    /// Marks a session ended. Ending an ended session is a no-op.
    pub fn mark_ended(&self, id: &str) -> StorageResult<StoredSession> {
        self.update_session(id, |session| {
            if !session.is_active() {
                return false;
            }
            session.status = SessionStatus::Ended;
            session.last_activity = chrono::Utc::now().timestamp();
            info!(session_id = %session.id, "Session ended");
            true
        })
    }

    /// Bumps the last activity timestamp of an active session. Ended
    /// sessions are left untouched.
    pub fn touch(&self, id: &str) -> StorageResult<()> {
        self.update_session(id, |session| {
            if !session.is_active() {
                return false;
            }
            session.last_activity = chrono::Utc::now().timestamp();
            true
        })?;
        Ok(())
    }

    /// Appends one message to the session history (JSONL).
    ///
    /// The write is fsynced before returning so an acknowledged message
    /// survives a crash.
    pub fn append_message(&self, session_id: &str, message: &HistoryMessage) -> StorageResult<()> {
        validate_session_id(session_id)?;
        let path = self.history_path(session_id);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        file.lock_exclusive()?;

        let json = serde_json::to_string(message)?;
        let mut writer = &file;
        let written = writeln!(writer, "{json}").and_then(|()| file.sync_all());

        file.unlock()?;
        written?;

        debug!(session_id = %session_id, ordinal = ?message.ordinal, "Appended message");
        Ok(())
    }

    /// Reads the full ordered history. Records without an ordinal get their
    /// position in the file.
    pub fn read_history(&self, session_id: &str) -> StorageResult<Vec<HistoryMessage>> {
        validate_session_id(session_id)?;
        let path = self.history_path(session_id);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        file.lock_shared()?;
        let mut messages = Vec::new();
        let mut read = Ok(());
        for line in BufReader::new(&file).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    read = Err(e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryMessage>(&line) {
                Ok(mut message) => {
                    if message.ordinal.is_none() {
                        message.ordinal = Some(messages.len() as u64);
                    }
                    messages.push(message);
                }
                Err(e) => warn!(session_id = %session_id, "Skipping unreadable history line: {e}"),
            }
        }
        file.unlock()?;
        read?;

        Ok(messages)
    }

    /// All stored sessions, most recently active first.
    pub fn list_sessions(&self) -> StorageResult<Vec<StoredSession>> {
        let mut sessions = Vec::new();

        for entry in fs::read_dir(&self.sessions_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                match Self::load_session_from_path(&path) {
                    Ok(session) => sessions.push(session),
                    Err(e) => warn!("Failed to load session from {:?}: {}", path, e),
                }
            }
        }

        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    /// Removes a session and its history.
    pub fn delete_session(&self, id: &str) -> StorageResult<()> {
        validate_session_id(id)?;
        for path in [self.session_path(id), self.history_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(session_id = %id, "Deleted session");
        Ok(())
    }

    /// Deletes ended sessions whose last activity is older than `older_than`.
    /// Returns how many were removed.
    pub fn cleanup_ended(&self, older_than: Duration) -> StorageResult<usize> {
        let cutoff = chrono::Utc::now().timestamp() - older_than.as_secs() as i64;
        let mut removed = 0;
        for session in self.list_sessions()? {
            if session.status == SessionStatus::Ended && session.last_activity < cutoff {
                self.delete_session(&session.id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{id}.json"))
    }

    fn history_path(&self, id: &str) -> PathBuf {
        self.history_dir.join(format!("{id}.jsonl"))
    }

    fn load_session_from_path(path: &Path) -> StorageResult<StoredSession> {
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

/// Replaces the content of a locked metadata file.
fn write_metadata(mut file: &fs::File, session: &StoredSession) -> StorageResult<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, session)?;
    writer.flush()?;
    Ok(())
}

fn update_metadata<F>(file: &fs::File, update: F) -> StorageResult<StoredSession>
where
    F: FnOnce(&mut StoredSession) -> bool,
{
    let mut session: StoredSession = serde_json::from_reader(BufReader::new(file))?;
    if update(&mut session) {
        write_metadata(file, &session)?;
    }
    Ok(session)
}
