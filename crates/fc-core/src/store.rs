use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::error::{ErrorKind, Kinded};
use crate::types::{
    valid_commit_hash, Chunk, ChunkType, ExecutionLog, GitCommitRecord, Knowledge, Mode,
    Session, SessionSnapshot, SessionStatus,
};

/// Snapshots kept per session; the oldest are pruned FIFO past this.
pub const MAX_SNAPSHOTS_PER_SESSION: usize = 20;

/// An active session with no update for this long is considered crashed.
pub const STALE_SESSION_HOURS: i64 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("a session is already active for project {0}")]
    ActiveSessionExists(String),
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),
    #[error("invalid commit hash: {0}")]
    InvalidCommitHash(String),
}

impl Kinded for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Db(_) => ErrorKind::Corruption,
            StoreError::ActiveSessionExists(_) | StoreError::InvalidCommitHash(_) => {
                ErrorKind::Validation
            }
            StoreError::SessionNotFound(_) => ErrorKind::Validation,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// helpers: enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

/// Durable per-project state: sessions, snapshots, execution logs, chunks,
/// knowledge, commit records, and monitoring counters.
///
/// Single writer per process; the async connection serializes all access.
/// Cross-project reads are impossible by construction: one store maps to
/// one database file inside one project directory.
pub struct SessionStore {
    conn: Connection,
}

impl SessionStore {
    /// Open (or create) the database at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// A purely in-memory store (tests).
    pub async fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    PRAGMA temp_store=MEMORY;

                    CREATE TABLE IF NOT EXISTS sessions (
                        id          TEXT PRIMARY KEY,
                        project_id  TEXT NOT NULL,
                        mode        TEXT NOT NULL,
                        status      TEXT NOT NULL,
                        started_at  TEXT NOT NULL,
                        ended_at    TEXT,
                        turn_count  INTEGER NOT NULL DEFAULT 0,
                        tokens_used INTEGER NOT NULL DEFAULT 0,
                        updated_at  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_id);
                    CREATE INDEX IF NOT EXISTS idx_sessions_status  ON sessions(status);

                    CREATE TABLE IF NOT EXISTS snapshots (
                        session_id      TEXT NOT NULL,
                        sequence        INTEGER NOT NULL,
                        ephemeral_state TEXT NOT NULL,
                        retrieval_ids   TEXT NOT NULL,
                        mode            TEXT NOT NULL,
                        token_budget    TEXT NOT NULL,
                        last_command    TEXT,
                        created_at      TEXT NOT NULL,
                        PRIMARY KEY (session_id, sequence)
                    );

                    CREATE TABLE IF NOT EXISTS execution_logs (
                        id           INTEGER PRIMARY KEY AUTOINCREMENT,
                        session_id   TEXT NOT NULL,
                        tool_name    TEXT NOT NULL,
                        args_summary TEXT NOT NULL,
                        success      INTEGER NOT NULL,
                        duration_ms  INTEGER NOT NULL,
                        tokens_in    INTEGER NOT NULL,
                        tokens_out   INTEGER NOT NULL,
                        timestamp    TEXT NOT NULL,
                        error        TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_logs_session ON execution_logs(session_id);

                    CREATE TABLE IF NOT EXISTS chunks (
                        project_id   TEXT NOT NULL,
                        path         TEXT NOT NULL,
                        content      TEXT NOT NULL,
                        chunk_type   TEXT NOT NULL,
                        token_count  INTEGER NOT NULL,
                        embedding    TEXT NOT NULL,
                        line_start   INTEGER NOT NULL,
                        line_end     INTEGER NOT NULL,
                        content_hash TEXT NOT NULL,
                        updated_at   TEXT NOT NULL,
                        PRIMARY KEY (path, content_hash, line_start, line_end)
                    );

                    CREATE TABLE IF NOT EXISTS knowledge (
                        key         TEXT PRIMARY KEY,
                        value       TEXT NOT NULL,
                        category    TEXT NOT NULL,
                        importance  REAL NOT NULL,
                        token_count INTEGER NOT NULL,
                        updated_at  TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS git_commits (
                        hash         TEXT PRIMARY KEY,
                        project_id   TEXT NOT NULL,
                        author       TEXT NOT NULL,
                        date         TEXT NOT NULL,
                        message      TEXT NOT NULL,
                        diff_summary TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS counters (
                        name  TEXT PRIMARY KEY,
                        value INTEGER NOT NULL DEFAULT 0
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Start a new session. Fails if the project already has an active one.
    pub async fn start_session(&self, project_id: &str, mode: Mode) -> Result<Session> {
        if let Some(existing) = self.active_session(project_id).await? {
            return Err(StoreError::ActiveSessionExists(existing.project_id));
        }
        let session = Session::new(project_id, mode);
        let s = session.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO sessions (id, project_id, mode, status, started_at,
                        ended_at, turn_count, tokens_used, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    rusqlite::params![
                        s.id.to_string(),
                        s.project_id,
                        enum_to_sql(&s.mode),
                        enum_to_sql(&s.status),
                        s.started_at.to_rfc3339(),
                        s.ended_at.map(|d| d.to_rfc3339()),
                        s.turn_count,
                        s.tokens_used,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(session)
    }

    /// The single active session for a project, if any.
    pub async fn active_session(&self, project_id: &str) -> Result<Option<Session>> {
        let project_id = project_id.to_string();
        let session = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, mode, status, started_at, ended_at,
                            turn_count, tokens_used
                     FROM sessions
                     WHERE project_id = ?1 AND status = 'active'
                     ORDER BY started_at DESC LIMIT 1",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_session(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(session)
    }

    /// End a session, recording final counters.
    pub async fn end_session(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        turn_count: u32,
        tokens_used: u64,
    ) -> Result<()> {
        let updated = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE sessions
                     SET status = ?2, ended_at = ?3, turn_count = ?4,
                         tokens_used = ?5, updated_at = ?3
                     WHERE id = ?1",
                    rusqlite::params![
                        session_id.to_string(),
                        enum_to_sql(&status),
                        Utc::now().to_rfc3339(),
                        turn_count,
                        tokens_used,
                    ],
                )?;
                Ok(n)
            })
            .await?;
        if updated == 0 {
            return Err(StoreError::SessionNotFound(session_id));
        }
        Ok(())
    }

    /// Refresh a running session's progress counters.
    pub async fn touch_session(
        &self,
        session_id: Uuid,
        turn_count: u32,
        tokens_used: u64,
    ) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE sessions
                     SET turn_count = ?2, tokens_used = ?3, updated_at = ?4
                     WHERE id = ?1",
                    rusqlite::params![
                        session_id.to_string(),
                        turn_count,
                        tokens_used,
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Crash-recovery sweep: any active session whose last update is older
    /// than [`STALE_SESSION_HOURS`] is marked crashed. Returns the sessions
    /// that were transitioned.
    pub async fn recover_stale_sessions(&self, project_id: &str) -> Result<Vec<Session>> {
        let cutoff = (Utc::now() - Duration::hours(STALE_SESSION_HOURS)).to_rfc3339();
        let project_id = project_id.to_string();
        let crashed = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, mode, status, started_at, ended_at,
                            turn_count, tokens_used
                     FROM sessions
                     WHERE project_id = ?1 AND status = 'active' AND updated_at < ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_id, cutoff])?;
                let mut stale = Vec::new();
                while let Some(row) = rows.next()? {
                    stale.push(row_to_session(row)?);
                }
                drop(rows);
                drop(stmt);
                for session in &mut stale {
                    conn.execute(
                        "UPDATE sessions SET status='crashed', ended_at=?2, updated_at=?2
                         WHERE id = ?1",
                        rusqlite::params![session.id.to_string(), Utc::now().to_rfc3339()],
                    )?;
                    session.status = SessionStatus::Crashed;
                }
                Ok(stale)
            })
            .await?;
        Ok(crashed)
    }

    /// Most recent sessions across the project, newest first.
    pub async fn recent_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let sessions = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, mode, status, started_at, ended_at,
                            turn_count, tokens_used
                     FROM sessions ORDER BY started_at DESC LIMIT ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![limit as i64])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_session(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(sessions)
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Append a snapshot. The sequence number is assigned inside a single
    /// serialized call, so it is strictly increasing and gap-free; snapshots
    /// beyond [`MAX_SNAPSHOTS_PER_SESSION`] are pruned oldest-first.
    pub async fn snapshot(
        &self,
        session_id: Uuid,
        ephemeral_state: serde_json::Value,
        retrieval_ids: Vec<String>,
        mode: Mode,
        token_budget: serde_json::Value,
        last_command: Option<String>,
    ) -> Result<SessionSnapshot> {
        let snap = self
            .conn
            .call(move |conn| {
                let sid = session_id.to_string();
                let next: u64 = conn
                    .prepare(
                        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM snapshots
                         WHERE session_id = ?1",
                    )?
                    .query_row(rusqlite::params![sid], |r| r.get(0))?;

                let snap = SessionSnapshot {
                    session_id,
                    sequence: next,
                    ephemeral_state,
                    retrieval_ids,
                    mode,
                    token_budget,
                    last_command,
                    created_at: Utc::now(),
                };

                conn.execute(
                    "INSERT INTO snapshots (session_id, sequence, ephemeral_state,
                        retrieval_ids, mode, token_budget, last_command, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                    rusqlite::params![
                        sid,
                        snap.sequence,
                        snap.ephemeral_state.to_string(),
                        serde_json::to_string(&snap.retrieval_ids).expect("serialize ids"),
                        enum_to_sql(&snap.mode),
                        snap.token_budget.to_string(),
                        snap.last_command,
                        snap.created_at.to_rfc3339(),
                    ],
                )?;

                conn.execute(
                    "DELETE FROM snapshots
                     WHERE session_id = ?1
                       AND sequence <= ?2 - ?3",
                    rusqlite::params![sid, next, MAX_SNAPSHOTS_PER_SESSION as i64],
                )?;

                Ok(snap)
            })
            .await?;
        Ok(snap)
    }

    /// The highest-sequence snapshot for a session.
    pub async fn restore_latest(&self, session_id: Uuid) -> Result<Option<SessionSnapshot>> {
        let snap = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, sequence, ephemeral_state, retrieval_ids,
                            mode, token_budget, last_command, created_at
                     FROM snapshots WHERE session_id = ?1
                     ORDER BY sequence DESC LIMIT 1",
                )?;
                let mut rows = stmt.query(rusqlite::params![session_id.to_string()])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_snapshot(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(snap)
    }

    /// Number of retained snapshots for a session.
    pub async fn snapshot_count(&self, session_id: Uuid) -> Result<usize> {
        let n: i64 = self
            .conn
            .call(move |conn| {
                let n = conn
                    .prepare("SELECT COUNT(*) FROM snapshots WHERE session_id = ?1")?
                    .query_row(rusqlite::params![session_id.to_string()], |r| r.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(n as usize)
    }

    // -----------------------------------------------------------------------
    // Execution logs
    // -----------------------------------------------------------------------

    pub async fn record_log(&self, entry: ExecutionLog) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO execution_logs (session_id, tool_name, args_summary,
                        success, duration_ms, tokens_in, tokens_out, timestamp, error)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    rusqlite::params![
                        entry.session_id.to_string(),
                        entry.tool_name,
                        entry.args_summary,
                        entry.success,
                        entry.duration_ms,
                        entry.tokens_in,
                        entry.tokens_out,
                        entry.timestamp.to_rfc3339(),
                        entry.error,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn logs_for_session(&self, session_id: Uuid) -> Result<Vec<ExecutionLog>> {
        let logs = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, tool_name, args_summary, success, duration_ms,
                            tokens_in, tokens_out, timestamp, error
                     FROM execution_logs WHERE session_id = ?1 ORDER BY id ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![session_id.to_string()])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_log(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(logs)
    }

    pub async fn recent_logs(&self, limit: usize) -> Result<Vec<ExecutionLog>> {
        let logs = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, tool_name, args_summary, success, duration_ms,
                            tokens_in, tokens_out, timestamp, error
                     FROM execution_logs ORDER BY id DESC LIMIT ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![limit as i64])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_log(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(logs)
    }

    // -----------------------------------------------------------------------
    // Chunks
    // -----------------------------------------------------------------------

    pub async fn upsert_chunk(&self, chunk: Chunk) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO chunks (project_id, path, content, chunk_type,
                        token_count, embedding, line_start, line_end, content_hash,
                        updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
                     ON CONFLICT(path, content_hash, line_start, line_end) DO UPDATE SET
                        content=excluded.content, chunk_type=excluded.chunk_type,
                        token_count=excluded.token_count, embedding=excluded.embedding,
                        updated_at=excluded.updated_at",
                    rusqlite::params![
                        chunk.project_id,
                        chunk.path,
                        chunk.content,
                        enum_to_sql(&chunk.chunk_type),
                        chunk.token_count,
                        serde_json::to_string(&chunk.embedding).expect("serialize embedding"),
                        chunk.line_start,
                        chunk.line_end,
                        chunk.content_hash,
                        chunk.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn chunks_for_project(&self, project_id: &str) -> Result<Vec<Chunk>> {
        let project_id = project_id.to_string();
        let chunks = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT project_id, path, content, chunk_type, token_count,
                            embedding, line_start, line_end, content_hash, updated_at
                     FROM chunks WHERE project_id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_chunk(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(chunks)
    }

    pub async fn chunk_count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .call(|conn| {
                let n = conn
                    .prepare("SELECT COUNT(*) FROM chunks")?
                    .query_row([], |r| r.get(0))?;
                Ok(n)
            })
            .await?;
        Ok(n as usize)
    }

    // -----------------------------------------------------------------------
    // Knowledge
    // -----------------------------------------------------------------------

    pub async fn upsert_knowledge(&self, k: Knowledge) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO knowledge (key, value, category, importance,
                        token_count, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6)
                     ON CONFLICT(key) DO UPDATE SET
                        value=excluded.value, category=excluded.category,
                        importance=excluded.importance, token_count=excluded.token_count,
                        updated_at=excluded.updated_at",
                    rusqlite::params![
                        k.key,
                        k.value,
                        k.category,
                        k.importance_score,
                        k.token_count,
                        k.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// All knowledge entries, highest importance first.
    pub async fn query_knowledge(&self, category: Option<&str>) -> Result<Vec<Knowledge>> {
        let category = category.map(|c| c.to_string());
        let items = self
            .conn
            .call(move |conn| {
                let mut out = Vec::new();
                match category {
                    Some(cat) => {
                        let mut stmt = conn.prepare(
                            "SELECT key, value, category, importance, token_count, updated_at
                             FROM knowledge WHERE category = ?1
                             ORDER BY importance DESC, updated_at DESC",
                        )?;
                        let mut rows = stmt.query(rusqlite::params![cat])?;
                        while let Some(row) = rows.next()? {
                            out.push(row_to_knowledge(row)?);
                        }
                    }
                    None => {
                        let mut stmt = conn.prepare(
                            "SELECT key, value, category, importance, token_count, updated_at
                             FROM knowledge ORDER BY importance DESC, updated_at DESC",
                        )?;
                        let mut rows = stmt.query([])?;
                        while let Some(row) = rows.next()? {
                            out.push(row_to_knowledge(row)?);
                        }
                    }
                }
                Ok(out)
            })
            .await?;
        Ok(items)
    }

    /// Evict lowest-importance (then oldest) entries until the knowledge
    /// layer fits `max_tokens`. Returns the number of evicted rows.
    pub async fn evict_knowledge_to(&self, max_tokens: usize) -> Result<usize> {
        let removed = self
            .conn
            .call(move |conn| {
                let total: i64 = conn
                    .prepare("SELECT COALESCE(SUM(token_count), 0) FROM knowledge")?
                    .query_row([], |r| r.get(0))?;
                let mut over = (total as i64) - max_tokens as i64;
                if over <= 0 {
                    return Ok(0usize);
                }

                let mut stmt = conn.prepare(
                    "SELECT key, token_count FROM knowledge
                     ORDER BY importance ASC, updated_at ASC",
                )?;
                let victims: Vec<(String, i64)> = stmt
                    .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
                    .collect::<rusqlite::Result<_>>()?;
                drop(stmt);

                let mut removed = 0usize;
                for (key, tokens) in victims {
                    if over <= 0 {
                        break;
                    }
                    conn.execute("DELETE FROM knowledge WHERE key = ?1", rusqlite::params![key])?;
                    over -= tokens;
                    removed += 1;
                }
                Ok(removed)
            })
            .await?;
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Git commits
    // -----------------------------------------------------------------------

    /// Insert a commit record. Invalid hashes are rejected with a typed
    /// error so callers can skip them without aborting ingestion.
    pub async fn insert_commit(&self, commit: GitCommitRecord) -> Result<()> {
        if !valid_commit_hash(&commit.hash) {
            return Err(StoreError::InvalidCommitHash(commit.hash));
        }
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO git_commits
                        (hash, project_id, author, date, message, diff_summary)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    rusqlite::params![
                        commit.hash,
                        commit.project_id,
                        commit.author,
                        commit.date.to_rfc3339(),
                        commit.message,
                        commit.diff_summary,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Commits mentioning any of `paths` in message or diff summary,
    /// oldest first.
    pub async fn commits_for_paths(&self, paths: Vec<String>) -> Result<Vec<GitCommitRecord>> {
        let commits = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT hash, project_id, author, date, message, diff_summary
                     FROM git_commits ORDER BY date ASC, rowid ASC",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let commit = row_to_commit(row)?;
                    if paths.is_empty()
                        || paths.iter().any(|p| {
                            commit.message.contains(p.as_str())
                                || commit.diff_summary.contains(p.as_str())
                        })
                    {
                        out.push(commit);
                    }
                }
                Ok(out)
            })
            .await?;
        Ok(commits)
    }

    // -----------------------------------------------------------------------
    // Counters (monitoring source of truth)
    // -----------------------------------------------------------------------

    pub async fn bump_counter(&self, name: &str, amount: u64) -> Result<()> {
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO counters (name, value) VALUES (?1, ?2)
                     ON CONFLICT(name) DO UPDATE SET value = value + excluded.value",
                    rusqlite::params![name, amount],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn counters(&self) -> Result<HashMap<String, u64>> {
        let map = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT name, value FROM counters")?;
                let mut rows = stmt.query([])?;
                let mut out = HashMap::new();
                while let Some(row) = rows.next()? {
                    let name: String = row.get(0)?;
                    let value: i64 = row.get(1)?;
                    out.insert(name, value as u64);
                }
                Ok(out)
            })
            .await?;
        Ok(map)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let id: String = row.get(0)?;
    let mode: String = row.get(2)?;
    let status: String = row.get(3)?;
    let started_at: String = row.get(4)?;
    let ended_at: Option<String> = row.get(5)?;
    Ok(Session {
        id: Uuid::parse_str(&id).expect("valid uuid"),
        project_id: row.get(1)?,
        mode: enum_from_sql(&mode),
        status: enum_from_sql(&status),
        started_at: parse_ts(&started_at),
        ended_at: ended_at.map(|s| parse_ts(&s)),
        turn_count: row.get(6)?,
        tokens_used: row.get(7)?,
    })
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionSnapshot> {
    let sid: String = row.get(0)?;
    let ephemeral: String = row.get(2)?;
    let retrieval: String = row.get(3)?;
    let mode: String = row.get(4)?;
    let budget: String = row.get(5)?;
    let created_at: String = row.get(7)?;
    Ok(SessionSnapshot {
        session_id: Uuid::parse_str(&sid).expect("valid uuid"),
        sequence: row.get(1)?,
        ephemeral_state: serde_json::from_str(&ephemeral).expect("valid json"),
        retrieval_ids: serde_json::from_str(&retrieval).expect("valid json"),
        mode: enum_from_sql(&mode),
        token_budget: serde_json::from_str(&budget).expect("valid json"),
        last_command: row.get(6)?,
        created_at: parse_ts(&created_at),
    })
}

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionLog> {
    let sid: String = row.get(0)?;
    let timestamp: String = row.get(7)?;
    Ok(ExecutionLog {
        session_id: Uuid::parse_str(&sid).expect("valid uuid"),
        tool_name: row.get(1)?,
        args_summary: row.get(2)?,
        success: row.get(3)?,
        duration_ms: row.get(4)?,
        tokens_in: row.get(5)?,
        tokens_out: row.get(6)?,
        timestamp: parse_ts(&timestamp),
        error: row.get(8)?,
    })
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    let chunk_type: String = row.get(3)?;
    let embedding: String = row.get(5)?;
    let updated_at: String = row.get(9)?;
    Ok(Chunk {
        project_id: row.get(0)?,
        path: row.get(1)?,
        content: row.get(2)?,
        chunk_type: enum_from_sql::<ChunkType>(&chunk_type),
        token_count: row.get::<_, i64>(4)? as usize,
        embedding: serde_json::from_str(&embedding).expect("valid json"),
        line_start: row.get(6)?,
        line_end: row.get(7)?,
        content_hash: row.get(8)?,
        updated_at: parse_ts(&updated_at),
    })
}

fn row_to_knowledge(row: &rusqlite::Row<'_>) -> rusqlite::Result<Knowledge> {
    let updated_at: String = row.get(5)?;
    Ok(Knowledge {
        key: row.get(0)?,
        value: row.get(1)?,
        category: row.get(2)?,
        importance_score: row.get(3)?,
        token_count: row.get::<_, i64>(4)? as usize,
        updated_at: parse_ts(&updated_at),
    })
}

fn row_to_commit(row: &rusqlite::Row<'_>) -> rusqlite::Result<GitCommitRecord> {
    let date: String = row.get(3)?;
    Ok(GitCommitRecord {
        hash: row.get(0)?,
        project_id: row.get(1)?,
        author: row.get(2)?,
        date: parse_ts(&date),
        message: row.get(4)?,
        diff_summary: row.get(5)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
