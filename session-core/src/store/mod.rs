//! SQLite-backed durable store for all session state
//!
//! A single-file embedded database holds sessions, iterations, tool calls,
//! stream events, threads, merge history, and batch runs. All access goes
//! through a single-writer mutex; every public method is one transaction, so
//! partial writes are impossible by construction.

pub mod schema;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

pub use types::*;

/// Default stream-event retention, in days.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying database I/O failed.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A constraint was violated; the caller may retry or report.
    #[error("store conflict: {0}")]
    Conflict(String),

    /// The database schema is newer than this build supports, or corrupt.
    #[error("incompatible schema: found version {found}, supported up to {supported}")]
    SchemaIncompatible { found: i64, supported: i64 },

    #[error("not found: {0}")]
    NotFound(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a store.
pub type SharedStore = Arc<Store>;

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(code, msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(msg.clone().unwrap_or_else(|| code.to_string()))
            }
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::NotADatabase =>
            {
                StoreError::SchemaIncompatible {
                    found: -1,
                    supported: schema::CURRENT_VERSION,
                }
            }
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

/// Tunables applied at open time.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Stream events older than this are pruned during open.
    pub retention_days: i64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

/// Single-writer handle to the embedded database.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Open or create the database, applying pending migrations and the
    /// retention sweep.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("cannot create state dir: {e}")))?;
        }
        let mut conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;

        Self::migrate(&mut conn)?;
        Self::sweep_stream_events(&conn, options.retention_days)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn shared(self) -> SharedStore {
        Arc::new(self)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn migrate(conn: &mut Connection) -> StoreResult<()> {
        let found: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        if found > schema::CURRENT_VERSION {
            return Err(StoreError::SchemaIncompatible {
                found,
                supported: schema::CURRENT_VERSION,
            });
        }
        if found == schema::CURRENT_VERSION {
            return Ok(());
        }

        let tx = conn.transaction()?;
        for (i, migration) in schema::MIGRATIONS.iter().enumerate() {
            let version = i as i64 + 1;
            if version <= found {
                continue;
            }
            tx.execute_batch(migration)?;
            debug!(version, "applied store migration");
        }
        tx.execute_batch(&format!("PRAGMA user_version = {}", schema::CURRENT_VERSION))?;
        tx.commit()?;
        info!(from = found, to = schema::CURRENT_VERSION, "store migrated");
        Ok(())
    }

    fn sweep_stream_events(conn: &Connection, retention_days: i64) -> StoreResult<()> {
        let cutoff = (Utc::now() - Duration::days(retention_days)).to_rfc3339();
        let pruned = conn.execute(
            "DELETE FROM stream_events WHERE timestamp < ?1",
            params![cutoff],
        )?;
        if pruned > 0 {
            info!(pruned, retention_days, "pruned expired stream events");
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    pub fn insert_session(&self, session: &Session) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sessions (id, name, initial_prompt, repo_root, base_branch, branch_name,
                 worktree_path, status, mode, script_command, model_override, auto_commit,
                 thread_id, notes, created_at, last_run)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                session.id,
                session.name,
                session.initial_prompt,
                session.repo_root,
                session.base_branch,
                session.branch_name,
                session.worktree_path,
                session.status.as_str(),
                session.mode.as_str(),
                session.script_command,
                session.model_override,
                session.auto_commit,
                session.thread_id,
                session.notes,
                session.created_at.to_rfc3339(),
                session.last_run.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let conn = self.lock();
        let session = conn
            .query_row(
                &format!("{SESSION_SELECT} WHERE id = ?1"),
                params![session_id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    pub fn list_sessions(&self) -> StoreResult<Vec<Session>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{SESSION_SELECT} ORDER BY created_at DESC"))?;
        let rows = stmt.query_map([], session_from_row)?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    pub fn sessions_by_repo(&self, repo_root: &str) -> StoreResult<Vec<Session>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{SESSION_SELECT} WHERE repo_root = ?1 ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![repo_root], session_from_row)?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    pub fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        notes: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.lock();
        let changed = match notes {
            Some(notes) => conn.execute(
                "UPDATE sessions SET status = ?1, notes = ?2 WHERE id = ?3",
                params![status.as_str(), notes, session_id],
            )?,
            None => conn.execute(
                "UPDATE sessions SET status = ?1 WHERE id = ?2",
                params![status.as_str(), session_id],
            )?,
        };
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    pub fn touch_session_last_run(&self, session_id: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE sessions SET last_run = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), session_id],
        )?;
        Ok(())
    }

    /// Remove a session and everything it owns (cascade).
    pub fn delete_session(&self, session_id: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        Ok(())
    }

    // =========================================================================
    // Threads
    // =========================================================================

    /// Attach an agent-issued thread id to a session. Idempotent.
    pub fn attach_thread(&self, session_id: &str, thread_id: &str) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO threads (id, session_id, title, created_at)
             VALUES (?1, ?2, '', ?3)
             ON CONFLICT(id) DO NOTHING",
            params![thread_id, session_id, Utc::now().to_rfc3339()],
        )?;
        tx.execute(
            "UPDATE sessions SET thread_id = ?1 WHERE id = ?2",
            params![thread_id, session_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_session_by_thread(&self, thread_id: &str) -> StoreResult<Option<Session>> {
        let conn = self.lock();
        let session = conn
            .query_row(
                &format!(
                    "{SESSION_SELECT} WHERE id =
                       (SELECT session_id FROM threads WHERE threads.id = ?1)"
                ),
                params![thread_id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    pub fn touch_thread(&self, thread_id: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE threads SET last_message_at = ?1, message_count = message_count + 1
             WHERE id = ?2",
            params![Utc::now().to_rfc3339(), thread_id],
        )?;
        Ok(())
    }

    pub fn threads_for_session(&self, session_id: &str) -> StoreResult<Vec<ThreadRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, title, created_at, last_message_at, message_count
             FROM threads WHERE session_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(ThreadRecord {
                id: row.get(0)?,
                session_id: row.get(1)?,
                title: row.get(2)?,
                created_at: ts(row, 3)?,
                last_message_at: ts_opt(row, 4)?,
                message_count: row.get(5)?,
            })
        })?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    // =========================================================================
    // Iterations
    // =========================================================================

    pub fn insert_iteration(&self, iteration: &Iteration) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO iterations (id, session_id, started_at, ended_at, commit_sha,
                 files_changed, lines_added, lines_deleted, test_result, test_exit_code,
                 model, agent_version, exit_code, prompt_tokens, completion_tokens,
                 total_tokens, thread_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                iteration.id,
                iteration.session_id,
                iteration.started_at.to_rfc3339(),
                iteration.ended_at.map(|t| t.to_rfc3339()),
                iteration.commit_sha,
                iteration.files_changed,
                iteration.lines_added as i64,
                iteration.lines_deleted as i64,
                iteration.test_result.as_str(),
                iteration.test_exit_code,
                iteration.model,
                iteration.agent_version,
                iteration.exit_code,
                iteration.token_usage.prompt as i64,
                iteration.token_usage.completion as i64,
                iteration.token_usage.total as i64,
                iteration.thread_id,
            ],
        )?;
        Ok(())
    }

    /// Persist the final state of an iteration and refresh the session
    /// summary in the same transaction.
    pub fn finalize_iteration(&self, iteration: &Iteration) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE iterations SET ended_at = ?4, commit_sha = ?5, files_changed = ?6,
                 lines_added = ?7, lines_deleted = ?8, test_result = ?9, test_exit_code = ?10,
                 model = ?11, agent_version = ?12, exit_code = ?13, prompt_tokens = ?14,
                 completion_tokens = ?15, total_tokens = ?16, thread_id = ?17
             WHERE id = ?1 AND session_id = ?2 AND started_at = ?3",
            params![
                iteration.id,
                iteration.session_id,
                iteration.started_at.to_rfc3339(),
                iteration.ended_at.map(|t| t.to_rfc3339()),
                iteration.commit_sha,
                iteration.files_changed,
                iteration.lines_added as i64,
                iteration.lines_deleted as i64,
                iteration.test_result.as_str(),
                iteration.test_exit_code,
                iteration.model,
                iteration.agent_version,
                iteration.exit_code,
                iteration.token_usage.prompt as i64,
                iteration.token_usage.completion as i64,
                iteration.token_usage.total as i64,
                iteration.thread_id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("iteration {}", iteration.id)));
        }
        tx.execute(
            "INSERT INTO session_summaries
                 (session_id, iterations, files_changed, lines_added, lines_deleted,
                  total_tokens, updated_at)
             SELECT session_id, COUNT(*), SUM(files_changed), SUM(lines_added),
                    SUM(lines_deleted), SUM(total_tokens), ?2
             FROM iterations WHERE session_id = ?1
             ON CONFLICT(session_id) DO UPDATE SET
                 iterations = excluded.iterations,
                 files_changed = excluded.files_changed,
                 lines_added = excluded.lines_added,
                 lines_deleted = excluded.lines_deleted,
                 total_tokens = excluded.total_tokens,
                 updated_at = excluded.updated_at",
            params![iteration.session_id, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_iteration(&self, iteration_id: &str) -> StoreResult<Option<Iteration>> {
        let conn = self.lock();
        let it = conn
            .query_row(
                &format!("{ITERATION_SELECT} WHERE id = ?1"),
                params![iteration_id],
                iteration_from_row,
            )
            .optional()?;
        Ok(it)
    }

    pub fn iterations_for_session(&self, session_id: &str) -> StoreResult<Vec<Iteration>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{ITERATION_SELECT} WHERE session_id = ?1 ORDER BY started_at"
        ))?;
        let rows = stmt.query_map(params![session_id], iteration_from_row)?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    pub fn session_summary(&self, session_id: &str) -> StoreResult<SessionSummary> {
        let conn = self.lock();
        let summary = conn
            .query_row(
                "SELECT session_id, iterations, files_changed, lines_added, lines_deleted,
                        total_tokens, updated_at
                 FROM session_summaries WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionSummary {
                        session_id: row.get(0)?,
                        iterations: row.get(1)?,
                        files_changed: row.get(2)?,
                        lines_added: row.get(3)?,
                        lines_deleted: row.get(4)?,
                        total_tokens: row.get(5)?,
                        updated_at: ts_opt(row, 6)?,
                    })
                },
            )
            .optional()?;
        Ok(summary.unwrap_or(SessionSummary {
            session_id: session_id.to_string(),
            ..SessionSummary::default()
        }))
    }

    // =========================================================================
    // Tool calls
    // =========================================================================

    /// Record a tool call. Idempotent on replay: a duplicate id is ignored.
    pub fn record_tool_call(&self, call: &ToolCallRecord) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO tool_calls (id, session_id, iteration_id, timestamp, tool_name,
                 args_json, success, duration_ms, raw_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO NOTHING",
            params![
                call.id,
                call.session_id,
                call.iteration_id,
                call.timestamp.to_rfc3339(),
                call.tool_name,
                call.args_json,
                call.success,
                call.duration_ms,
                call.raw_json,
            ],
        )?;
        Ok(())
    }

    pub fn tool_calls_for_session(&self, session_id: &str) -> StoreResult<Vec<ToolCallRecord>> {
        self.tool_calls_where("session_id = ?1", session_id)
    }

    pub fn tool_calls_for_iteration(&self, iteration_id: &str) -> StoreResult<Vec<ToolCallRecord>> {
        self.tool_calls_where("iteration_id = ?1", iteration_id)
    }

    fn tool_calls_where(&self, clause: &str, value: &str) -> StoreResult<Vec<ToolCallRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, session_id, iteration_id, timestamp, tool_name, args_json,
                    success, duration_ms, raw_json
             FROM tool_calls WHERE {clause} ORDER BY timestamp"
        ))?;
        let rows = stmt.query_map(params![value], |row| {
            Ok(ToolCallRecord {
                id: row.get(0)?,
                session_id: row.get(1)?,
                iteration_id: row.get(2)?,
                timestamp: ts(row, 3)?,
                tool_name: row.get(4)?,
                args_json: row.get(5)?,
                success: row.get(6)?,
                duration_ms: row.get(7)?,
                raw_json: row.get(8)?,
            })
        })?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    // =========================================================================
    // Stream events
    // =========================================================================

    /// Append a stream event, assigning the next per-session sequence number.
    pub fn record_stream_event(
        &self,
        session_id: &str,
        event_type: &str,
        timestamp: DateTime<Utc>,
        data_json: &str,
    ) -> StoreResult<i64> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM stream_events WHERE session_id = ?1",
            params![session_id],
            |r| r.get(0),
        )?;
        tx.execute(
            "INSERT INTO stream_events (session_id, seq, event_type, timestamp, data_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, seq, event_type, timestamp.to_rfc3339(), data_json],
        )?;
        tx.commit()?;
        Ok(seq)
    }

    /// Stream events for a session, ordered by sequence.
    pub fn stream_events_for_session(
        &self,
        session_id: &str,
        after_seq: i64,
    ) -> StoreResult<Vec<StreamEventRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, seq, event_type, timestamp, data_json
             FROM stream_events WHERE session_id = ?1 AND seq > ?2 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![session_id, after_seq], |row| {
            Ok(StreamEventRecord {
                session_id: row.get(0)?,
                seq: row.get(1)?,
                event_type: row.get(2)?,
                timestamp: ts(row, 3)?,
                data_json: row.get(4)?,
            })
        })?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    // =========================================================================
    // Merge history
    // =========================================================================

    pub fn insert_merge_history(&self, record: &MergeHistoryRecord) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO merge_history (id, session_id, started_at, finished_at, base_branch,
                 mode, result, conflict_files, squash_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.session_id,
                record.started_at.to_rfc3339(),
                record.finished_at.map(|t| t.to_rfc3339()),
                record.base_branch,
                record.mode,
                record.result.as_str(),
                serde_json::to_string(&record.conflict_files).unwrap_or_else(|_| "[]".into()),
                record.squash_message,
            ],
        )?;
        Ok(())
    }

    pub fn finish_merge_history(
        &self,
        merge_id: &str,
        result: MergeResult,
        conflict_files: &[String],
    ) -> StoreResult<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE merge_history SET result = ?1, finished_at = ?2, conflict_files = ?3
             WHERE id = ?4",
            params![
                result.as_str(),
                Utc::now().to_rfc3339(),
                serde_json::to_string(conflict_files).unwrap_or_else(|_| "[]".into()),
                merge_id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("merge {merge_id}")));
        }
        Ok(())
    }

    pub fn merge_history_for_session(
        &self,
        session_id: &str,
    ) -> StoreResult<Vec<MergeHistoryRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, started_at, finished_at, base_branch, mode, result,
                    conflict_files, squash_message
             FROM merge_history WHERE session_id = ?1 ORDER BY started_at",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            let result_str: String = row.get(6)?;
            let files_json: String = row.get(7)?;
            Ok(MergeHistoryRecord {
                id: row.get(0)?,
                session_id: row.get(1)?,
                started_at: ts(row, 2)?,
                finished_at: ts_opt(row, 3)?,
                base_branch: row.get(4)?,
                mode: row.get(5)?,
                result: MergeResult::parse(&result_str).unwrap_or(MergeResult::Error),
                conflict_files: serde_json::from_str(&files_json).unwrap_or_default(),
                squash_message: row.get(8)?,
            })
        })?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    // =========================================================================
    // Batch runs and items
    // =========================================================================

    /// Create a run and all of its items in one transaction.
    pub fn insert_batch_run(&self, run: &BatchRun, items: &[BatchItem]) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO batch_runs (run_id, created_at, defaults_json, concurrency, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run.run_id,
                run.created_at.to_rfc3339(),
                run.defaults_json,
                run.concurrency,
                run.status.as_str(),
            ],
        )?;
        for item in items {
            tx.execute(
                "INSERT INTO batch_items (id, run_id, repo, prompt, model, script_command,
                     timeout_sec, status, started_at, finished_at, session_id, tokens_total,
                     attempt, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    item.id,
                    item.run_id,
                    item.repo,
                    item.prompt,
                    item.model,
                    item.script_command,
                    item.timeout_sec.map(|v| v as i64),
                    item.status.as_str(),
                    item.started_at.map(|t| t.to_rfc3339()),
                    item.finished_at.map(|t| t.to_rfc3339()),
                    item.session_id,
                    item.tokens_total as i64,
                    item.attempt,
                    item.error,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_batch_run(&self, run_id: &str) -> StoreResult<Option<BatchRun>> {
        let conn = self.lock();
        let run = conn
            .query_row(
                "SELECT run_id, created_at, defaults_json, concurrency, status
                 FROM batch_runs WHERE run_id = ?1",
                params![run_id],
                batch_run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    pub fn list_batch_runs(&self) -> StoreResult<Vec<BatchRun>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT run_id, created_at, defaults_json, concurrency, status
             FROM batch_runs ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], batch_run_from_row)?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    pub fn update_batch_run_status(&self, run_id: &str, status: BatchStatus) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE batch_runs SET status = ?1 WHERE run_id = ?2",
            params![status.as_str(), run_id],
        )?;
        Ok(())
    }

    pub fn get_batch_item(&self, item_id: &str) -> StoreResult<Option<BatchItem>> {
        let conn = self.lock();
        let item = conn
            .query_row(
                &format!("{ITEM_SELECT} WHERE id = ?1"),
                params![item_id],
                batch_item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    pub fn items_for_run(&self, run_id: &str) -> StoreResult<Vec<BatchItem>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare(&format!("{ITEM_SELECT} WHERE run_id = ?1 ORDER BY rowid"))?;
        let rows = stmt.query_map(params![run_id], batch_item_from_row)?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    /// Transition a batch item, enforcing the queued → running → terminal
    /// state machine. An illegal transition is a [`StoreError::Conflict`].
    pub fn transition_batch_item(
        &self,
        item_id: &str,
        next: BatchItemStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let current_str: String = tx
            .query_row(
                "SELECT status FROM batch_items WHERE id = ?1",
                params![item_id],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("batch item {item_id}")))?;
        let current = BatchItemStatus::parse(&current_str)
            .ok_or_else(|| StoreError::Conflict(format!("unknown item status {current_str}")))?;
        if !current.can_transition_to(next) {
            return Err(StoreError::Conflict(format!(
                "illegal item transition {} -> {}",
                current.as_str(),
                next.as_str()
            )));
        }

        let now = Utc::now().to_rfc3339();
        match next {
            BatchItemStatus::Running => {
                tx.execute(
                    "UPDATE batch_items SET status = ?1, started_at = ?2,
                         attempt = attempt + 1, error = NULL
                     WHERE id = ?3",
                    params![next.as_str(), now, item_id],
                )?;
            }
            _ => {
                tx.execute(
                    "UPDATE batch_items SET status = ?1, finished_at = ?2, error = ?3
                     WHERE id = ?4",
                    params![next.as_str(), now, error, item_id],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Put a failed item back in the queue for a retry attempt.
    ///
    /// Only `error` items are eligible; script failures and timeouts are not
    /// retried.
    pub fn requeue_batch_item(&self, item_id: &str) -> StoreResult<()> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE batch_items SET status = 'queued', started_at = NULL, finished_at = NULL
             WHERE id = ?1 AND status = 'error'",
            params![item_id],
        )?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!(
                "item {item_id} is not retryable"
            )));
        }
        Ok(())
    }

    pub fn set_batch_item_session(
        &self,
        item_id: &str,
        session_id: &str,
        tokens_total: u64,
    ) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE batch_items SET session_id = ?1, tokens_total = ?2 WHERE id = ?3",
            params![session_id, tokens_total as i64, item_id],
        )?;
        Ok(())
    }

    // =========================================================================
    // Token-usage aggregates
    // =========================================================================

    pub fn token_usage_for_session(&self, session_id: &str) -> StoreResult<TokenUsage> {
        let conn = self.lock();
        let usage = conn.query_row(
            "SELECT COALESCE(SUM(prompt_tokens), 0), COALESCE(SUM(completion_tokens), 0),
                    COALESCE(SUM(total_tokens), 0)
             FROM iterations WHERE session_id = ?1",
            params![session_id],
            |row| {
                Ok(TokenUsage {
                    prompt: row.get::<_, i64>(0)? as u64,
                    completion: row.get::<_, i64>(1)? as u64,
                    total: row.get::<_, i64>(2)? as u64,
                })
            },
        )?;
        Ok(usage)
    }

    /// Token usage grouped by model, highest total first.
    pub fn token_usage_by_model(&self) -> StoreResult<Vec<(String, TokenUsage)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT COALESCE(model, 'unknown'), COALESCE(SUM(prompt_tokens), 0),
                    COALESCE(SUM(completion_tokens), 0), COALESCE(SUM(total_tokens), 0)
             FROM iterations GROUP BY COALESCE(model, 'unknown')
             ORDER BY SUM(total_tokens) DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                TokenUsage {
                    prompt: row.get::<_, i64>(1)? as u64,
                    completion: row.get::<_, i64>(2)? as u64,
                    total: row.get::<_, i64>(3)? as u64,
                },
            ))
        })?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }
}

// =============================================================================
// Row mapping
// =============================================================================

const SESSION_SELECT: &str = "SELECT id, name, initial_prompt, repo_root, base_branch, \
     branch_name, worktree_path, status, mode, script_command, model_override, auto_commit, \
     thread_id, notes, created_at, last_run FROM sessions";

const ITERATION_SELECT: &str = "SELECT id, session_id, started_at, ended_at, commit_sha, \
     files_changed, lines_added, lines_deleted, test_result, test_exit_code, model, \
     agent_version, exit_code, prompt_tokens, completion_tokens, total_tokens, thread_id \
     FROM iterations";

const ITEM_SELECT: &str = "SELECT id, run_id, repo, prompt, model, script_command, \
     timeout_sec, status, started_at, finished_at, session_id, tokens_total, attempt, error \
     FROM batch_items";

fn bad_enum(column: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        format!("invalid enum value: {value}").into(),
    )
}

fn ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn ts_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|d| Some(d.with_timezone(&Utc)))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            }),
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status_str: String = row.get(7)?;
    let mode_str: String = row.get(8)?;
    Ok(Session {
        id: row.get(0)?,
        name: row.get(1)?,
        initial_prompt: row.get(2)?,
        repo_root: row.get(3)?,
        base_branch: row.get(4)?,
        branch_name: row.get(5)?,
        worktree_path: row.get(6)?,
        status: SessionStatus::parse(&status_str).ok_or_else(|| bad_enum(7, &status_str))?,
        mode: SessionMode::parse(&mode_str).ok_or_else(|| bad_enum(8, &mode_str))?,
        script_command: row.get(9)?,
        model_override: row.get(10)?,
        auto_commit: row.get(11)?,
        thread_id: row.get(12)?,
        notes: row.get(13)?,
        created_at: ts(row, 14)?,
        last_run: ts_opt(row, 15)?,
    })
}

fn iteration_from_row(row: &Row<'_>) -> rusqlite::Result<Iteration> {
    let test_result_str: String = row.get(8)?;
    Ok(Iteration {
        id: row.get(0)?,
        session_id: row.get(1)?,
        started_at: ts(row, 2)?,
        ended_at: ts_opt(row, 3)?,
        commit_sha: row.get(4)?,
        files_changed: row.get(5)?,
        lines_added: row.get::<_, i64>(6)? as u64,
        lines_deleted: row.get::<_, i64>(7)? as u64,
        test_result: TestResult::parse(&test_result_str)
            .ok_or_else(|| bad_enum(8, &test_result_str))?,
        test_exit_code: row.get(9)?,
        model: row.get(10)?,
        agent_version: row.get(11)?,
        exit_code: row.get(12)?,
        token_usage: TokenUsage {
            prompt: row.get::<_, i64>(13)? as u64,
            completion: row.get::<_, i64>(14)? as u64,
            total: row.get::<_, i64>(15)? as u64,
        },
        thread_id: row.get(16)?,
    })
}

fn batch_run_from_row(row: &Row<'_>) -> rusqlite::Result<BatchRun> {
    let status_str: String = row.get(4)?;
    Ok(BatchRun {
        run_id: row.get(0)?,
        created_at: ts(row, 1)?,
        defaults_json: row.get(2)?,
        concurrency: row.get(3)?,
        status: BatchStatus::parse(&status_str).ok_or_else(|| bad_enum(4, &status_str))?,
    })
}

fn batch_item_from_row(row: &Row<'_>) -> rusqlite::Result<BatchItem> {
    let status_str: String = row.get(7)?;
    Ok(BatchItem {
        id: row.get(0)?,
        run_id: row.get(1)?,
        repo: row.get(2)?,
        prompt: row.get(3)?,
        model: row.get(4)?,
        script_command: row.get(5)?,
        timeout_sec: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
        status: BatchItemStatus::parse(&status_str).ok_or_else(|| bad_enum(7, &status_str))?,
        started_at: ts_opt(row, 8)?,
        finished_at: ts_opt(row, 9)?,
        session_id: row.get(10)?,
        tokens_total: row.get::<_, i64>(11)? as u64,
        attempt: row.get(12)?,
        error: row.get(13)?,
    })
}
