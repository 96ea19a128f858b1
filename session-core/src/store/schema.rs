//! Versioned schema migrations
//!
//! Applied in order at open time inside a single transaction; the database
//! `user_version` pragma tracks the applied version. A database newer than
//! [`CURRENT_VERSION`] is refused.

/// Schema version this build reads and writes.
pub const CURRENT_VERSION: i64 = 2;

/// Ordered migrations; index 0 migrates an empty database to version 1.
pub const MIGRATIONS: &[&str] = &[
    // v1: initial schema
    r#"
    CREATE TABLE sessions (
        id            TEXT PRIMARY KEY,
        name          TEXT NOT NULL,
        initial_prompt TEXT NOT NULL,
        repo_root     TEXT NOT NULL,
        base_branch   TEXT NOT NULL,
        branch_name   TEXT NOT NULL,
        worktree_path TEXT NOT NULL UNIQUE,
        status        TEXT NOT NULL,
        mode          TEXT NOT NULL DEFAULT 'async',
        script_command TEXT,
        model_override TEXT,
        auto_commit   INTEGER NOT NULL DEFAULT 1,
        thread_id     TEXT,
        notes         TEXT,
        created_at    TEXT NOT NULL,
        last_run      TEXT,
        UNIQUE (repo_root, branch_name)
    );

    CREATE TABLE iterations (
        id            TEXT PRIMARY KEY,
        session_id    TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        started_at    TEXT NOT NULL,
        ended_at      TEXT,
        commit_sha    TEXT,
        files_changed INTEGER NOT NULL DEFAULT 0,
        lines_added   INTEGER NOT NULL DEFAULT 0,
        lines_deleted INTEGER NOT NULL DEFAULT 0,
        test_result   TEXT NOT NULL DEFAULT 'none',
        test_exit_code INTEGER,
        model         TEXT,
        agent_version TEXT,
        exit_code     INTEGER,
        prompt_tokens INTEGER NOT NULL DEFAULT 0,
        completion_tokens INTEGER NOT NULL DEFAULT 0,
        total_tokens  INTEGER NOT NULL DEFAULT 0,
        thread_id     TEXT
    );
    CREATE INDEX idx_iterations_session ON iterations(session_id, started_at);

    CREATE TABLE tool_calls (
        id            TEXT PRIMARY KEY,
        session_id    TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        iteration_id  TEXT,
        timestamp     TEXT NOT NULL,
        tool_name     TEXT NOT NULL,
        args_json     TEXT NOT NULL,
        success       INTEGER NOT NULL DEFAULT 1,
        duration_ms   INTEGER,
        raw_json      TEXT
    );
    CREATE INDEX idx_tool_calls_session ON tool_calls(session_id, timestamp);
    CREATE INDEX idx_tool_calls_iteration ON tool_calls(iteration_id);

    CREATE TABLE stream_events (
        session_id    TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        seq           INTEGER NOT NULL,
        event_type    TEXT NOT NULL,
        timestamp     TEXT NOT NULL,
        data_json     TEXT NOT NULL,
        PRIMARY KEY (session_id, seq)
    );

    CREATE TABLE threads (
        id            TEXT PRIMARY KEY,
        session_id    TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        title         TEXT NOT NULL DEFAULT '',
        created_at    TEXT NOT NULL,
        last_message_at TEXT,
        message_count INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX idx_threads_session ON threads(session_id);

    CREATE TABLE merge_history (
        id            TEXT PRIMARY KEY,
        session_id    TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        started_at    TEXT NOT NULL,
        finished_at   TEXT,
        base_branch   TEXT NOT NULL,
        mode          TEXT NOT NULL,
        result        TEXT NOT NULL,
        conflict_files TEXT NOT NULL DEFAULT '[]',
        squash_message TEXT
    );
    CREATE INDEX idx_merge_history_session ON merge_history(session_id, started_at);

    CREATE TABLE batch_runs (
        run_id        TEXT PRIMARY KEY,
        created_at    TEXT NOT NULL,
        defaults_json TEXT NOT NULL,
        concurrency   INTEGER NOT NULL,
        status        TEXT NOT NULL
    );

    CREATE TABLE batch_items (
        id            TEXT PRIMARY KEY,
        run_id        TEXT NOT NULL REFERENCES batch_runs(run_id) ON DELETE CASCADE,
        repo          TEXT NOT NULL,
        prompt        TEXT NOT NULL,
        model         TEXT,
        script_command TEXT,
        timeout_sec   INTEGER,
        status        TEXT NOT NULL,
        started_at    TEXT,
        finished_at   TEXT,
        session_id    TEXT,
        tokens_total  INTEGER NOT NULL DEFAULT 0,
        attempt       INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX idx_batch_items_run ON batch_items(run_id);

    CREATE TABLE session_summaries (
        session_id    TEXT PRIMARY KEY REFERENCES sessions(id) ON DELETE CASCADE,
        iterations    INTEGER NOT NULL DEFAULT 0,
        files_changed INTEGER NOT NULL DEFAULT 0,
        lines_added   INTEGER NOT NULL DEFAULT 0,
        lines_deleted INTEGER NOT NULL DEFAULT 0,
        total_tokens  INTEGER NOT NULL DEFAULT 0,
        updated_at    TEXT NOT NULL
    );
    "#,
    // v2: keep the last error per batch item for retry diagnostics
    r#"
    ALTER TABLE batch_items ADD COLUMN error TEXT;
    "#,
];
