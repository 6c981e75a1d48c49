use rusqlite::Connection;

use crate::error::Result;

/// Initialise the full schema. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS events (
            id           TEXT    NOT NULL PRIMARY KEY,
            type         TEXT    NOT NULL,
            source       TEXT    NOT NULL,
            action       TEXT    NOT NULL,
            payload      TEXT    NOT NULL,   -- opaque JSON blob
            metadata     TEXT    NOT NULL,   -- JSON: request_id, depth, origin chain
            status       TEXT    NOT NULL DEFAULT 'pending',
            created_at   TEXT    NOT NULL,
            process_at   TEXT    NOT NULL,   -- deferred when in the future
            claimed_at   TEXT,               -- set while processing; drives reclaim
            processed_at TEXT                -- set iff status is terminal
        ) STRICT;

        -- Polling: SELECT ... WHERE status='pending' AND process_at <= ? ORDER BY process_at, id
        CREATE INDEX IF NOT EXISTS idx_events_status_process
            ON events (status, process_at);
        CREATE INDEX IF NOT EXISTS idx_events_pattern
            ON events (type, source, action);

        CREATE TABLE IF NOT EXISTS hooks (
            id           TEXT    NOT NULL PRIMARY KEY,
            name         TEXT    NOT NULL,
            function_id  TEXT    NOT NULL,
            event_type   TEXT    NOT NULL,
            event_source TEXT    NOT NULL DEFAULT '*',
            event_action TEXT    NOT NULL DEFAULT '*',
            mode         TEXT    NOT NULL DEFAULT 'async',
            priority     INTEGER NOT NULL DEFAULT 0,
            config       TEXT    NOT NULL,   -- JSON: timeout, on_failure, input, ...
            enabled      INTEGER NOT NULL DEFAULT 1,
            managed_by   TEXT    NOT NULL DEFAULT 'api',
            created_at   TEXT    NOT NULL,
            updated_at   TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_hooks_pattern
            ON hooks (event_type, event_source, event_action);
        CREATE INDEX IF NOT EXISTS idx_hooks_function
            ON hooks (function_id);

        CREATE TABLE IF NOT EXISTS schedules (
            id          TEXT    NOT NULL PRIMARY KEY,
            name        TEXT    NOT NULL UNIQUE,
            function_id TEXT    NOT NULL,
            kind        TEXT    NOT NULL,    -- cron | interval | one_time
            expression  TEXT    NOT NULL,
            timezone    TEXT    NOT NULL DEFAULT 'UTC',
            next_run    TEXT,
            last_run    TEXT,
            last_status TEXT,
            enabled     INTEGER NOT NULL DEFAULT 1,
            config      TEXT    NOT NULL,    -- JSON: overlap policy, retries, input
            managed_by  TEXT    NOT NULL DEFAULT 'api',
            created_at  TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_schedules_due
            ON schedules (enabled, next_run);

        CREATE TABLE IF NOT EXISTS webhooks (
            id           TEXT    NOT NULL PRIMARY KEY,
            path         TEXT    NOT NULL UNIQUE,
            function_id  TEXT,
            methods      TEXT    NOT NULL,   -- JSON array of HTTP methods
            verification TEXT,               -- JSON or NULL for unsigned endpoints
            enabled      INTEGER NOT NULL DEFAULT 1,
            managed_by   TEXT    NOT NULL DEFAULT 'api',
            created_at   TEXT    NOT NULL,
            updated_at   TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS executions (
            id           TEXT    NOT NULL PRIMARY KEY,
            function_id  TEXT    NOT NULL,
            request_id   TEXT    NOT NULL,
            trigger_type TEXT    NOT NULL,
            trigger_id   TEXT    NOT NULL,
            status       TEXT    NOT NULL DEFAULT 'pending',
            started_at   TEXT    NOT NULL,
            completed_at TEXT,
            duration_ms  INTEGER,
            input        TEXT,               -- JSON, sensitive paths redacted
            output       TEXT,               -- JSON
            error        TEXT,
            logs         TEXT    NOT NULL DEFAULT '[]'  -- JSON array of stderr lines
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_executions_function
            ON executions (function_id, started_at DESC);
        CREATE INDEX IF NOT EXISTS idx_executions_status
            ON executions (status);
        CREATE INDEX IF NOT EXISTS idx_executions_trigger
            ON executions (trigger_type, trigger_id);
        ",
    )?;
    Ok(())
}
