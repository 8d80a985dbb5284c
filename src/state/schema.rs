//! Database schema for the sentinel state store.

/// Current schema version. Bump together with a migration constant.
pub const SCHEMA_VERSION: i64 = 1;

/// Initial table set.
///
/// `notifications` is append-only: consumption sets `consumed_at`, and
/// only the cache-refresh task may remove rows past the retention window.
/// `stage_attempts` holds one row per generation-request attempt for audit.
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS monitoring_targets (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    value TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_observed TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_targets_kind_value
    ON monitoring_targets (kind, value);

CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    target TEXT,
    summary TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    consumed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_notifications_unconsumed
    ON notifications (created_at) WHERE consumed_at IS NULL;

CREATE TABLE IF NOT EXISTS cycle_records (
    id TEXT PRIMARY KEY,
    trigger_source TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    status TEXT NOT NULL,
    metric_before TEXT NOT NULL,
    metric_after TEXT,
    stages TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stage_attempts (
    id TEXT PRIMARY KEY,
    cycle_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    code TEXT NOT NULL,
    success INTEGER NOT NULL,
    stdout TEXT NOT NULL,
    error TEXT,
    duration_ms INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_stage_attempts_cycle
    ON stage_attempts (cycle_id);

CREATE TABLE IF NOT EXISTS schedule_entries (
    name TEXT PRIMARY KEY,
    schedule TEXT NOT NULL,
    task TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_run TEXT,
    params TEXT,
    updated_at TEXT
);

CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
