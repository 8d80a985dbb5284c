//! Sentinel Database
//!
//! SQLite-backed persistent state for the agent.
//! Uses rusqlite for synchronous, single-process access.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;

use crate::types::*;

use super::schema::{CREATE_TABLES, SCHEMA_VERSION};

/// Key for the rolling metric state in the kv table.
const KV_METRIC_STATE: &str = "metric_state";
/// Key for the current cycle state in the kv table.
const KV_CYCLE_STATE: &str = "cycle_state";

/// The agent's SQLite database handle.
///
/// Everything the core persists lives here: the append-only notification
/// log, monitoring targets, cycle records with per-attempt audit rows,
/// schedule entries, and the kv store (metric and cycle state).
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database at `db_path`, apply migrations, and
    /// return the handle.
    pub fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create db directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database: {db_path}"))?;

        // WAL mode for better concurrent read performance
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute_batch(CREATE_TABLES)
            .context("failed to create tables")?;

        let current_version: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
                params![SCHEMA_VERSION],
            )
            .context("failed to update schema version")?;
        }

        Ok(Self { conn })
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(CREATE_TABLES)
            .context("failed to create tables")?;
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
            params![SCHEMA_VERSION],
        )?;
        Ok(Self { conn })
    }

    // ─── Monitoring Targets ──────────────────────────────────────

    pub fn insert_target(&self, target: &MonitoringTarget) -> Result<()> {
        let kind_str = serde_json::to_string(&target.kind)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO monitoring_targets (id, kind, value, created_at, last_observed)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                target.id,
                kind_str.trim_matches('"'),
                target.value,
                target.created_at,
                target.last_observed,
            ],
        )?;
        Ok(())
    }

    /// Insert configured targets that are not already present. Dedupe is
    /// by (kind, value), so re-seeding on every startup leaves existing
    /// rows, their ids and observation timestamps untouched.
    pub fn seed_targets(&self, specs: &[TargetSpec]) -> Result<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut inserted = 0;
        for spec in specs {
            let kind_str = serde_json::to_string(&spec.kind)?;
            inserted += self.conn.execute(
                "INSERT OR IGNORE INTO monitoring_targets (id, kind, value, created_at, last_observed)
                 VALUES (?1, ?2, ?3, ?4, NULL)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    kind_str.trim_matches('"'),
                    spec.value,
                    now,
                ],
            )?;
        }
        Ok(inserted)
    }

    pub fn get_targets(&self) -> Result<Vec<MonitoringTarget>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, value, created_at, last_observed FROM monitoring_targets",
        )?;
        let targets = stmt
            .query_map([], |row| {
                let kind_str: String = row.get(1)?;
                Ok(MonitoringTarget {
                    id: row.get(0)?,
                    kind: serde_json::from_str(&format!("\"{}\"", kind_str))
                        .unwrap_or(TargetKind::Wallet),
                    value: row.get(2)?,
                    created_at: row.get(3)?,
                    last_observed: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(targets)
    }

    /// Record an observation timestamp for a target. The only mutation a
    /// target sees after creation.
    pub fn touch_target(&self, value: &str, timestamp: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE monitoring_targets SET last_observed = ?1 WHERE value = ?2",
            params![timestamp, value],
        )?;
        Ok(())
    }

    // ─── Notifications ───────────────────────────────────────────

    pub fn insert_notification(&self, n: &Notification) -> Result<()> {
        self.conn.execute(
            "INSERT INTO notifications (id, source, target, summary, payload, created_at, consumed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                n.id,
                n.source.as_str(),
                n.target,
                n.summary,
                serde_json::to_string(&n.payload)?,
                n.created_at,
                n.consumed_at,
            ],
        )?;
        Ok(())
    }

    /// The most recent unconsumed notifications, oldest first, bounded
    /// by `limit`.
    pub fn recent_unconsumed_notifications(&self, limit: usize) -> Result<Vec<Notification>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, source, target, summary, payload, created_at, consumed_at
             FROM notifications WHERE consumed_at IS NULL
             ORDER BY created_at DESC LIMIT ?1",
        )?;
        let mut notifications: Vec<Notification> = stmt
            .query_map(params![limit as i64], |row| Ok(Self::deserialize_notification(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        notifications.reverse();
        Ok(notifications)
    }

    /// Mark notifications consumed. Never deletes; the log stays
    /// append-only.
    pub fn mark_notifications_consumed(&self, ids: &[String], timestamp: &str) -> Result<()> {
        for id in ids {
            self.conn.execute(
                "UPDATE notifications SET consumed_at = ?1 WHERE id = ?2 AND consumed_at IS NULL",
                params![timestamp, id],
            )?;
        }
        Ok(())
    }

    /// Archive consumed notifications older than `cutoff`. Only the
    /// cache-refresh task calls this, and only past the retention window.
    pub fn prune_consumed_notifications(&self, cutoff: &str) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM notifications WHERE consumed_at IS NOT NULL AND created_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    // ─── Cycle Records ───────────────────────────────────────────

    pub fn insert_cycle_record(&self, record: &CycleRecord) -> Result<()> {
        let status_str = serde_json::to_string(&record.status)?;
        self.conn.execute(
            "INSERT INTO cycle_records (id, trigger_source, started_at, finished_at, status, metric_before, metric_after, stages)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.trigger,
                record.started_at,
                record.finished_at,
                status_str.trim_matches('"'),
                serde_json::to_string(&record.metric_before)?,
                record
                    .metric_after
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&record.stages)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_recent_cycle_records(&self, limit: usize) -> Result<Vec<CycleRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, trigger_source, started_at, finished_at, status, metric_before, metric_after, stages
             FROM cycle_records ORDER BY started_at DESC LIMIT ?1",
        )?;
        let mut records: Vec<CycleRecord> = stmt
            .query_map(params![limit as i64], |row| Ok(Self::deserialize_cycle_record(row)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        records.reverse();
        Ok(records)
    }

    /// The most recent record that ran to completion, used as the
    /// "previous analysis" input to the next cycle.
    pub fn last_completed_record(&self) -> Result<Option<CycleRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, trigger_source, started_at, finished_at, status, metric_before, metric_after, stages
                 FROM cycle_records WHERE status = 'completed'
                 ORDER BY started_at DESC LIMIT 1",
                [],
                |row| Ok(Self::deserialize_cycle_record(row)),
            )
            .optional()?;
        Ok(record)
    }

    pub fn get_cycle_count(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM cycle_records", [], |row| row.get(0))?;
        Ok(count)
    }

    // ─── Stage Attempts (audit) ──────────────────────────────────

    pub fn insert_stage_attempt(
        &self,
        cycle_id: &str,
        stage: RequestKind,
        attempt: &AttemptRecord,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO stage_attempts (id, cycle_id, stage, attempt, code, success, stdout, error, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now'))",
            params![
                uuid::Uuid::new_v4().to_string(),
                cycle_id,
                stage.as_str(),
                attempt.attempt,
                attempt.code,
                attempt.result.success as i32,
                attempt.result.stdout,
                attempt.result.error,
                attempt.result.duration_ms,
            ],
        )?;
        Ok(())
    }

    pub fn get_stage_attempts(&self, cycle_id: &str) -> Result<Vec<(String, u32, bool)>> {
        let mut stmt = self.conn.prepare(
            "SELECT stage, attempt, success FROM stage_attempts
             WHERE cycle_id = ?1 ORDER BY stage, attempt",
        )?;
        let rows = stmt
            .query_map(params![cycle_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, i64>(2)? != 0,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Schedule Entries ────────────────────────────────────────

    pub fn upsert_schedule_entry(&self, entry: &ScheduleEntry) -> Result<()> {
        let params_json =
            serde_json::to_string(&entry.params.as_ref().unwrap_or(&serde_json::json!({})))?;
        self.conn.execute(
            "INSERT INTO schedule_entries (name, schedule, task, enabled, last_run, params, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
             ON CONFLICT(name) DO UPDATE SET
               schedule = excluded.schedule,
               task = excluded.task,
               enabled = excluded.enabled,
               last_run = COALESCE(excluded.last_run, schedule_entries.last_run),
               params = excluded.params,
               updated_at = excluded.updated_at",
            params![
                entry.name,
                entry.schedule,
                entry.task,
                entry.enabled as i32,
                entry.last_run,
                params_json,
            ],
        )?;
        Ok(())
    }

    pub fn get_schedule_entries(&self) -> Result<Vec<ScheduleEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, schedule, task, enabled, last_run, params FROM schedule_entries",
        )?;
        let entries = stmt
            .query_map([], |row| {
                let params_str: Option<String> = row.get(5)?;
                Ok(ScheduleEntry {
                    name: row.get(0)?,
                    schedule: row.get(1)?,
                    task: row.get(2)?,
                    enabled: row.get::<_, i64>(3)? != 0,
                    last_run: row.get(4)?,
                    params: params_str.and_then(|s| serde_json::from_str(&s).ok()),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn update_schedule_last_run(&self, name: &str, timestamp: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE schedule_entries SET last_run = ?1, updated_at = datetime('now') WHERE name = ?2",
            params![timestamp, name],
        )?;
        Ok(())
    }

    // ─── Key-Value Store ─────────────────────────────────────────

    pub fn get_kv(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(result)
    }

    pub fn set_kv(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // ─── Metric / Cycle State ────────────────────────────────────

    pub fn get_metric_state(&self) -> Result<MetricState> {
        match self.get_kv(KV_METRIC_STATE)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(MetricState::default()),
        }
    }

    pub fn set_metric_state(&self, state: &MetricState) -> Result<()> {
        self.set_kv(KV_METRIC_STATE, &serde_json::to_string(state)?)
    }

    pub fn get_cycle_state(&self) -> Result<CycleState> {
        match self.get_kv(KV_CYCLE_STATE)? {
            Some(s) => Ok(serde_json::from_str(&format!("\"{}\"", s)).unwrap_or(CycleState::Idle)),
            None => Ok(CycleState::Idle),
        }
    }

    pub fn set_cycle_state(&self, state: &CycleState) -> Result<()> {
        let s = serde_json::to_string(state)?;
        self.set_kv(KV_CYCLE_STATE, s.trim_matches('"'))
    }

    // ─── Row Deserialization ─────────────────────────────────────

    fn deserialize_notification(row: &rusqlite::Row) -> Notification {
        let source_str: String = row.get(1).unwrap_or_default();
        let payload_str: String = row.get(4).unwrap_or_default();
        Notification {
            id: row.get(0).unwrap_or_default(),
            source: serde_json::from_str(&format!("\"{}\"", source_str))
                .unwrap_or(NotificationSource::Market),
            target: row.get(2).unwrap_or(None),
            summary: row.get(3).unwrap_or_default(),
            payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
            created_at: row.get(5).unwrap_or_default(),
            consumed_at: row.get(6).unwrap_or(None),
        }
    }

    fn deserialize_cycle_record(row: &rusqlite::Row) -> CycleRecord {
        let status_str: String = row.get(4).unwrap_or_default();
        let metric_before_str: String = row.get(5).unwrap_or_default();
        let metric_after_str: Option<String> = row.get(6).unwrap_or(None);
        let stages_str: String = row.get(7).unwrap_or_default();
        CycleRecord {
            id: row.get(0).unwrap_or_default(),
            trigger: row.get(1).unwrap_or_default(),
            started_at: row.get(2).unwrap_or_default(),
            finished_at: row.get(3).unwrap_or_default(),
            status: serde_json::from_str(&format!("\"{}\"", status_str))
                .unwrap_or(CycleStatus::Aborted),
            metric_before: serde_json::from_str(&metric_before_str).unwrap_or_default(),
            metric_after: metric_after_str.and_then(|s| serde_json::from_str(&s).ok()),
            stages: serde_json::from_str(&stages_str).unwrap_or_default(),
        }
    }
}
