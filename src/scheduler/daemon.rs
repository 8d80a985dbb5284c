//! Scheduler Daemon
//!
//! Runs a background loop that checks cron schedules and executes due
//! tasks. Uses `tokio::time::interval` for the tick loop and
//! `Arc<AtomicBool>` for graceful shutdown signaling. Executed tasks get
//! their `last_run` updated both in memory and in the database so a
//! restart does not replay an interval early.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::types::ScheduleEntry;

use super::tasks::{TaskContext, TaskResult, BUILTIN_TASKS};

/// Options for creating a scheduler daemon.
pub struct SchedulerDaemonOptions {
    /// Tick interval in seconds. Defaults to 20.
    pub tick_interval_secs: u64,
    /// Schedule entries to run.
    pub entries: Vec<ScheduleEntry>,
}

impl Default for SchedulerDaemonOptions {
    fn default() -> Self {
        Self {
            tick_interval_secs: 20,
            entries: Vec::new(),
        }
    }
}

/// The scheduler daemon. Runs a background tokio task that periodically
/// checks all registered entries and executes those that are due.
pub struct SchedulerDaemon {
    running: Arc<AtomicBool>,
    interval_handle: Option<JoinHandle<()>>,
    tick_interval_secs: u64,
    entries: Arc<tokio::sync::RwLock<Vec<ScheduleEntry>>>,
}

/// Create a new scheduler daemon from the given options.
pub fn create_scheduler_daemon(options: SchedulerDaemonOptions) -> SchedulerDaemon {
    SchedulerDaemon {
        running: Arc::new(AtomicBool::new(false)),
        interval_handle: None,
        tick_interval_secs: options.tick_interval_secs,
        entries: Arc::new(tokio::sync::RwLock::new(options.entries)),
    }
}

impl SchedulerDaemon {
    /// Start the scheduler background loop.
    pub fn start(&mut self, ctx: Arc<TaskContext>) {
        if self.running.load(Ordering::SeqCst) {
            warn!("Scheduler daemon is already running");
            return;
        }

        self.running.store(true, Ordering::SeqCst);
        info!(
            "Starting scheduler daemon with {}s tick interval",
            self.tick_interval_secs
        );

        let running = Arc::clone(&self.running);
        let entries = Arc::clone(&self.entries);
        let tick_secs = self.tick_interval_secs;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(tick_secs));

            loop {
                interval.tick().await;

                if !running.load(Ordering::SeqCst) {
                    info!("Scheduler daemon stopping");
                    break;
                }

                if let Err(e) = tick(&entries, &ctx).await {
                    error!("Scheduler tick error: {:#}", e);
                }
            }
        });

        self.interval_handle = Some(handle);
    }

    /// Stop the scheduler daemon gracefully.
    pub fn stop(&mut self) {
        if !self.running.load(Ordering::SeqCst) {
            debug!("Scheduler daemon is not running");
            return;
        }

        info!("Stopping scheduler daemon");
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.interval_handle.take() {
            handle.abort();
        }
    }

    /// Returns whether the daemon is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Check whether an entry is due based on its cron schedule.
///
/// With a `last_run` timestamp, the entry is due once the next scheduled
/// time after that run has passed. Without one it is due immediately.
pub fn is_due(entry: &ScheduleEntry) -> bool {
    if !entry.enabled {
        return false;
    }

    let schedule: Schedule = match entry.schedule.parse() {
        Ok(s) => s,
        Err(e) => {
            warn!(
                "Invalid cron schedule '{}' for entry '{}': {}",
                entry.schedule, entry.name, e
            );
            return false;
        }
    };

    let now = Utc::now();

    if let Some(ref last_run_str) = entry.last_run {
        if let Ok(last_run) = last_run_str.parse::<chrono::DateTime<Utc>>() {
            if let Some(next) = schedule.after(&last_run).next() {
                return now >= next;
            }
        }
    }

    true
}

/// Execute a single schedule entry by looking up its task in the
/// built-in registry.
pub async fn execute_task(entry: &ScheduleEntry, ctx: &TaskContext) -> Result<TaskResult> {
    let builtin_tasks = BUILTIN_TASKS();
    let task_fn = builtin_tasks
        .get(entry.task.as_str())
        .with_context(|| format!("No built-in task function found for task '{}'", entry.task))?;

    info!("Executing scheduled task: {} (task={})", entry.name, entry.task);
    let result = task_fn(ctx).await;

    match &result {
        Ok(ref r) => {
            if r.escalated {
                info!(
                    "Task '{}' escalated: {}",
                    entry.name,
                    r.message.as_deref().unwrap_or("(no message)")
                );
            } else {
                debug!("Task '{}' completed", entry.name);
            }
        }
        Err(ref e) => {
            error!("Task '{}' failed: {:#}", entry.name, e);
        }
    }

    result
}

/// Perform a single tick: execute every due entry, then update
/// `last_run` in memory and in the database.
async fn tick(entries: &tokio::sync::RwLock<Vec<ScheduleEntry>>, ctx: &TaskContext) -> Result<()> {
    let current_entries = entries.read().await.clone();
    let mut executed: HashMap<String, String> = HashMap::new();

    for entry in &current_entries {
        if is_due(entry) {
            match execute_task(entry, ctx).await {
                Ok(_result) => {
                    executed.insert(entry.name.clone(), Utc::now().to_rfc3339());
                }
                Err(e) => {
                    error!("Failed to execute scheduled task '{}': {:#}", entry.name, e);
                }
            }
        }
    }

    if !executed.is_empty() {
        let mut writable = entries.write().await;
        for entry in writable.iter_mut() {
            if let Some(timestamp) = executed.get(&entry.name) {
                entry.last_run = Some(timestamp.clone());
            }
        }
        drop(writable);

        let db = ctx.db.lock().unwrap();
        for (name, timestamp) in &executed {
            if let Err(e) = db.update_schedule_last_run(name, timestamp) {
                warn!("Failed to persist last_run for '{}': {}", name, e);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(schedule: &str, last_run: Option<&str>, enabled: bool) -> ScheduleEntry {
        ScheduleEntry {
            name: "test_entry".to_string(),
            schedule: schedule.to_string(),
            task: "market_monitor".to_string(),
            enabled,
            last_run: last_run.map(|s| s.to_string()),
            params: None,
        }
    }

    #[test]
    fn test_never_run_entry_is_due() {
        assert!(is_due(&entry("0 */10 * * * *", None, true)));
    }

    #[test]
    fn test_just_run_entry_is_not_due() {
        let now = Utc::now().to_rfc3339();
        assert!(!is_due(&entry("0 */10 * * * *", Some(&now), true)));
    }

    #[test]
    fn test_stale_last_run_is_due() {
        assert!(is_due(&entry(
            "0 */10 * * * *",
            Some("2020-01-01T00:00:00Z"),
            true
        )));
    }

    #[test]
    fn test_disabled_entry_is_never_due() {
        assert!(!is_due(&entry("0 */10 * * * *", None, false)));
    }

    #[test]
    fn test_invalid_cron_is_never_due() {
        assert!(!is_due(&entry("not a schedule", None, true)));
    }
}
