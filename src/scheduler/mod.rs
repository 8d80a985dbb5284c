//! The timer surface: YAML schedule config, the built-in task registry,
//! and the daemon tick loop that fires due tasks.

pub mod config;
pub mod daemon;
pub mod tasks;

pub use config::{load_schedule_config, sync_schedule_to_db, write_default_schedule_config};
pub use daemon::{create_scheduler_daemon, SchedulerDaemon, SchedulerDaemonOptions};
pub use tasks::{TaskContext, TaskResult};
