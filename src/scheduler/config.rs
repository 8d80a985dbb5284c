//! Schedule Configuration
//!
//! YAML-based configuration for scheduler entries. Provides the default
//! five-timer schedule and supports loading/saving from disk with sync
//! to the sentinel's SQLite database.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use yaml_rust2::{Yaml, YamlEmitter, YamlLoader};

use crate::state::Database;
use crate::types::{ScheduleConfig, ScheduleEntry};

/// Default schedule with the five standard timers:
/// - `market_monitor` - poll the market feed for price movement
/// - `social_monitor` - poll the social feed for chatter about targets
/// - `wallet_monitor` - poll the wallet feed for suspicious transactions
/// - `intel_refresh` - warm the threat-intelligence index
/// - `cache_refresh` - prune consumed notifications and stale state
pub const DEFAULT_SCHEDULE_CONFIG: &str = r#"entries:
  - name: market_monitor
    schedule: "0 */10 * * * *"
    task: market_monitor
    enabled: true
    params: {}
  - name: social_monitor
    schedule: "0 0 */2 * * *"
    task: social_monitor
    enabled: true
    params: {}
  - name: wallet_monitor
    schedule: "0 */30 * * * *"
    task: wallet_monitor
    enabled: true
    params: {}
  - name: intel_refresh
    schedule: "0 0 */3 * * *"
    task: intel_refresh
    enabled: true
    params: {}
  - name: cache_refresh
    schedule: "0 */5 * * * *"
    task: cache_refresh
    enabled: true
    params: {}
tickIntervalSecs: 20
"#;

fn parse_yaml_config(docs: &[Yaml]) -> Result<ScheduleConfig> {
    let doc = docs.first().context("Empty YAML document")?;

    let entries_yaml = doc["entries"]
        .as_vec()
        .context("Missing or invalid 'entries' key in schedule config")?;

    let tick_interval_secs = doc["tickIntervalSecs"].as_i64().unwrap_or(20) as u64;

    let mut entries = Vec::with_capacity(entries_yaml.len());

    for item in entries_yaml {
        let name = item["name"]
            .as_str()
            .context("Missing 'name' in schedule entry")?
            .to_string();

        let schedule = item["schedule"]
            .as_str()
            .context("Missing 'schedule' in schedule entry")?
            .to_string();

        let task = item["task"]
            .as_str()
            .context("Missing 'task' in schedule entry")?
            .to_string();

        let enabled = item["enabled"].as_bool().unwrap_or(true);

        let params = if item["params"].is_badvalue() || item["params"].is_null() {
            None
        } else {
            let yaml_str = {
                let mut out = String::new();
                let mut emitter = YamlEmitter::new(&mut out);
                emitter.dump(&item["params"]).ok();
                out
            };
            serde_json::from_str(&yaml_str).ok()
        };

        entries.push(ScheduleEntry {
            name,
            schedule,
            task,
            enabled,
            last_run: None,
            params,
        });
    }

    Ok(ScheduleConfig {
        entries,
        tick_interval_secs,
    })
}

/// Load schedule configuration from a YAML file at the given path.
///
/// Falls back to the default configuration if the file does not exist.
pub fn load_schedule_config(config_path: &Path) -> Result<ScheduleConfig> {
    if !config_path.exists() {
        info!(
            "Schedule config not found at {}, using defaults",
            config_path.display()
        );
        let docs = YamlLoader::load_from_str(DEFAULT_SCHEDULE_CONFIG)
            .context("Failed to parse default schedule config")?;
        return parse_yaml_config(&docs);
    }

    let contents = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read schedule config from {}", config_path.display()))?;

    let docs = YamlLoader::load_from_str(&contents)
        .with_context(|| format!("Failed to parse YAML from {}", config_path.display()))?;

    let config = parse_yaml_config(&docs)?;
    debug!(
        "Loaded {} schedule entries from {}",
        config.entries.len(),
        config_path.display()
    );
    Ok(config)
}

/// Write the default schedule configuration to a file.
///
/// Will not overwrite an existing file.
pub fn write_default_schedule_config(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        warn!(
            "Schedule config already exists at {}, not overwriting",
            config_path.display()
        );
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "Failed to create parent directory for {}",
                config_path.display()
            )
        })?;
    }

    fs::write(config_path, DEFAULT_SCHEDULE_CONFIG).with_context(|| {
        format!(
            "Failed to write default schedule config to {}",
            config_path.display()
        )
    })?;

    info!("Wrote default schedule config to {}", config_path.display());
    Ok(())
}

/// Synchronize schedule entries to the database, preserving `last_run`
/// for entries that already exist.
pub fn sync_schedule_to_db(config: &ScheduleConfig, db: &Database) -> Result<()> {
    for entry in &config.entries {
        db.upsert_schedule_entry(entry)?;
    }
    debug!("Synced {} schedule entries to database", config.entries.len());
    Ok(())
}
