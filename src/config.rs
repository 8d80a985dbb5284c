//! Sentinel Configuration
//!
//! Loads and saves the agent's configuration from `~/.sentinel/sentinel.json`.
//! All intervals, thresholds, retry bounds, and collaborator endpoints live
//! here; there are no process-wide mutable singletons.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::SentinelError;
use crate::types::{FailurePolicy, LogLevel, TargetSpec, ToolBinding};

/// Config file name within the sentinel directory.
const CONFIG_FILENAME: &str = "sentinel.json";

/// Returns the sentinel state directory: `~/.sentinel`.
pub fn get_sentinel_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".sentinel")
}

/// Returns the full path to the config file: `~/.sentinel/sentinel.json`.
pub fn get_config_path() -> PathBuf {
    get_sentinel_dir().join(CONFIG_FILENAME)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SentinelConfig {
    pub name: String,
    pub network: String,
    pub db_path: String,
    pub schedule_config_path: String,
    pub scratch_dir: String,
    pub log_level: LogLevel,
    pub version: String,

    // Generation collaborator
    pub inference_api_url: String,
    pub inference_api_key: String,
    pub inference_model: String,
    pub max_tokens_per_request: u32,
    pub generation_timeout_secs: u64,

    // Retrieval collaborator
    pub retrieval_api_url: String,
    pub retrieval_top_k: usize,
    pub retrieval_timeout_secs: u64,

    // Signal feeds
    pub market_feed_url: String,
    pub social_feed_url: String,
    pub wallet_feed_url: String,
    pub feed_timeout_secs: u64,

    // Regeneration loop and cycle policy
    pub max_attempts: u32,
    pub failure_policy: FailurePolicy,
    pub notification_window: usize,
    pub sandbox_timeout_secs: u64,
    pub sandbox_interpreter: String,

    // Escalation thresholds
    pub price_drop_threshold_pct: f64,
    pub social_severity_threshold: f64,

    // Retention for the cache-refresh task
    pub notification_retention_days: i64,

    /// Wallets, tokens, and social keywords the monitors poll for.
    /// Seeded into the database at startup; rows already present keep
    /// their ids and observation timestamps.
    pub targets: Vec<TargetSpec>,

    /// APIs and security tools generated code is authorized to use,
    /// with the environment values bound into the sandbox.
    pub tools: Vec<ToolBinding>,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            name: "sentinel".to_string(),
            network: "solana".to_string(),
            db_path: "~/.sentinel/state.db".to_string(),
            schedule_config_path: "~/.sentinel/schedule.yml".to_string(),
            scratch_dir: "~/.sentinel/code".to_string(),
            log_level: LogLevel::Info,
            version: "0.1.0".to_string(),

            inference_api_url: "https://openrouter.ai/api".to_string(),
            inference_api_key: String::new(),
            inference_model: "anthropic/claude-sonnet-4".to_string(),
            max_tokens_per_request: 4096,
            generation_timeout_secs: 180,

            retrieval_api_url: "http://localhost:8080".to_string(),
            retrieval_top_k: 5,
            retrieval_timeout_secs: 30,

            market_feed_url: "http://localhost:9001".to_string(),
            social_feed_url: "http://localhost:9002".to_string(),
            wallet_feed_url: "http://localhost:9003".to_string(),
            feed_timeout_secs: 15,

            max_attempts: 3,
            failure_policy: FailurePolicy::Degrade,
            notification_window: 25,
            sandbox_timeout_secs: 120,
            sandbox_interpreter: "python3".to_string(),

            price_drop_threshold_pct: 5.0,
            social_severity_threshold: 0.7,

            notification_retention_days: 7,

            targets: Vec::new(),
            tools: Vec::new(),
        }
    }
}

/// Load the config from disk.
///
/// Returns `None` if the config file does not exist or cannot be parsed.
/// Missing fields fall back to defaults via serde.
pub fn load_config() -> Option<SentinelConfig> {
    let config_path = get_config_path();
    if !config_path.exists() {
        return None;
    }

    let contents = fs::read_to_string(&config_path).ok()?;
    serde_json::from_str::<SentinelConfig>(&contents).ok()
}

/// Save the config to disk at `~/.sentinel/sentinel.json`.
///
/// Creates the sentinel directory with mode 0o700 if it does not exist.
/// The config file is written with mode 0o600 since it carries API keys
/// and tool credentials.
pub fn save_config(config: &SentinelConfig) -> Result<()> {
    let dir = get_sentinel_dir();
    if !dir.exists() {
        fs::create_dir_all(&dir).context("Failed to create sentinel directory")?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
    }

    let config_path = get_config_path();
    let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;

    fs::write(&config_path, &json).context("Failed to write config file")?;
    fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

    Ok(())
}

/// Resolve a path that may start with `~` to an absolute path.
pub fn resolve_path(p: &str) -> String {
    if let Some(rest) = p.strip_prefix('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        home.join(rest).to_string_lossy().to_string()
    } else {
        p.to_string()
    }
}

/// Verify that every required tool has all of its credential values set.
///
/// This is the only fatal error class: a cycle must never start with a
/// mandatory tool missing its credentials, so the check runs at startup.
pub fn validate_credentials(config: &SentinelConfig) -> Result<(), SentinelError> {
    for tool in &config.tools {
        if !tool.required {
            continue;
        }
        for (var, value) in &tool.env {
            if value.trim().is_empty() {
                return Err(SentinelError::MissingCredential {
                    tool: tool.name.clone(),
                    var: var.clone(),
                });
            }
        }
    }
    Ok(())
}
