//! Appliance configuration.
//!
//! Loaded from `state_dir/config.yaml` (default `/var/lib/msp/config.yaml`),
//! then overridden by environment variables, then validated.
//! Loading hierarchy: env > file > defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ApplianceError, Result};

pub const DEFAULT_STATE_DIR: &str = "/var/lib/msp";

fn default_api_endpoint() -> String {
    "https://api.osiriscare.net".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_llm_provider() -> String {
    "anthropic".to_string()
}

fn default_llm_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}

fn default_local_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_local_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_llm_mode() -> String {
    "hybrid".to_string()
}

fn default_daily_budget() -> f64 {
    10.0
}

fn default_sensor_port() -> u16 {
    8080
}

fn default_learning_sync_interval() -> u64 {
    14_400
}

fn default_promotion_check_interval() -> u64 {
    3_600
}

fn default_prune_interval() -> u64 {
    86_400
}

fn default_retention_days() -> u32 {
    30
}

/// Configuration for the appliance agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplianceConfig {
    /// Site identifier assigned by the control plane
    pub site_id: String,

    /// API key for Bearer authentication
    pub api_key: String,

    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// Main loop poll interval, seconds (10-3600)
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    #[serde(default = "default_true")]
    pub enable_drift_detection: bool,

    #[serde(default = "default_true")]
    pub enable_evidence_upload: bool,

    #[serde(default = "default_true")]
    pub enable_l1_sync: bool,

    #[serde(default = "default_true")]
    pub healing_enabled: bool,

    /// Log healing actions without executing them
    #[serde(default)]
    pub healing_dry_run: bool,

    #[serde(default)]
    pub l2_enabled: bool,

    #[serde(default = "default_llm_mode")]
    pub l2_mode: String,

    #[serde(default = "default_llm_provider")]
    pub l2_api_provider: String,

    #[serde(default)]
    pub l2_api_key: String,

    #[serde(default = "default_llm_model")]
    pub l2_api_model: String,

    #[serde(default = "default_local_endpoint")]
    pub l2_local_endpoint: String,

    #[serde(default = "default_local_model")]
    pub l2_local_model: String,

    /// Daily USD budget for L2 API calls
    #[serde(default = "default_daily_budget")]
    pub llm_daily_budget_usd: f64,

    /// Per-provider token pricing, USD per million tokens. Sourced from
    /// configuration because provider rates change; 0 disables accounting.
    #[serde(default)]
    pub l2_input_cost_per_mtok: f64,

    #[serde(default)]
    pub l2_output_cost_per_mtok: f64,

    #[serde(default)]
    pub auto_promote: bool,

    #[serde(default = "default_true")]
    pub sensor_enabled: bool,

    #[serde(default = "default_sensor_port")]
    pub sensor_port: u16,

    #[serde(default)]
    pub ots_enabled: bool,

    #[serde(default = "default_learning_sync_interval")]
    pub learning_sync_interval: u64,

    #[serde(default = "default_promotion_check_interval")]
    pub promotion_check_interval: u64,

    #[serde(default = "default_prune_interval")]
    pub prune_interval: u64,

    #[serde(default = "default_retention_days")]
    pub incident_retention_days: u32,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// L3 notification channels (used when the control-plane route is down
    /// or disabled)
    #[serde(default)]
    pub slack_webhook: Option<String>,

    #[serde(default)]
    pub pagerduty_routing_key: Option<String>,

    #[serde(default)]
    pub teams_webhook: Option<String>,

    #[serde(default)]
    pub generic_webhook: Option<String>,

    #[serde(default)]
    pub email_recipients: Vec<String>,
}

impl ApplianceConfig {
    /// Evidence storage directory.
    pub fn evidence_dir(&self) -> PathBuf {
        self.state_dir.join("evidence")
    }

    /// L1 rules directory.
    pub fn rules_dir(&self) -> PathBuf {
        self.state_dir.join("rules")
    }

    /// Incident store database path.
    pub fn incidents_db_path(&self) -> PathBuf {
        self.state_dir.join("incidents.db")
    }

    /// Outbound sync queue database path.
    pub fn queue_db_path(&self) -> PathBuf {
        self.state_dir.join("learning_sync_queue.db")
    }

    /// Ed25519 signing key path.
    pub fn signing_key_path(&self) -> PathBuf {
        self.state_dir.join("signing.key")
    }

    /// OpenTimestamps proof directory.
    pub fn ots_dir(&self) -> PathBuf {
        self.state_dir.join("ots")
    }

    pub fn validate(&self) -> Result<()> {
        if self.site_id.is_empty() {
            return Err(ApplianceError::Config("site_id must not be empty".into()));
        }
        if self.api_key.is_empty() {
            return Err(ApplianceError::Config("api_key must not be empty".into()));
        }
        if !(10..=3600).contains(&self.poll_interval) {
            return Err(ApplianceError::Config(format!(
                "poll_interval {} out of range (10-3600)",
                self.poll_interval
            )));
        }
        if !self.api_endpoint.starts_with("http://") && !self.api_endpoint.starts_with("https://") {
            return Err(ApplianceError::Config(format!(
                "api_endpoint must be http(s): {}",
                self.api_endpoint
            )));
        }
        match self.log_level.to_uppercase().as_str() {
            "DEBUG" | "INFO" | "WARN" | "WARNING" | "ERROR" => Ok(()),
            other => Err(ApplianceError::Config(format!(
                "log_level must be DEBUG, INFO, WARNING, or ERROR (got {})",
                other
            ))),
        }
    }
}

/// Load configuration from a YAML file and apply environment overrides.
pub fn load_config(config_path: &Path) -> Result<ApplianceConfig> {
    if !config_path.exists() {
        return Err(ApplianceError::Config(format!(
            "config file not found: {}",
            config_path.display()
        )));
    }

    let content = std::fs::read_to_string(config_path)?;
    let mut config: ApplianceConfig = serde_yaml::from_str(&content)?;

    apply_env_overrides(&mut config);
    config.log_level = config.log_level.to_uppercase();
    config.validate()?;

    Ok(config)
}

/// Apply environment variable overrides to configuration.
fn apply_env_overrides(config: &mut ApplianceConfig) {
    if let Ok(v) = std::env::var("HEALING_DRY_RUN") {
        config.healing_dry_run = !matches!(v.to_lowercase().as_str(), "false" | "0" | "no");
    }
    if let Ok(v) = std::env::var("STATE_DIR") {
        config.state_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("LOG_LEVEL") {
        config.log_level = v;
    }
    if let Ok(v) = std::env::var("LLM_DAILY_BUDGET_USD") {
        if let Ok(parsed) = v.parse::<f64>() {
            config.llm_daily_budget_usd = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn minimal_yaml() -> &'static str {
        "site_id: clinic-001\napi_key: test-key\n"
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, minimal_yaml()).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.site_id, "clinic-001");
        assert_eq!(config.poll_interval, 60);
        assert!(config.enable_drift_detection);
        assert!(!config.healing_dry_run);
        assert_eq!(config.evidence_dir(), PathBuf::from("/var/lib/msp/evidence"));
    }

    #[test]
    fn rejects_missing_file() {
        let dir = tempdir().unwrap();
        let err = load_config(&dir.path().join("nope.yaml"));
        assert!(err.is_err());
    }

    #[test]
    fn rejects_bad_poll_interval() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "site_id: s\napi_key: k\npoll_interval: 5\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn rejects_bad_log_level() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "site_id: s\napi_key: k\nlog_level: verbose\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
