//! Agent update surface.
//!
//! The actual A/B partition switch is performed by an external applier; this
//! module speaks its command contract and reports local update state.

use std::path::PathBuf;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::ApplianceConfig;
use crate::detectors::run_command;
use crate::error::{ApplianceError, Result};

/// External applier binary, overridable for packaging layouts.
fn applier_bin() -> String {
    std::env::var("APPLIANCE_UPDATE_BIN").unwrap_or_else(|_| "appliance-update".to_string())
}

fn status_path(config: &ApplianceConfig) -> PathBuf {
    config.state_dir.join("update_status.json")
}

async fn run_applier(subcommand: &str, extra: &[&str]) -> Result<Value> {
    let mut cmd = format!("{} {}", applier_bin(), subcommand);
    for arg in extra {
        cmd.push(' ');
        cmd.push_str(arg);
    }
    let (code, stdout, stderr) = run_command(&cmd, 600).await;
    if code != 0 {
        return Err(ApplianceError::Config(format!(
            "update applier failed ({}): {}",
            code,
            stderr.trim()
        )));
    }
    Ok(serde_json::from_str(&stdout).unwrap_or(json!({"output": stdout.trim()})))
}

/// Handle an `update_agent` / `update_iso` order by delegating to the applier.
pub async fn request_update(config: &ApplianceConfig, params: &Value) -> Result<Value> {
    let version = params.get("version").and_then(|v| v.as_str()).unwrap_or("latest");
    info!(version, "update requested, delegating to applier");

    let result = run_applier("apply", &["--version", version]).await?;
    std::fs::write(
        status_path(config),
        serde_json::to_string_pretty(&json!({
            "requested_version": version,
            "requested_at": chrono::Utc::now().to_rfc3339(),
            "applier_result": result,
        }))?,
    )?;
    Ok(result)
}

/// `update_agent --check`: ask the applier whether a newer build exists.
pub async fn check() -> Result<Value> {
    run_applier("check", &[]).await
}

/// `update_agent --status`: local update state plus running version.
pub async fn status(config: &ApplianceConfig) -> Result<Value> {
    let recorded = std::fs::read_to_string(status_path(config))
        .ok()
        .and_then(|s| serde_json::from_str::<Value>(&s).ok())
        .unwrap_or(Value::Null);
    Ok(json!({
        "running_version": crate::client::VERSION,
        "last_update": recorded,
    }))
}

/// `update_agent --rollback`: flip back to the previous partition.
pub async fn rollback() -> Result<Value> {
    warn!("rollback requested");
    run_applier("rollback", &[]).await
}

/// `update_agent --health`: check the appliance's own service surface.
pub async fn health(config: &ApplianceConfig) -> Result<Value> {
    let db_ok = config.incidents_db_path().exists();
    let key_ok = config.signing_key_path().exists();
    let sensor_url = format!("http://127.0.0.1:{}/health", config.sensor_port);
    let sensor_ok = reqwest::Client::new()
        .get(&sensor_url)
        .timeout(std::time::Duration::from_secs(3))
        .send()
        .await
        .map(|r| r.status().is_success())
        .unwrap_or(false);

    Ok(json!({
        "version": crate::client::VERSION,
        "incident_db": db_ok,
        "signing_key": key_ok,
        "sensor_api": sensor_ok,
        "healthy": db_ok,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir) -> ApplianceConfig {
        serde_yaml::from_str(&format!(
            "site_id: s\napi_key: k\nstate_dir: {}\n",
            dir.path().display()
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn status_reports_running_version_without_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let status = status(&config).await.unwrap();
        assert_eq!(status["running_version"], crate::client::VERSION);
        assert!(status["last_update"].is_null());
    }

    #[tokio::test]
    async fn missing_applier_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        std::env::set_var("APPLIANCE_UPDATE_BIN", "/nonexistent/appliance-update");
        let result = request_update(&config, &json!({"version": "1.2.3"})).await;
        std::env::remove_var("APPLIANCE_UPDATE_BIN");
        assert!(result.is_err());
    }
}
