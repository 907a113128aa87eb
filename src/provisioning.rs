//! Appliance provisioning.
//!
//! Exchanges a one-time provisioning code for site credentials at the
//! control plane and writes the initial `config.yaml`.

use std::io::Write;
use std::path::Path;

use serde_json::{json, Value};
use tracing::info;

use crate::error::{ApplianceError, Result};

const DEFAULT_PROVISIONING_ENDPOINT: &str = "https://api.osiriscare.net";

/// Claim a provisioning code and write `config.yaml` under `state_dir`.
pub async fn provision(code: &str, state_dir: &Path, api_endpoint: Option<&str>) -> Result<()> {
    let endpoint = api_endpoint.unwrap_or(DEFAULT_PROVISIONING_ENDPOINT);
    let url = format!("{}/api/provisioning/claim", endpoint.trim_end_matches('/'));

    let response = reqwest::Client::new()
        .post(&url)
        .timeout(std::time::Duration::from_secs(30))
        .json(&json!({
            "provisioning_code": code,
            "hostname": crate::agent::get_hostname(),
        }))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(ApplianceError::Config(format!(
            "provisioning failed: {}",
            response.status()
        )));
    }

    let body: Value = response.json().await?;
    let site_id = body
        .get("site_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApplianceError::Config("provisioning response missing site_id".into()))?;
    let api_key = body
        .get("api_key")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApplianceError::Config("provisioning response missing api_key".into()))?;
    let assigned_endpoint = body
        .get("api_endpoint")
        .and_then(|v| v.as_str())
        .unwrap_or(endpoint);

    write_config(state_dir, site_id, api_key, assigned_endpoint)?;
    info!(site_id, "appliance provisioned");
    Ok(())
}

/// Prompt for a provisioning code on stdin, then provision.
pub async fn provision_interactive(state_dir: &Path, api_endpoint: Option<&str>) -> Result<()> {
    print!("Enter provisioning code: ");
    std::io::stdout().flush()?;
    let mut code = String::new();
    std::io::stdin().read_line(&mut code)?;
    let code = code.trim();
    if code.is_empty() {
        return Err(ApplianceError::Config("provisioning cancelled".into()));
    }
    provision(code, state_dir, api_endpoint).await
}

fn write_config(state_dir: &Path, site_id: &str, api_key: &str, api_endpoint: &str) -> Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let config_path = state_dir.join("config.yaml");
    let config = format!(
        "site_id: {}\napi_key: {}\napi_endpoint: {}\n",
        site_id, api_key, api_endpoint
    );
    std::fs::write(&config_path, config)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))?;
    }

    info!(path = %config_path.display(), "wrote appliance config");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "clinic-007", "key-abc", "https://cc.example.net").unwrap();

        let config = crate::config::load_config(&dir.path().join("config.yaml")).unwrap();
        assert_eq!(config.site_id, "clinic-007");
        assert_eq!(config.api_key, "key-abc");
        assert_eq!(config.api_endpoint, "https://cc.example.net");
    }

    #[tokio::test]
    async fn unreachable_control_plane_fails_provisioning() {
        let dir = tempfile::tempdir().unwrap();
        let result = provision("CODE-123", dir.path(), Some("http://127.0.0.1:1")).await;
        assert!(result.is_err());
    }
}
