//! Control-plane HTTP client.
//!
//! Bearer-authenticated JSON client over TLS 1.2+, with PHI scrubbing on
//! every outbound payload at the transport boundary. Infrastructure fields
//! (IPs, hostnames) are preserved because they are intentionally shared with
//! the partner dashboard.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::ApplianceConfig;
use crate::error::{ApplianceError, Result};
use crate::scrubber::PhiScrubber;
use crate::sync::SyncTransport;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// HTTP client for the control-plane API.
pub struct ControlPlaneClient {
    http: reqwest::Client,
    api_endpoint: String,
    site_id: String,
    scrubber: PhiScrubber,
    max_retries: u32,
}

impl ControlPlaneClient {
    pub fn new(config: &ApplianceConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", config.api_key))
                .map_err(|e| ApplianceError::Config(e.to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "X-Site-ID",
            HeaderValue::from_str(&config.site_id)
                .map_err(|e| ApplianceError::Config(e.to_string()))?,
        );

        let http = reqwest::Client::builder()
            .user_agent(format!("osiriscare-appliance/{}", VERSION))
            .default_headers(headers)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ApplianceError::Config(e.to_string()))?;

        Ok(Self {
            http,
            api_endpoint: config.api_endpoint.trim_end_matches('/').to_string(),
            site_id: config.site_id.clone(),
            scrubber: PhiScrubber::outbound(),
            max_retries: 3,
        })
    }

    fn scrub_outbound(&self, payload: &Value) -> Value {
        let (scrubbed, result) = self.scrubber.scrub_value(payload);
        if result.phi_scrubbed {
            warn!(
                patterns = result.patterns_matched,
                by_type = ?result.patterns_by_type,
                "PHI scrubbed from outbound payload"
            );
        }
        scrubbed
    }

    /// One request with in-process retry for transient failures.
    async fn request(&self, method: reqwest::Method, endpoint: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}{}", self.api_endpoint, endpoint);
        let scrubbed = body.map(|b| self.scrub_outbound(b));
        let mut last_error = ApplianceError::TransientRemote("no attempts made".into());

        for attempt in 0..self.max_retries {
            let mut request = self.http.request(method.clone(), &url);
            if let Some(body) = &scrubbed {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let data: Value = response.json().await.unwrap_or(Value::Null);
                    if status.is_success() {
                        return Ok(data);
                    }
                    let message = format!("{} {} -> {}: {}", method, endpoint, status, data);
                    return Err(match status.as_u16() {
                        401 | 403 => ApplianceError::AuthRemote(message),
                        400..=499 => ApplianceError::PermanentRemote(message),
                        _ => ApplianceError::TransientRemote(message),
                    });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "control plane request failed");
                    last_error = ApplianceError::TransientRemote(e.to_string());
                    if attempt + 1 < self.max_retries {
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                    }
                }
            }
        }

        Err(last_error)
    }

    // -----------------------------------------------------------------------
    // Phone-home
    // -----------------------------------------------------------------------

    /// Checkin. The response carries refreshed targets, runbooks, and flags
    /// (credential-pull discipline: credentials arrive here each cycle and
    /// are never persisted).
    #[allow(clippy::too_many_arguments)]
    pub async fn checkin(
        &self,
        hostname: &str,
        mac_address: &str,
        ip_addresses: &[String],
        uptime_seconds: u64,
        agent_version: &str,
        nixos_version: &str,
        has_local_credentials: bool,
    ) -> Result<Value> {
        let payload = json!({
            "site_id": self.site_id,
            "hostname": hostname,
            "mac_address": mac_address,
            "ip_addresses": ip_addresses,
            "uptime_seconds": uptime_seconds,
            "agent_version": agent_version,
            "nixos_version": nixos_version,
            "has_local_credentials": has_local_credentials,
        });
        let response = self
            .request(reqwest::Method::POST, "/api/appliances/checkin", Some(&payload))
            .await?;
        debug!(site_id = %self.site_id, "checkin successful");
        Ok(response)
    }

    // -----------------------------------------------------------------------
    // Rules sync
    // -----------------------------------------------------------------------

    /// Fetch L1 rules; the rule set depends on the site's healing tier.
    pub async fn sync_rules(&self) -> Result<(Vec<Value>, String)> {
        let endpoint = format!("/agent/sync?site_id={}", self.site_id);
        let response = self.request(reqwest::Method::GET, &endpoint, None).await?;
        let rules = response
            .get("rules")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let tier = response
            .get("healing_tier")
            .and_then(|v| v.as_str())
            .unwrap_or("standard")
            .to_string();
        info!(count = rules.len(), tier = %tier, "synced L1 rules");
        Ok((rules, tier))
    }

    // -----------------------------------------------------------------------
    // Learning loop feedback
    // -----------------------------------------------------------------------

    /// Report a successful resolution pattern (per heal).
    pub async fn report_pattern(
        &self,
        check_type: &str,
        issue_signature: &str,
        resolution_steps: &[String],
        success: bool,
        execution_time_ms: i64,
        runbook_id: Option<&str>,
    ) -> Result<()> {
        let payload = json!({
            "site_id": self.site_id,
            "check_type": check_type,
            "issue_signature": issue_signature,
            "resolution_steps": resolution_steps,
            "success": success,
            "execution_time_ms": execution_time_ms,
            "runbook_id": runbook_id,
            "reported_at": chrono::Utc::now().to_rfc3339(),
        });
        self.request(reqwest::Method::POST, "/agent/patterns", Some(&payload))
            .await?;
        Ok(())
    }

    /// Register an incident for dashboard visibility.
    pub async fn report_incident(&self, incident: &Value) -> Result<()> {
        self.request(reqwest::Method::POST, "/incidents", Some(incident))
            .await?;
        Ok(())
    }

    /// Report promotion candidates for server-side approval.
    pub async fn report_promotions(&self, report: &Value) -> Result<()> {
        self.request(
            reqwest::Method::POST,
            "/api/agent/sync/promotion-candidates",
            Some(report),
        )
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Orders
    // -----------------------------------------------------------------------

    pub async fn fetch_pending_orders(&self, appliance_id: &str) -> Result<Vec<Value>> {
        let endpoint = format!(
            "/api/sites/{}/appliances/{}/orders/pending",
            self.site_id, appliance_id
        );
        let response = self.request(reqwest::Method::GET, &endpoint, None).await?;
        Ok(response
            .get("orders")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    pub async fn acknowledge_order(&self, order_id: &str) -> Result<()> {
        let endpoint = format!("/api/orders/{}/acknowledge", order_id);
        self.request(reqwest::Method::POST, &endpoint, Some(&json!({})))
            .await?;
        Ok(())
    }

    pub async fn complete_order(&self, order_id: &str, success: bool, result: &Value) -> Result<()> {
        let endpoint = format!("/api/orders/{}/complete", order_id);
        let payload = json!({"success": success, "result": result});
        self.request(reqwest::Method::POST, &endpoint, Some(&payload))
            .await?;
        Ok(())
    }

    pub async fn health_check(&self) -> bool {
        self.request(reqwest::Method::GET, "/health", None).await.is_ok()
    }
}

#[async_trait]
impl SyncTransport for ControlPlaneClient {
    async fn post_pattern_stats(&self, payload: &Value) -> Result<Value> {
        self.request(
            reqwest::Method::POST,
            "/api/agent/sync/pattern-stats",
            Some(payload),
        )
        .await
    }

    async fn post_execution(&self, payload: &Value) -> Result<()> {
        self.request(reqwest::Method::POST, "/api/agent/executions", Some(payload))
            .await?;
        Ok(())
    }

    async fn submit_evidence(&self, payload: &Value) -> Result<String> {
        let endpoint = format!("/api/evidence/sites/{}/submit", self.site_id);
        let response = self
            .request(reqwest::Method::POST, &endpoint, Some(payload))
            .await?;
        let bundle_id = response
            .get("bundle_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        info!(bundle_id = %bundle_id, "evidence submitted");
        Ok(bundle_id)
    }

    async fn fetch_promoted_rules(&self, since: &str) -> Result<Vec<Value>> {
        let endpoint = format!(
            "/api/agent/sync/promoted-rules?site_id={}&since={}",
            self.site_id, since
        );
        let response = self.request(reqwest::Method::GET, &endpoint, None).await?;
        Ok(response
            .get("rules")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ApplianceConfig {
        serde_yaml::from_str(
            "site_id: clinic-001\napi_key: test-key\napi_endpoint: http://127.0.0.1:9\n",
        )
        .unwrap()
    }

    #[test]
    fn builds_client_with_site_headers() {
        let client = ControlPlaneClient::new(&test_config()).unwrap();
        assert_eq!(client.site_id, "clinic-001");
        assert_eq!(client.api_endpoint, "http://127.0.0.1:9");
    }

    #[test]
    fn outbound_scrub_preserves_infrastructure() {
        let client = ControlPlaneClient::new(&test_config()).unwrap();
        let payload = json!({
            "host": "10.0.0.5",
            "note": "patient SSN 123-45-6789",
        });
        let scrubbed = client.scrub_outbound(&payload);
        assert_eq!(scrubbed["host"], "10.0.0.5");
        assert!(scrubbed["note"].as_str().unwrap().contains("[SSN-REDACTED"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transient() {
        // port 9 (discard) refuses connections; retries exhaust quickly
        let mut config = test_config();
        config.api_endpoint = "http://127.0.0.1:1".into();
        let client = ControlPlaneClient::new(&config).unwrap();
        let err = client
            .request(reqwest::Method::GET, "/health", None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
