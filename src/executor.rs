//! Action executor: routes healing actions to a concrete transport.
//!
//! The executor is injected into the L1 engine and L2 planner. The host
//! executor handles local remediation (systemd, shell) and translates legacy
//! and runbook-style action names; remote transports (WinRM, SSH, agent
//! channels) live behind the same trait and are supplied by their drivers.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::sensors::{AgentRegistry, HealCommand};

/// Actions the healing tiers are allowed to request (case-sensitive).
pub const ALLOWED_ACTIONS: [&str; 11] = [
    "update_to_baseline_generation",
    "restart_av_service",
    "run_backup_job",
    "restart_logging_services",
    "restore_firewall_baseline",
    "renew_certificate",
    "cleanup_disk_space",
    "restart_service",
    "clear_cache",
    "rotate_logs",
    "escalate",
];

/// Legacy action names mapped to canonical Windows runbook IDs.
fn legacy_action_runbooks() -> &'static HashMap<&'static str, &'static str> {
    static MAP: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    MAP.get_or_init(|| {
        HashMap::from([
            ("restore_firewall_baseline", "RB-WIN-SEC-001"),
            ("restore_audit_policy", "RB-WIN-SEC-002"),
            ("restore_defender", "RB-WIN-SEC-006"),
            ("enable_bitlocker", "RB-WIN-SEC-005"),
            ("alert:firewall_disabled", "RB-WIN-FIREWALL-001"),
            ("alert:defender_disabled", "RB-WIN-SEC-006"),
            ("alert:bitlocker_disabled", "RB-WIN-SEC-005"),
            ("alert:audit_policy_drift", "RB-WIN-SEC-002"),
            ("alert:password_policy_drift", "RB-WIN-SEC-004"),
            ("alert:lockout_policy_drift", "RB-WIN-SEC-003"),
            ("alert:screen_lock_drift", "RB-WIN-SEC-003"),
            ("alert:smb_signing_drift", "RB-WIN-SEC-007"),
            ("alert:ntlm_security_drift", "RB-WIN-SEC-008"),
            ("alert:unauthorized_admin", "RB-WIN-SEC-009"),
            ("alert:nla_disabled", "RB-WIN-SEC-010"),
            ("alert:uac_disabled", "RB-WIN-SEC-011"),
            ("alert:eventlog_protection_drift", "RB-WIN-SEC-012"),
            ("alert:credguard_disabled", "RB-WIN-SEC-013"),
            ("alert:time_service_failed", "RB-WIN-SVC-004"),
            ("alert:dns_client_failed", "RB-WIN-NET-001"),
            ("alert:patches_missing", "RB-WIN-PATCH-001"),
        ])
    })
}

/// Legacy `AUTO-<CHECK_TYPE>` promoted-rule runbook IDs mapped to canonical
/// runbook IDs. New promotions emit canonical IDs; this table keeps old rule
/// files working.
fn check_type_runbooks() -> &'static HashMap<&'static str, &'static str> {
    static MAP: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    MAP.get_or_init(|| {
        HashMap::from([
            ("firewall", "RB-WIN-FIREWALL-001"),
            ("firewall_status", "RB-WIN-FIREWALL-001"),
            ("defender", "RB-WIN-SEC-006"),
            ("defender_status", "RB-WIN-SEC-006"),
            ("bitlocker", "RB-WIN-SEC-005"),
            ("bitlocker_status", "RB-WIN-SEC-005"),
            ("screen_lock", "RB-WIN-SEC-003"),
            ("audit_policy", "RB-WIN-SEC-002"),
            ("patches", "RB-WIN-PATCH-001"),
        ])
    })
}

/// Whether an action name is recognized by the executor layer: allow-listed,
/// a `run_runbook:<ID>` form, or a legacy translation-table entry.
pub fn is_known_action(action: &str) -> bool {
    ALLOWED_ACTIONS.contains(&action)
        || action.starts_with("run_runbook:")
        || legacy_action_runbooks().contains_key(action)
}

/// Map an `AUTO-<CHECK_TYPE>` runbook ID to a canonical runbook ID.
pub fn canonicalize_runbook_id(runbook_id: &str) -> Option<String> {
    let check_type = runbook_id.strip_prefix("AUTO-")?;
    let lowered = check_type.to_lowercase();
    let collapsed = lowered.replace('_', "");
    check_type_runbooks()
        .get(lowered.as_str())
        .or_else(|| check_type_runbooks().get(collapsed.as_str()))
        .map(|s| s.to_string())
}

/// Result of one executor invocation.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// Transport tag: "local", "winrm", "ssh", "agent", "dry_run", "escalate"
    pub method: String,
    pub detail: Value,
}

impl ActionOutcome {
    pub fn failure(method: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            method: method.to_string(),
            detail: Value::Null,
        }
    }
}

/// Executes healing actions against a site/host. Implementations must be
/// cooperative: timeout-bound and cancellable.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        action: &str,
        params: &Value,
        site_id: &str,
        host_id: &str,
    ) -> Result<ActionOutcome>;
}

/// Remote runbook transport (WinRM/SSH drivers), injected per deployment.
#[async_trait]
pub trait RunbookTransport: Send + Sync {
    async fn run_runbook(
        &self,
        runbook_id: &str,
        params: &Value,
        host_id: &str,
    ) -> Result<ActionOutcome>;
}

/// Host-side executor: local systemd/shell actions, runbook dispatch, legacy
/// translation, agent fast path.
pub struct HostExecutor {
    dry_run: bool,
    registry: Option<std::sync::Arc<AgentRegistry>>,
    transport: Option<std::sync::Arc<dyn RunbookTransport>>,
}

impl HostExecutor {
    pub fn new(
        dry_run: bool,
        registry: Option<std::sync::Arc<AgentRegistry>>,
        transport: Option<std::sync::Arc<dyn RunbookTransport>>,
    ) -> Self {
        Self {
            dry_run,
            registry,
            transport,
        }
    }

    async fn run_local_command(&self, command: &str, timeout_secs: u64) -> ActionOutcome {
        let run = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output();

        match tokio::time::timeout(Duration::from_secs(timeout_secs), run).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                ActionOutcome {
                    success: output.status.success(),
                    error: if output.status.success() {
                        None
                    } else {
                        Some(stderr.chars().take(500).collect())
                    },
                    method: "local".to_string(),
                    detail: json!({
                        "command": command,
                        "exit_code": output.status.code(),
                        "stdout": stdout.chars().take(1000).collect::<String>(),
                        "stderr": stderr.chars().take(500).collect::<String>(),
                    }),
                }
            }
            Ok(Err(e)) => ActionOutcome::failure("local", format!("spawn failed: {}", e)),
            Err(_) => ActionOutcome::failure("local", format!("timeout after {}s", timeout_secs)),
        }
    }

    async fn restart_service(&self, params: &Value) -> ActionOutcome {
        let Some(service) = params.get("service_name").and_then(|v| v.as_str()) else {
            return ActionOutcome::failure("local", "service_name required");
        };
        let outcome = self
            .run_local_command(&format!("systemctl restart {}", service), 30)
            .await;
        info!(service, success = outcome.success, "restarted service");
        outcome
    }

    async fn run_command_action(&self, params: &Value) -> ActionOutcome {
        let Some(command) = params.get("command").and_then(|v| v.as_str()) else {
            return ActionOutcome::failure("local", "command required");
        };
        let timeout_secs = params.get("timeout").and_then(|v| v.as_u64()).unwrap_or(30);
        self.run_local_command(command, timeout_secs).await
    }

    async fn run_runbook(&self, runbook_id: &str, params: &Value, host_id: &str) -> ActionOutcome {
        // Agent fast path: a connected workstation agent advertising this
        // runbook's check type takes a queued HealCommand on next heartbeat
        // instead of a remote shell session.
        if let Some(registry) = &self.registry {
            if let Some((check_type, agent_action)) = AgentRegistry::fast_path_for(runbook_id) {
                if registry.has_agent_for_host(host_id) {
                    let command = HealCommand {
                        command_id: format!("heal-{}", &Uuid::new_v4().simple().to_string()[..12]),
                        check_type: check_type.to_string(),
                        action: agent_action.to_string(),
                        params: params.clone(),
                        timeout_seconds: 60,
                    };
                    if registry.queue_heal_command(host_id, command.clone()) {
                        info!(runbook_id, host_id, command_id = %command.command_id,
                              "queued heal command for agent delivery");
                        return ActionOutcome {
                            success: true,
                            error: None,
                            method: "agent".to_string(),
                            detail: json!({
                                "runbook_id": runbook_id,
                                "command_id": command.command_id,
                                "delivery": "next_heartbeat",
                            }),
                        };
                    }
                }
            }
        }

        if let Some(transport) = &self.transport {
            match transport.run_runbook(runbook_id, params, host_id).await {
                Ok(outcome) => return outcome,
                Err(e) => return ActionOutcome::failure("winrm", e.to_string()),
            }
        }

        ActionOutcome::failure(
            "local",
            format!("no transport available for runbook {}", runbook_id),
        )
    }
}

#[async_trait]
impl ActionExecutor for HostExecutor {
    async fn execute(
        &self,
        action: &str,
        params: &Value,
        _site_id: &str,
        host_id: &str,
    ) -> Result<ActionOutcome> {
        if self.dry_run {
            info!(action, ?params, "[DRY-RUN] would execute");
            return Ok(ActionOutcome {
                success: true,
                error: None,
                method: "dry_run".to_string(),
                detail: json!({"action": action, "params": params, "status": "simulated_success"}),
            });
        }

        match action {
            "restart_service" | "restart_av_service" => Ok(self.restart_service(params).await),
            "restart_logging_services" => {
                let services = params
                    .get("logging_services")
                    .and_then(|v| v.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str())
                            .map(String::from)
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_else(|| vec!["systemd-journald".into(), "rsyslog".into()]);
                let mut last = ActionOutcome {
                    success: true,
                    error: None,
                    method: "local".into(),
                    detail: json!({"restarted": services}),
                };
                for service in &services {
                    let outcome = self
                        .run_local_command(&format!("systemctl restart {}", service), 30)
                        .await;
                    if !outcome.success {
                        last = outcome;
                        break;
                    }
                }
                Ok(last)
            }
            "run_command" => Ok(self.run_command_action(params).await),
            "run_backup_job" => {
                let job = params
                    .get("job_name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("restic-backup");
                Ok(self
                    .run_local_command(&format!("systemctl start {}.service", job), 120)
                    .await)
            }
            "cleanup_disk_space" => {
                let targets = params
                    .get("targets")
                    .and_then(|v| v.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str())
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .unwrap_or_else(|| "/var/log /tmp /var/cache".to_string());
                Ok(self
                    .run_local_command(
                        &format!("journalctl --vacuum-time=7d && du -sh {}", targets),
                        60,
                    )
                    .await)
            }
            "rotate_logs" => Ok(self.run_local_command("logrotate --force /etc/logrotate.conf", 60).await),
            "clear_cache" => Ok(self.run_local_command("sync && rm -rf /var/cache/msp/*", 30).await),
            "update_to_baseline_generation" | "renew_certificate" => {
                // These route through the remote transport's runbook library
                // when one is attached; there is no safe local fallback.
                if let Some(transport) = &self.transport {
                    transport.run_runbook(action, params, host_id).await
                } else {
                    Ok(ActionOutcome::failure(
                        "local",
                        format!("no transport available for {}", action),
                    ))
                }
            }
            "escalate" => Ok(ActionOutcome {
                success: false,
                error: None,
                method: "escalate".to_string(),
                detail: params.clone(),
            }),
            other if other.starts_with("run_runbook:") => {
                let mut runbook_id = other["run_runbook:".len()..].to_string();
                if runbook_id.starts_with("AUTO-") {
                    match canonicalize_runbook_id(&runbook_id) {
                        Some(mapped) => {
                            info!(legacy = %runbook_id, canonical = %mapped, "mapped legacy runbook id");
                            runbook_id = mapped;
                        }
                        None => {
                            warn!(runbook_id = %runbook_id, "could not map AUTO-* runbook id");
                        }
                    }
                }
                Ok(self.run_runbook(&runbook_id, params, host_id).await)
            }
            other => {
                if let Some(runbook_id) = legacy_action_runbooks().get(other) {
                    info!(action = other, runbook_id, "translating legacy action to runbook");
                    Ok(self.run_runbook(runbook_id, params, host_id).await)
                } else {
                    warn!(action = other, "unknown healing action refused");
                    Ok(ActionOutcome::failure(
                        "local",
                        format!("Unknown action: {}", other),
                    ))
                }
            }
        }
    }
}

/// Resolve a configured target by exact hostname, short name, IP, then first
/// available.
pub fn resolve_target<'a, T>(
    targets: &'a [T],
    wanted: &str,
    hostname_of: impl Fn(&T) -> &str,
    ip_of: impl Fn(&T) -> &str,
) -> Option<&'a T> {
    if targets.is_empty() {
        return None;
    }
    let wanted_short = wanted.split('.').next().unwrap_or(wanted).to_lowercase();

    targets
        .iter()
        .find(|t| hostname_of(t).eq_ignore_ascii_case(wanted))
        .or_else(|| {
            targets.iter().find(|t| {
                hostname_of(t)
                    .split('.')
                    .next()
                    .map(|s| s.to_lowercase() == wanted_short)
                    .unwrap_or(false)
            })
        })
        .or_else(|| targets.iter().find(|t| ip_of(t) == wanted))
        .or_else(|| targets.first())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_action_classification() {
        assert!(is_known_action("restart_service"));
        assert!(is_known_action("escalate"));
        assert!(is_known_action("run_runbook:RB-WIN-SEC-001"));
        assert!(is_known_action("alert:firewall_disabled"));
        assert!(!is_known_action("rm_everything"));
    }

    #[test]
    fn auto_runbook_ids_canonicalize() {
        assert_eq!(
            canonicalize_runbook_id("AUTO-BITLOCKER_STATUS").as_deref(),
            Some("RB-WIN-SEC-005")
        );
        assert_eq!(
            canonicalize_runbook_id("AUTO-FIREWALL").as_deref(),
            Some("RB-WIN-FIREWALL-001")
        );
        assert_eq!(canonicalize_runbook_id("AUTO-UNKNOWN_THING"), None);
        assert_eq!(canonicalize_runbook_id("RB-WIN-SEC-001"), None);
    }

    #[test]
    fn target_resolution_order() {
        let targets = vec![
            ("dc01.clinic.local".to_string(), "10.0.0.5".to_string()),
            ("ws12.clinic.local".to_string(), "10.0.0.12".to_string()),
        ];
        fn by_host(t: &(String, String)) -> &str {
            t.0.as_str()
        }
        fn by_ip(t: &(String, String)) -> &str {
            t.1.as_str()
        }

        // exact
        assert_eq!(
            resolve_target(&targets, "ws12.clinic.local", by_host, by_ip).unwrap().1,
            "10.0.0.12"
        );
        // short name
        assert_eq!(
            resolve_target(&targets, "WS12", by_host, by_ip).unwrap().1,
            "10.0.0.12"
        );
        // ip
        assert_eq!(
            resolve_target(&targets, "10.0.0.5", by_host, by_ip).unwrap().0,
            "dc01.clinic.local"
        );
        // fallback to first
        assert_eq!(
            resolve_target(&targets, "unknown-host", by_host, by_ip).unwrap().0,
            "dc01.clinic.local"
        );
    }

    #[tokio::test]
    async fn dry_run_simulates_success() {
        let exec = HostExecutor::new(true, None, None);
        let outcome = exec
            .execute("restart_service", &serde_json::json!({"service_name": "nginx"}), "s", "h")
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.method, "dry_run");
    }

    #[tokio::test]
    async fn unknown_action_is_refused() {
        let exec = HostExecutor::new(false, None, None);
        let outcome = exec
            .execute("wipe_disk", &serde_json::json!({}), "s", "h")
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Unknown action"));
    }

    #[tokio::test]
    async fn run_command_requires_command_param() {
        let exec = HostExecutor::new(false, None, None);
        let outcome = exec
            .execute("run_command", &serde_json::json!({}), "s", "h")
            .await
            .unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn local_command_executes() {
        let exec = HostExecutor::new(false, None, None);
        let outcome = exec
            .execute(
                "run_command",
                &serde_json::json!({"command": "echo healing-ok"}),
                "s",
                "h",
            )
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.detail["stdout"].as_str().unwrap().contains("healing-ok"));
    }
}
