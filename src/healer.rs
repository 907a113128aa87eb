//! Three-tier incident resolution orchestrator.
//!
//! Routes each incident through L1 deterministic rules, the L2 LLM planner,
//! and L3 human escalation, guarded by a per-circuit rate limiter and a flap
//! detector. Flap counting happens only on successful healings: repeated
//! resolve-then-recur indicates an external override (e.g. GPO), while
//! re-detection of unhealed drift must not trip suppression.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::escalation::EscalationHandler;
use crate::incident_store::{
    Incident, IncidentStore, ResolutionLevel, Severity,
};
use crate::planner::{build_plan_context, Level2Planner};
use crate::rules::DeterministicEngine;

/// Receives execution telemetry after each heal (implemented by the sync
/// layer; fire-and-forget with offline queueing).
#[async_trait]
pub trait ExecutionReporter: Send + Sync {
    async fn report_execution(&self, execution: Value) -> bool;
}

/// Configuration for the auto-healer.
#[derive(Debug, Clone)]
pub struct AutoHealerConfig {
    /// Max heal attempts per circuit within the attempt window
    pub max_heal_attempts_per_incident: u32,
    /// Cooldown after the circuit breaker trips
    pub cooldown_period_minutes: i64,
    /// Attempt-counting window
    pub attempt_window_minutes: i64,
    /// Resolve->recur cycles before persistent suppression
    pub max_flap_count: u32,
    /// Flap-counting window; must exceed drift report cooldown * max_flap_count
    pub flap_window_minutes: i64,
}

impl Default for AutoHealerConfig {
    fn default() -> Self {
        Self {
            max_heal_attempts_per_incident: 5,
            cooldown_period_minutes: 30,
            attempt_window_minutes: 10,
            max_flap_count: 3,
            flap_window_minutes: 120,
        }
    }
}

/// Result of an auto-healing attempt.
#[derive(Debug, Clone)]
pub struct HealingResult {
    pub incident_id: String,
    pub success: bool,
    pub resolution_level: ResolutionLevel,
    pub action_taken: Option<String>,
    pub resolution_time_ms: i64,
    pub output: Option<String>,
    pub error: Option<String>,
    pub escalated: bool,
    pub ticket_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CircuitKey {
    site_id: String,
    host_id: String,
    flap_type: String,
}

/// Check types that indicate Windows targets.
const WINDOWS_CHECK_TYPES: [&str; 6] = [
    "windows_defender",
    "workstation",
    "bitlocker",
    "defender",
    "patches",
    "screen_lock",
];

/// Three-tier auto-healing orchestrator.
pub struct AutoHealer {
    config: AutoHealerConfig,
    store: Arc<IncidentStore>,
    level1: Option<Arc<DeterministicEngine>>,
    level2: Option<Arc<Level2Planner>>,
    level3: Option<Arc<EscalationHandler>>,
    reporter: Mutex<Option<Arc<dyn ExecutionReporter>>>,
    /// circuit key -> (attempt count, first attempt time)
    heal_attempts: Mutex<HashMap<CircuitKey, (u32, DateTime<Utc>)>>,
    /// circuit key -> cooldown expiry
    cooldowns: Mutex<HashMap<CircuitKey, DateTime<Utc>>>,
    /// circuit key -> (flap count, first flap time); successful heals only
    flap_tracker: Mutex<HashMap<CircuitKey, (u32, DateTime<Utc>)>>,
}

impl AutoHealer {
    pub fn new(
        config: AutoHealerConfig,
        store: Arc<IncidentStore>,
        level1: Option<Arc<DeterministicEngine>>,
        level2: Option<Arc<Level2Planner>>,
        level3: Option<Arc<EscalationHandler>>,
    ) -> Self {
        info!(
            l1 = level1.is_some(),
            l2 = level2.is_some(),
            l3 = level3.is_some(),
            max_attempts = config.max_heal_attempts_per_incident,
            cooldown_min = config.cooldown_period_minutes,
            max_flaps = config.max_flap_count,
            flap_window_min = config.flap_window_minutes,
            "auto-healer initialized"
        );
        Self {
            config,
            store,
            level1,
            level2,
            level3,
            reporter: Mutex::new(None),
            heal_attempts: Mutex::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
            flap_tracker: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the telemetry reporter after construction (the sync layer is
    /// built later in startup).
    pub fn set_reporter(&self, reporter: Arc<dyn ExecutionReporter>) {
        *self.reporter.lock() = Some(reporter);
    }

    pub fn store(&self) -> Arc<IncidentStore> {
        self.store.clone()
    }

    pub fn level1(&self) -> Option<Arc<DeterministicEngine>> {
        self.level1.clone()
    }

    fn is_in_cooldown(&self, key: &CircuitKey) -> Option<f64> {
        let mut cooldowns = self.cooldowns.lock();
        if let Some(until) = cooldowns.get(key).copied() {
            let now = Utc::now();
            if now >= until {
                cooldowns.remove(key);
                self.heal_attempts.lock().remove(key);
                return None;
            }
            return Some((until - now).num_seconds() as f64 / 60.0);
        }
        None
    }

    fn track_heal_attempt(&self, key: &CircuitKey, attempt_time: DateTime<Utc>) {
        let mut attempts = self.heal_attempts.lock();
        match attempts.get(key).copied() {
            Some((count, first)) => {
                let age_minutes = (attempt_time - first).num_seconds() as f64 / 60.0;
                if age_minutes > self.config.attempt_window_minutes as f64 {
                    attempts.insert(key.clone(), (1, attempt_time));
                } else {
                    let new_count = count + 1;
                    attempts.insert(key.clone(), (new_count, first));
                    if new_count >= self.config.max_heal_attempts_per_incident {
                        let until =
                            attempt_time + Duration::minutes(self.config.cooldown_period_minutes);
                        self.cooldowns.lock().insert(key.clone(), until);
                        error!(
                            incident_type = %key.flap_type,
                            host = %key.host_id,
                            attempts = new_count,
                            cooldown_minutes = self.config.cooldown_period_minutes,
                            "circuit breaker triggered, entering cooldown"
                        );
                    }
                }
            }
            None => {
                attempts.insert(key.clone(), (1, attempt_time));
            }
        }
    }

    fn is_flapping(&self, key: &CircuitKey) -> bool {
        let mut tracker = self.flap_tracker.lock();
        if let Some((count, first)) = tracker.get(key).copied() {
            let age_minutes = (Utc::now() - first).num_seconds() as f64 / 60.0;
            if age_minutes > self.config.flap_window_minutes as f64 {
                tracker.remove(key);
                return false;
            }
            return count >= self.config.max_flap_count;
        }
        false
    }

    /// Count a resolve->recur cycle. Called only after a successful heal.
    fn track_flap(&self, key: &CircuitKey) {
        let now = Utc::now();
        let mut tracker = self.flap_tracker.lock();
        match tracker.get(key).copied() {
            Some((count, first)) => {
                let age_minutes = (now - first).num_seconds() as f64 / 60.0;
                if age_minutes > self.config.flap_window_minutes as f64 {
                    tracker.insert(key.clone(), (1, now));
                } else {
                    let new_count = count + 1;
                    tracker.insert(key.clone(), (new_count, first));
                    if new_count >= self.config.max_flap_count {
                        warn!(
                            incident_type = %key.flap_type,
                            host = %key.host_id,
                            count = new_count,
                            "flap detected: resolved then recurred repeatedly, \
                             likely external override"
                        );
                    }
                }
            }
            None => {
                tracker.insert(key.clone(), (1, now));
            }
        }
    }

    /// Process an incident through the three-tier system.
    pub async fn heal(
        &self,
        site_id: &str,
        host_id: &str,
        incident_type: &str,
        severity: Severity,
        raw_data: Value,
    ) -> Result<HealingResult> {
        let start_time = Utc::now();

        // Distinct runbooks within the same check type get their own circuit
        let flap_type = match raw_data.get("runbook_id").and_then(|v| v.as_str()) {
            Some(runbook_id) => format!("{}:{}", incident_type, runbook_id),
            None => incident_type.to_string(),
        };
        let key = CircuitKey {
            site_id: site_id.to_string(),
            host_id: host_id.to_string(),
            flap_type: flap_type.clone(),
        };

        // Persistent suppression survives restarts; only a human clears it
        if self.store.is_flap_suppressed(site_id, host_id, &flap_type)? {
            info!(flap_type, host_id, "healing suppressed, awaiting operator clearance");
            return Ok(HealingResult {
                incident_id: format!("SUPPRESSED-{}", &Uuid::new_v4().simple().to_string()[..8]),
                success: false,
                resolution_level: ResolutionLevel::Level3Human,
                action_taken: Some("flap_suppressed_awaiting_human".into()),
                resolution_time_ms: 0,
                output: None,
                error: Some(format!(
                    "Persistent flap suppression active for {} - awaiting operator clearance",
                    flap_type
                )),
                escalated: true,
                ticket_id: None,
            });
        }

        if let Some(remaining) = self.is_in_cooldown(&key) {
            warn!(
                incident_type,
                host_id,
                remaining_minutes = remaining,
                "circuit breaker cooldown active, skipping heal"
            );
            return Ok(HealingResult {
                incident_id: format!("SKIPPED-{}", &Uuid::new_v4().simple().to_string()[..8]),
                success: false,
                resolution_level: ResolutionLevel::Level3Human,
                action_taken: Some("circuit_breaker_cooldown".into()),
                resolution_time_ms: 0,
                output: None,
                error: Some(format!(
                    "Circuit breaker active: {:.1} min cooldown remaining",
                    remaining
                )),
                escalated: false,
                ticket_id: None,
            });
        }

        if self.is_flapping(&key) {
            let reason = format!(
                "{} resolved then recurred {}+ times within {} min - likely external override (e.g., GPO)",
                flap_type, self.config.max_flap_count, self.config.flap_window_minutes
            );
            warn!(flap_type, host_id, "flap detector tripped, recording persistent suppression");
            self.store
                .record_flap_suppression(site_id, host_id, &flap_type, &reason)?;
            return Ok(HealingResult {
                incident_id: format!("FLAP-{}", &Uuid::new_v4().simple().to_string()[..8]),
                success: false,
                resolution_level: ResolutionLevel::Level3Human,
                action_taken: Some("flap_detected_escalation".into()),
                resolution_time_ms: (Utc::now() - start_time).num_milliseconds(),
                output: None,
                error: Some(format!(
                    "Flap detected: {} resolved then recurred {}+ times. Healing suppressed until operator clears.",
                    flap_type, self.config.max_flap_count
                )),
                escalated: true,
                ticket_id: None,
            });
        }

        self.track_heal_attempt(&key, start_time);

        let incident =
            self.store
                .create_incident(site_id, host_id, incident_type, severity, raw_data.clone())?;
        info!(incident_id = %incident.id, incident_type, severity = %severity, "processing incident");

        if self.level1.is_some() {
            if let Some(result) = self.try_level1(&incident, site_id, host_id, &raw_data).await {
                if result.success {
                    self.track_flap(&key);
                }
                return Ok(result);
            }
        }

        if let Some(level2) = &self.level2 {
            if level2.is_available().await {
                if let Some(result) = self.try_level2(&incident, site_id, host_id).await {
                    if !result.escalated {
                        if result.success {
                            self.track_flap(&key);
                        }
                        return Ok(result);
                    }
                }
            } else {
                warn!("L2 LLM not available, escalating");
            }
        }

        if let Some(level3) = self.level3.clone() {
            return self.escalate(&level3, &incident).await;
        }

        Ok(HealingResult {
            incident_id: incident.id,
            success: false,
            resolution_level: ResolutionLevel::Unresolved,
            action_taken: None,
            resolution_time_ms: (Utc::now() - start_time).num_milliseconds(),
            output: None,
            error: Some("No healing levels enabled".into()),
            escalated: false,
            ticket_id: None,
        })
    }

    async fn try_level1(
        &self,
        incident: &Incident,
        site_id: &str,
        host_id: &str,
        raw_data: &Value,
    ) -> Option<HealingResult> {
        let level1 = self.level1.as_ref()?;
        let start_time = Utc::now();

        let mut rule_match = level1.match_incident(
            &incident.id,
            &incident.incident_type,
            incident.severity,
            raw_data,
        )?;

        info!(rule = %rule_match.rule.id, action = %rule_match.action, "L1 rule matched");

        if rule_match.action == "escalate" {
            info!(rule = %rule_match.rule.id, "L1 rule triggers escalation");
            return None;
        }

        // Pass drift context through to the action handlers
        if let Value::Object(params) = &mut rule_match.action_params {
            for context_key in ["runbook_id", "distro", "host"] {
                if !params.contains_key(context_key) {
                    if let Some(v) = raw_data.get(context_key) {
                        params.insert(context_key.to_string(), v.clone());
                    }
                }
            }
        }

        let state_before = capture_system_state(incident, host_id);
        let execution = level1.execute(&rule_match, site_id, host_id).await;
        let state_after = capture_system_state(incident, host_id);

        let duration_ms = (Utc::now() - start_time).num_milliseconds();

        let result = HealingResult {
            incident_id: incident.id.clone(),
            success: execution.success,
            resolution_level: ResolutionLevel::Level1Deterministic,
            action_taken: Some(rule_match.action.clone()),
            resolution_time_ms: duration_ms,
            output: Some(execution.output.to_string()),
            error: execution.error.clone(),
            escalated: false,
            ticket_id: None,
        };

        self.report_execution_telemetry(
            incident,
            &result,
            &state_before,
            &state_after,
            &rule_match.action,
            &rule_match.rule.id,
        )
        .await;

        Some(result)
    }

    async fn try_level2(
        &self,
        incident: &Incident,
        site_id: &str,
        host_id: &str,
    ) -> Option<HealingResult> {
        let level2 = self.level2.as_ref()?;
        let start_time = Utc::now();

        let decision = match level2.plan(incident).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(error = %e, "L2 planning failed");
                return Some(HealingResult {
                    incident_id: incident.id.clone(),
                    success: false,
                    resolution_level: ResolutionLevel::Level2Llm,
                    action_taken: None,
                    resolution_time_ms: 0,
                    output: None,
                    error: Some(e.to_string()),
                    escalated: true,
                    ticket_id: None,
                });
            }
        };

        if decision.escalate_to_l3 {
            return Some(HealingResult {
                incident_id: incident.id.clone(),
                success: false,
                resolution_level: ResolutionLevel::Level2Llm,
                action_taken: None,
                resolution_time_ms: (Utc::now() - start_time).num_milliseconds(),
                output: None,
                error: Some(decision.reasoning.clone()),
                escalated: true,
                ticket_id: None,
            });
        }

        if decision.requires_approval {
            info!("L2 action requires approval, escalating");
            return Some(HealingResult {
                incident_id: incident.id.clone(),
                success: false,
                resolution_level: ResolutionLevel::Level2Llm,
                action_taken: Some(decision.recommended_action.clone()),
                resolution_time_ms: (Utc::now() - start_time).num_milliseconds(),
                output: None,
                error: Some("Requires human approval".into()),
                escalated: true,
                ticket_id: None,
            });
        }

        let state_before = capture_system_state(incident, host_id);
        let execution = level2.execute(&decision, site_id, host_id).await;
        let state_after = capture_system_state(incident, host_id);

        let duration_ms = (Utc::now() - start_time).num_milliseconds();

        let result = HealingResult {
            incident_id: incident.id.clone(),
            success: execution.success,
            resolution_level: ResolutionLevel::Level2Llm,
            action_taken: Some(decision.recommended_action.clone()),
            resolution_time_ms: duration_ms,
            output: Some(execution.output.to_string()),
            error: execution.error.clone(),
            escalated: false,
            ticket_id: None,
        };

        self.report_execution_telemetry(
            incident,
            &result,
            &state_before,
            &state_after,
            &decision.recommended_action,
            &format!("L2-{}", decision.recommended_action),
        )
        .await;

        Some(result)
    }

    async fn escalate(
        &self,
        level3: &EscalationHandler,
        incident: &Incident,
    ) -> Result<HealingResult> {
        let start_time = Utc::now();

        let context = build_plan_context(&self.store, incident).unwrap_or_default();

        let ticket = level3
            .escalate(incident, "Could not resolve automatically", &context, vec![], None)
            .await?;

        Ok(HealingResult {
            incident_id: incident.id.clone(),
            success: false,
            resolution_level: ResolutionLevel::Level3Human,
            action_taken: Some("escalated".into()),
            resolution_time_ms: (Utc::now() - start_time).num_milliseconds(),
            output: None,
            error: None,
            escalated: true,
            ticket_id: Some(ticket.id),
        })
    }

    /// Heal a drift check result (convenience wrapper for drift sources).
    pub async fn heal_drift(
        &self,
        site_id: &str,
        host_id: &str,
        check_type: &str,
        drifted: bool,
        details: Value,
    ) -> Result<HealingResult> {
        let raw_data = json!({
            "check_type": check_type,
            "drift_detected": drifted,
            "details": details,
        });
        let severity = if drifted { Severity::High } else { Severity::Info };
        self.heal(site_id, host_id, check_type, severity, raw_data).await
    }

    async fn report_execution_telemetry(
        &self,
        incident: &Incident,
        result: &HealingResult,
        state_before: &Value,
        state_after: &Value,
        action: &str,
        runbook_id: &str,
    ) {
        let reporter = self.reporter.lock().clone();
        let Some(reporter) = reporter else {
            return;
        };

        let confidence = match result.resolution_level {
            ResolutionLevel::Level1Deterministic => 1.0,
            _ => 0.8,
        };

        let execution = json!({
            "execution_id": Uuid::new_v4().to_string(),
            "incident_id": incident.id,
            "runbook_id": runbook_id,
            "hostname": incident.host_id,
            "platform": detect_platform(&incident.incident_type),
            "incident_type": incident.incident_type,
            "started_at": state_before.get("captured_at"),
            "completed_at": state_after.get("captured_at"),
            "duration_seconds": result.resolution_time_ms as f64 / 1000.0,
            "success": result.success,
            "status": if result.success { "success" } else { "failure" },
            "verification_passed": result.success && result.error.is_none(),
            "confidence": confidence,
            "resolution_level": result.resolution_level.as_str(),
            "state_before": state_before,
            "state_after": state_after,
            "state_diff": compute_state_diff(state_before, state_after),
            "executed_steps": [{"action": action, "success": result.success}],
            "error_message": result.error,
        });

        if reporter.report_execution(execution).await {
            tracing::debug!(incident_id = %incident.id, "reported execution telemetry");
        } else {
            tracing::debug!(incident_id = %incident.id, "queued execution telemetry");
        }
    }
}

/// Detect the target platform from the incident type.
pub fn detect_platform(incident_type: &str) -> &'static str {
    if WINDOWS_CHECK_TYPES.contains(&incident_type) {
        "windows"
    } else {
        "linux"
    }
}

/// Capture a lightweight, JSON-serializable state snapshot tuned to the
/// incident type, for before/after telemetry.
pub fn capture_system_state(incident: &Incident, host_id: &str) -> Value {
    let mut state = serde_json::Map::new();
    state.insert("captured_at".into(), json!(Utc::now().to_rfc3339()));
    state.insert("host_id".into(), json!(host_id));
    state.insert("incident_type".into(), json!(incident.incident_type));

    let type_lower = incident.incident_type.to_lowercase();
    if type_lower.contains("service") {
        let mut services = serde_json::Map::new();
        for key in ["service_name", "services", "check_type"] {
            match incident.raw_data.get(key) {
                Some(Value::String(s)) => {
                    services.insert(s.clone(), json!("unknown"));
                }
                Some(Value::Array(items)) => {
                    for item in items {
                        if let Some(s) = item.as_str() {
                            services.insert(s.to_string(), json!("unknown"));
                        }
                    }
                }
                _ => {}
            }
        }
        state.insert("services".into(), Value::Object(services));
    } else if type_lower.contains("firewall") {
        state.insert(
            "firewall_enabled".into(),
            incident
                .raw_data
                .pointer("/details/firewall_active")
                .cloned()
                .unwrap_or(json!(true)),
        );
    } else if type_lower.contains("bitlocker") || type_lower.contains("encryption") {
        state.insert("encryption_status".into(), json!({"system_drive": "unknown"}));
    } else if type_lower.contains("antivirus") || type_lower.contains("av_") {
        state.insert("av_enabled".into(), json!(true));
    } else if type_lower.contains("audit") {
        state.insert("audit_configured".into(), json!(true));
    }

    if let Value::Object(raw) = &incident.raw_data {
        let keys: Vec<String> = raw.keys().cloned().collect();
        state.insert("raw_data_keys".into(), json!(keys));
        for (key, value) in raw {
            let small = match value {
                Value::Bool(_) | Value::Number(_) => true,
                Value::String(s) => s.len() < 100,
                _ => false,
            };
            if small {
                state.insert(format!("raw_{}", key), value.clone());
            }
        }
    }

    Value::Object(state)
}

/// Compute the difference between before and after state snapshots.
pub fn compute_state_diff(before: &Value, after: &Value) -> Value {
    let empty = serde_json::Map::new();
    let before_map = before.as_object().unwrap_or(&empty);
    let after_map = after.as_object().unwrap_or(&empty);

    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut changed = Vec::new();
    let mut changes = serde_json::Map::new();

    for key in after_map.keys() {
        if !before_map.contains_key(key) {
            added.push(key.clone());
        }
    }
    for key in before_map.keys() {
        if !after_map.contains_key(key) {
            removed.push(key.clone());
        }
    }
    for (key, before_value) in before_map {
        if let Some(after_value) = after_map.get(key) {
            if before_value != after_value {
                changed.push(key.clone());
                changes.insert(
                    key.clone(),
                    json!({"before": before_value, "after": after_value}),
                );
            }
        }
    }

    json!({
        "added_keys": added,
        "removed_keys": removed,
        "changed_keys": changed,
        "changes": changes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::EscalationConfig;
    use crate::executor::{ActionExecutor, ActionOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct ScriptedExecutor {
        calls: AtomicUsize,
        succeed: bool,
    }

    #[async_trait]
    impl ActionExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            _action: &str,
            _params: &Value,
            _site_id: &str,
            _host_id: &str,
        ) -> Result<ActionOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ActionOutcome {
                success: self.succeed,
                error: if self.succeed { None } else { Some("remediation failed".into()) },
                method: "local".into(),
                detail: json!({}),
            })
        }
    }

    fn healer_with_executor(
        dir: &tempfile::TempDir,
        succeed: bool,
        config: AutoHealerConfig,
    ) -> (Arc<AutoHealer>, Arc<IncidentStore>, Arc<ScriptedExecutor>) {
        let store = Arc::new(IncidentStore::open(&dir.path().join("incidents.db")).unwrap());
        let executor = Arc::new(ScriptedExecutor {
            calls: AtomicUsize::new(0),
            succeed,
        });
        let level1 = Arc::new(DeterministicEngine::new(
            &dir.path().join("rules"),
            store.clone(),
            executor.clone(),
        ));
        let level3 = Arc::new(EscalationHandler::new(EscalationConfig::default(), store.clone()));
        let healer = Arc::new(AutoHealer::new(
            config,
            store.clone(),
            Some(level1),
            None,
            Some(level3),
        ));
        (healer, store, executor)
    }

    fn firewall_data(host: &str) -> Value {
        json!({
            "check_type": "firewall",
            "drift_detected": true,
            "host_id": host,
        })
    }

    #[tokio::test]
    async fn successful_l1_heal() {
        let dir = tempdir().unwrap();
        let (healer, store, executor) =
            healer_with_executor(&dir, true, AutoHealerConfig::default());

        let result = healer
            .heal("site-1", "h1", "firewall", Severity::High, firewall_data("h1"))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.resolution_level, ResolutionLevel::Level1Deterministic);
        assert_eq!(result.action_taken.as_deref(), Some("restore_firewall_baseline"));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        let stored = store.get_incident(&result.incident_id).unwrap().unwrap();
        assert!(stored.resolved_at.is_some());
    }

    #[tokio::test]
    async fn flap_detection_records_suppression_then_suppresses() {
        // S1: three successful heals in the window; the next call trips the
        // flap detector, records a persistent suppression, and escalates
        // without touching the executor; the call after that hits the
        // persistent suppression.
        let dir = tempdir().unwrap();
        let config = AutoHealerConfig {
            max_flap_count: 3,
            flap_window_minutes: 120,
            ..Default::default()
        };
        let (healer, store, executor) = healer_with_executor(&dir, true, config);

        // L1 rule cooldown would block repeat heals; use distinct hosts? No -
        // the circuit is per host. Instead widen via raw runbook_id variation:
        // cooldown key is rule:host, so clear cooldown by using rule with zero
        // cooldown. Simplest: call against the ntp rule loaded from disk.
        std::fs::create_dir_all(dir.path().join("rules")).unwrap();
        std::fs::write(
            dir.path().join("rules/ssh.yaml"),
            r#"
id: LIN-SSH-002
name: SSH config drift
conditions:
  - field: check_type
    operator: eq
    value: ssh_config
action: restart_service
action_params:
  service_name: sshd
cooldown_seconds: 0
priority: 30
"#,
        )
        .unwrap();
        healer.level1().unwrap().reload_rules();

        let data = json!({
            "check_type": "ssh_config",
            "drift_detected": true,
            "host_id": "h1",
            "runbook_id": "LIN-SSH-002",
        });

        for _ in 0..3 {
            let result = healer
                .heal("site-1", "h1", "ssh_config", Severity::High, data.clone())
                .await
                .unwrap();
            assert!(result.success);
        }
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);

        // 4th call: flap detector trips, persistent suppression recorded
        let result = healer
            .heal("site-1", "h1", "ssh_config", Severity::High, data.clone())
            .await
            .unwrap();
        assert_eq!(result.action_taken.as_deref(), Some("flap_detected_escalation"));
        assert_eq!(result.resolution_level, ResolutionLevel::Level3Human);
        assert!(result.escalated);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        assert!(store
            .is_flap_suppressed("site-1", "h1", "ssh_config:LIN-SSH-002")
            .unwrap());

        // 5th call: persistent suppression short-circuits
        let result = healer
            .heal("site-1", "h1", "ssh_config", Severity::High, data)
            .await
            .unwrap();
        assert_eq!(
            result.action_taken.as_deref(),
            Some("flap_suppressed_awaiting_human")
        );
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn circuit_breaker_cooldown_after_repeated_attempts() {
        // S2: five attempts inside the window trip the breaker; further calls
        // return the cooldown marker without invoking the executor.
        let dir = tempdir().unwrap();
        let (healer, _store, executor) = healer_with_executor(
            &dir,
            false,
            AutoHealerConfig {
                max_heal_attempts_per_incident: 5,
                cooldown_period_minutes: 30,
                ..Default::default()
            },
        );

        std::fs::create_dir_all(dir.path().join("rules")).unwrap();
        std::fs::write(
            dir.path().join("rules/fw.yaml"),
            r#"
id: FW-FAST
name: firewall no cooldown
conditions:
  - field: check_type
    operator: eq
    value: firewall
action: restore_firewall_baseline
cooldown_seconds: 0
priority: 2
"#,
        )
        .unwrap();
        healer.level1().unwrap().reload_rules();

        for _ in 0..5 {
            let result = healer
                .heal("site-1", "h1", "firewall", Severity::High, firewall_data("h1"))
                .await
                .unwrap();
            assert!(!result.success);
        }
        let calls_after_five = executor.calls.load(Ordering::SeqCst);
        assert_eq!(calls_after_five, 5);

        let result = healer
            .heal("site-1", "h1", "firewall", Severity::High, firewall_data("h1"))
            .await
            .unwrap();
        assert_eq!(result.action_taken.as_deref(), Some("circuit_breaker_cooldown"));
        assert_eq!(result.resolution_level, ResolutionLevel::Level3Human);
        assert_eq!(executor.calls.load(Ordering::SeqCst), calls_after_five);
    }

    #[tokio::test]
    async fn unmatched_incident_escalates_to_l3() {
        let dir = tempdir().unwrap();
        let (healer, store, executor) =
            healer_with_executor(&dir, true, AutoHealerConfig::default());

        let result = healer
            .heal(
                "site-1",
                "h1",
                "mystery_check",
                Severity::Medium,
                json!({"check_type": "mystery_check"}),
            )
            .await
            .unwrap();

        assert!(result.escalated);
        assert_eq!(result.resolution_level, ResolutionLevel::Level3Human);
        assert!(result.ticket_id.is_some());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

        let stored = store.get_incident(&result.incident_id).unwrap().unwrap();
        assert_eq!(stored.resolution_level, Some(ResolutionLevel::Level3Human));
    }

    #[tokio::test]
    async fn encryption_rule_escalates_without_execution() {
        let dir = tempdir().unwrap();
        let (healer, _store, executor) =
            healer_with_executor(&dir, true, AutoHealerConfig::default());

        let result = healer
            .heal(
                "site-1",
                "h1",
                "encryption",
                Severity::Critical,
                json!({"check_type": "encryption", "drift_detected": true}),
            )
            .await
            .unwrap();

        assert!(result.escalated);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn state_diff_reports_added_removed_changed() {
        let before = json!({"a": 1, "b": "x", "gone": true});
        let after = json!({"a": 2, "b": "x", "new": false});
        let diff = compute_state_diff(&before, &after);
        assert_eq!(diff["added_keys"], json!(["new"]));
        assert_eq!(diff["removed_keys"], json!(["gone"]));
        assert_eq!(diff["changed_keys"], json!(["a"]));
        assert_eq!(diff["changes"]["a"]["before"], 1);
        assert_eq!(diff["changes"]["a"]["after"], 2);
    }

    #[test]
    fn platform_detection() {
        assert_eq!(detect_platform("bitlocker"), "windows");
        assert_eq!(detect_platform("patches"), "windows");
        assert_eq!(detect_platform("firewall"), "linux");
    }

    #[tokio::test]
    async fn telemetry_reported_with_confidence_by_level() {
        struct CapturingReporter {
            captured: Mutex<Vec<Value>>,
        }
        #[async_trait]
        impl ExecutionReporter for CapturingReporter {
            async fn report_execution(&self, execution: Value) -> bool {
                self.captured.lock().push(execution);
                true
            }
        }

        let dir = tempdir().unwrap();
        let (healer, _store, _executor) =
            healer_with_executor(&dir, true, AutoHealerConfig::default());
        let reporter = Arc::new(CapturingReporter {
            captured: Mutex::new(Vec::new()),
        });
        healer.set_reporter(reporter.clone());

        healer
            .heal("site-1", "h1", "firewall", Severity::High, firewall_data("h1"))
            .await
            .unwrap();

        let captured = reporter.captured.lock();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0]["confidence"], 1.0);
        assert_eq!(captured[0]["resolution_level"], "L1");
        assert!(captured[0]["state_diff"].is_object());
    }
}
