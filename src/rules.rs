//! Level 1: deterministic rules engine.
//!
//! Fast, predictable incident resolution with zero LLM cost. Rules come from
//! built-in defaults plus YAML files under the rules directory (including
//! `promoted/` for rules generated by the learning subsystem). Reads go
//! against an immutable snapshot that is swapped atomically on reload.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::error::{ApplianceError, Result};
use crate::executor::{is_known_action, ActionExecutor};
use crate::incident_store::{IncidentOutcome, IncidentStore, ResolutionLevel, Severity};

/// Operators for rule conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOperator {
    #[serde(rename = "eq")]
    Equals,
    #[serde(rename = "ne")]
    NotEquals,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "regex")]
    Regex,
    #[serde(rename = "gt")]
    GreaterThan,
    #[serde(rename = "lt")]
    LessThan,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
}

/// A single condition in a rule. All of a rule's conditions are AND-combined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: String,
    pub operator: MatchOperator,
    pub value: Value,
    #[serde(skip)]
    compiled: Option<Regex>,
}

impl RuleCondition {
    pub fn new(field: &str, operator: MatchOperator, value: Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
            compiled: None,
        }
    }

    /// Precompile the regex for `regex` conditions. Called once at rule load.
    fn compile(&mut self) -> Result<()> {
        if self.operator == MatchOperator::Regex {
            let pattern = self
                .value
                .as_str()
                .ok_or_else(|| ApplianceError::Rule(format!("regex value for {} must be a string", self.field)))?;
            self.compiled = Some(
                Regex::new(pattern)
                    .map_err(|e| ApplianceError::Rule(format!("invalid regex for {}: {}", self.field, e)))?,
            );
        }
        Ok(())
    }

    fn field_value<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
        let mut current = data;
        for part in path.split('.') {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    fn as_display_string(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn as_number(value: &Value) -> Option<f64> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    fn values_equal(a: &Value, b: &Value) -> bool {
        if a == b {
            return true;
        }
        match (Self::as_number(a), Self::as_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    pub fn matches(&self, data: &Value) -> bool {
        let Some(actual) = Self::field_value(data, &self.field) else {
            return false;
        };
        if actual.is_null() {
            return false;
        }

        match self.operator {
            MatchOperator::Equals => Self::values_equal(actual, &self.value),
            MatchOperator::NotEquals => !Self::values_equal(actual, &self.value),
            MatchOperator::Contains => {
                let needle = Self::as_display_string(&self.value);
                Self::as_display_string(actual).contains(&needle)
            }
            MatchOperator::Regex => match &self.compiled {
                Some(re) => re.is_match(&Self::as_display_string(actual)),
                None => false,
            },
            MatchOperator::GreaterThan => match (Self::as_number(actual), Self::as_number(&self.value)) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            MatchOperator::LessThan => match (Self::as_number(actual), Self::as_number(&self.value)) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
            MatchOperator::In => match self.value.as_array() {
                Some(list) => list.iter().any(|v| Self::values_equal(actual, v)),
                None => false,
            },
            MatchOperator::NotIn => match self.value.as_array() {
                Some(list) => !list.iter().any(|v| Self::values_equal(actual, v)),
                None => false,
            },
        }
    }
}

/// Where a rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSource {
    Builtin,
    Custom,
    Promoted,
}

fn default_priority() -> i32 {
    100
}

fn default_cooldown() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

fn default_source() -> RuleSource {
    RuleSource::Custom
}

/// A deterministic remediation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub conditions: Vec<RuleCondition>,
    pub action: String,
    #[serde(default)]
    pub action_params: Value,
    #[serde(default)]
    pub hipaa_controls: Vec<String>,
    #[serde(default)]
    pub severity_filter: Option<Vec<Severity>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Lower = matched first
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_source")]
    pub source: RuleSource,
}

impl Rule {
    pub fn matches(&self, severity: Severity, data: &Value) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(filter) = &self.severity_filter {
            if !filter.contains(&severity) {
                return false;
            }
        }
        self.conditions.iter().all(|c| c.matches(data))
    }

    fn finalize(&mut self) -> Result<()> {
        if !is_known_action(&self.action) {
            return Err(ApplianceError::Rule(format!(
                "rule {}: action '{}' is not recognized",
                self.id, self.action
            )));
        }
        if self.action_params.is_null() {
            self.action_params = json!({});
        }
        for condition in &mut self.conditions {
            condition.compile()?;
        }
        Ok(())
    }
}

/// A rule that matched an incident.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule: Rule,
    pub incident_id: String,
    pub matched_at: DateTime<Utc>,
    pub action: String,
    pub action_params: Value,
}

/// Result of executing a matched rule.
#[derive(Debug, Clone)]
pub struct RuleExecution {
    pub rule_id: String,
    pub incident_id: String,
    pub action: String,
    pub success: bool,
    pub output: Value,
    pub error: Option<String>,
    pub duration_ms: i64,
}

/// Counts describing the loaded rule set.
#[derive(Debug, Clone, Serialize)]
pub struct RuleStats {
    pub total_rules: usize,
    pub enabled_rules: usize,
    pub by_source: HashMap<String, usize>,
    pub by_action: HashMap<String, usize>,
    pub active_cooldowns: usize,
}

/// Level 1 deterministic rules engine.
pub struct DeterministicEngine {
    rules_dir: PathBuf,
    snapshot: RwLock<Arc<Vec<Rule>>>,
    /// rule_id:host_id -> last execution time. In-process only; resets on
    /// restart by design.
    cooldowns: Mutex<HashMap<String, DateTime<Utc>>>,
    store: Arc<IncidentStore>,
    executor: Arc<dyn ActionExecutor>,
}

impl DeterministicEngine {
    pub fn new(rules_dir: &Path, store: Arc<IncidentStore>, executor: Arc<dyn ActionExecutor>) -> Self {
        let engine = Self {
            rules_dir: rules_dir.to_path_buf(),
            snapshot: RwLock::new(Arc::new(Vec::new())),
            cooldowns: Mutex::new(HashMap::new()),
            store,
            executor,
        };
        engine.reload_rules();
        engine
    }

    /// Rebuild the rule set from builtins + rule files and swap the snapshot.
    pub fn reload_rules(&self) {
        let mut rules = builtin_rules();

        for dir in [self.rules_dir.clone(), self.rules_dir.join("promoted")] {
            if !dir.is_dir() {
                continue;
            }
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    error!(dir = %dir.display(), error = %e, "failed to read rules directory");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
                if !matches!(ext, "yaml" | "yml") {
                    continue;
                }
                let source = if dir.ends_with("promoted") {
                    RuleSource::Promoted
                } else {
                    RuleSource::Custom
                };
                match load_rule_file(&path, source) {
                    Ok(mut loaded) => rules.append(&mut loaded),
                    Err(e) => error!(file = %path.display(), error = %e, "failed to load rule file"),
                }
            }
        }

        rules.sort_by_key(|r| r.priority);
        info!(count = rules.len(), "loaded L1 rules");
        *self.snapshot.write() = Arc::new(rules);
    }

    pub fn rules(&self) -> Arc<Vec<Rule>> {
        self.snapshot.read().clone()
    }

    /// Find the first matching rule not in cooldown for (rule, host).
    pub fn match_incident(
        &self,
        incident_id: &str,
        incident_type: &str,
        severity: Severity,
        raw_data: &Value,
    ) -> Option<RuleMatch> {
        // Conditions can reference the incident's own fields alongside raw
        // drift data, so evaluate against a merged document.
        let mut data = match raw_data {
            Value::Object(map) => Value::Object(map.clone()),
            Value::Null => json!({}),
            other => json!({"value": other}),
        };
        if let Value::Object(map) = &mut data {
            map.entry("incident_type".to_string())
                .or_insert_with(|| Value::String(incident_type.to_string()));
            map.entry("severity".to_string())
                .or_insert_with(|| Value::String(severity.as_str().to_string()));
        }

        let host_id = raw_data
            .get("host_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        let snapshot = self.rules();
        let now = Utc::now();

        for rule in snapshot.iter() {
            if !rule.matches(severity, &data) {
                continue;
            }

            let cooldown_key = format!("{}:{}", rule.id, host_id);
            if let Some(last) = self.cooldowns.lock().get(&cooldown_key) {
                let elapsed = (now - *last).num_seconds();
                if elapsed < rule.cooldown_seconds as i64 {
                    debug!(rule = %rule.id, elapsed, "rule in cooldown, skipping");
                    continue;
                }
            }

            return Some(RuleMatch {
                rule: rule.clone(),
                incident_id: incident_id.to_string(),
                matched_at: now,
                action: rule.action.clone(),
                action_params: rule.action_params.clone(),
            });
        }

        None
    }

    /// Execute a matched rule's action and record the resolution.
    pub async fn execute(&self, rule_match: &RuleMatch, site_id: &str, host_id: &str) -> RuleExecution {
        let started = Utc::now();
        self.cooldowns
            .lock()
            .insert(format!("{}:{}", rule_match.rule.id, host_id), started);

        let mut execution = RuleExecution {
            rule_id: rule_match.rule.id.clone(),
            incident_id: rule_match.incident_id.clone(),
            action: rule_match.action.clone(),
            success: false,
            output: Value::Null,
            error: None,
            duration_ms: 0,
        };

        match self
            .executor
            .execute(&rule_match.action, &rule_match.action_params, site_id, host_id)
            .await
        {
            Ok(outcome) => {
                execution.success = outcome.success;
                execution.error = outcome.error;
                execution.output = outcome.detail;
            }
            Err(e) => {
                error!(rule = %rule_match.rule.id, error = %e, "rule execution failed");
                execution.error = Some(e.to_string());
            }
        }

        execution.duration_ms = (Utc::now() - started).num_milliseconds();

        let outcome = if execution.success {
            IncidentOutcome::Success
        } else {
            IncidentOutcome::Failure
        };
        // Promoted rules stamp their id into the recorded action so the
        // post-promotion monitor can find their incidents
        let resolution_action = if rule_match.rule.source == RuleSource::Promoted {
            format!("{}:{}", rule_match.action, rule_match.rule.id)
        } else {
            rule_match.action.clone()
        };
        if let Err(e) = self.store.resolve_incident(
            &rule_match.incident_id,
            ResolutionLevel::Level1Deterministic,
            &resolution_action,
            outcome,
            execution.duration_ms,
        ) {
            error!(error = %e, "failed to record L1 resolution");
        }

        execution
    }

    pub fn rule_stats(&self) -> RuleStats {
        let snapshot = self.rules();
        let mut by_source: HashMap<String, usize> = HashMap::new();
        let mut by_action: HashMap<String, usize> = HashMap::new();
        for rule in snapshot.iter() {
            let source = match rule.source {
                RuleSource::Builtin => "builtin",
                RuleSource::Custom => "custom",
                RuleSource::Promoted => "promoted",
            };
            *by_source.entry(source.to_string()).or_insert(0) += 1;
            *by_action.entry(rule.action.clone()).or_insert(0) += 1;
        }
        RuleStats {
            total_rules: snapshot.len(),
            enabled_rules: snapshot.iter().filter(|r| r.enabled).count(),
            by_source,
            by_action,
            active_cooldowns: self.cooldowns.lock().len(),
        }
    }
}

/// Parse a rule file: a single rule mapping or `rules:` list.
fn load_rule_file(path: &Path, source: RuleSource) -> Result<Vec<Rule>> {
    let content = std::fs::read_to_string(path)?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&content)?;

    let mut rules = Vec::new();
    if let Some(list) = doc.get("rules").and_then(|v| v.as_sequence()) {
        for item in list {
            rules.push(serde_yaml::from_value::<Rule>(item.clone())?);
        }
    } else {
        rules.push(serde_yaml::from_value::<Rule>(doc)?);
    }

    for rule in &mut rules {
        rule.source = source;
        rule.finalize()?;
    }
    Ok(rules)
}

/// Serialize a rule back to its YAML-shaped structure.
pub fn rule_to_yaml_value(rule: &Rule) -> Result<serde_yaml::Value> {
    Ok(serde_yaml::to_value(rule)?)
}

/// Built-in default rules, seeded for baseline compliance coverage.
pub fn builtin_rules() -> Vec<Rule> {
    let mut rules = vec![
        Rule {
            id: "L1-ENCRYPT-001".into(),
            name: "Encryption Status Alert".into(),
            description: "Encryption issue detected - escalate to human".into(),
            conditions: vec![
                RuleCondition::new("check_type", MatchOperator::Equals, json!("encryption")),
                RuleCondition::new("drift_detected", MatchOperator::Equals, json!(true)),
            ],
            action: "escalate".into(),
            action_params: json!({
                "reason": "Encryption changes require human verification",
                "urgency": "high"
            }),
            hipaa_controls: vec!["164.312(a)(2)(iv)".into()],
            severity_filter: None,
            enabled: true,
            priority: 1,
            cooldown_seconds: 300,
            max_retries: 1,
            source: RuleSource::Builtin,
        },
        Rule {
            id: "L1-AV-001".into(),
            name: "AV/EDR Service Down".into(),
            description: "Antivirus or EDR service not running".into(),
            conditions: vec![
                RuleCondition::new("check_type", MatchOperator::Equals, json!("av_edr")),
                RuleCondition::new("drift_detected", MatchOperator::Equals, json!(true)),
                RuleCondition::new("details.service_running", MatchOperator::Equals, json!(false)),
            ],
            action: "restart_av_service".into(),
            action_params: json!({"service_name": "clamav-daemon"}),
            hipaa_controls: vec!["164.308(a)(5)(ii)(B)".into()],
            severity_filter: None,
            enabled: true,
            priority: 5,
            cooldown_seconds: 300,
            max_retries: 1,
            source: RuleSource::Builtin,
        },
        Rule {
            id: "L1-LOG-001".into(),
            name: "Logging Service Down".into(),
            description: "Audit logging service not running".into(),
            conditions: vec![
                RuleCondition::new("check_type", MatchOperator::Equals, json!("logging")),
                RuleCondition::new("drift_detected", MatchOperator::Equals, json!(true)),
                RuleCondition::new("details.services_running", MatchOperator::Equals, json!(false)),
            ],
            action: "restart_logging_services".into(),
            action_params: json!({}),
            hipaa_controls: vec!["164.312(b)".into()],
            severity_filter: None,
            enabled: true,
            priority: 5,
            cooldown_seconds: 300,
            max_retries: 1,
            source: RuleSource::Builtin,
        },
        Rule {
            id: "L1-PATCH-001".into(),
            name: "Patching Generation Drift".into(),
            description: "System generation behind baseline, trigger update".into(),
            conditions: vec![
                RuleCondition::new("check_type", MatchOperator::Equals, json!("patching")),
                RuleCondition::new("drift_detected", MatchOperator::Equals, json!(true)),
                RuleCondition::new("details.generation_drift", MatchOperator::Equals, json!(true)),
            ],
            action: "update_to_baseline_generation".into(),
            action_params: json!({"verify_after": true}),
            hipaa_controls: vec!["164.308(a)(5)(ii)(B)".into()],
            severity_filter: None,
            enabled: true,
            priority: 10,
            cooldown_seconds: 300,
            max_retries: 1,
            source: RuleSource::Builtin,
        },
        Rule {
            id: "L1-FW-001".into(),
            name: "Firewall Configuration Drift".into(),
            description: "Firewall rules deviated from baseline".into(),
            conditions: vec![
                RuleCondition::new("check_type", MatchOperator::Equals, json!("firewall")),
                RuleCondition::new("drift_detected", MatchOperator::Equals, json!(true)),
            ],
            action: "restore_firewall_baseline".into(),
            action_params: json!({}),
            hipaa_controls: vec!["164.312(e)(1)".into()],
            severity_filter: None,
            enabled: true,
            priority: 10,
            cooldown_seconds: 300,
            max_retries: 1,
            source: RuleSource::Builtin,
        },
        Rule {
            id: "L1-SERVICE-001".into(),
            name: "Service Crash Loop".into(),
            description: "Service restarting repeatedly".into(),
            conditions: vec![
                RuleCondition::new("incident_type", MatchOperator::Equals, json!("service_crash")),
                RuleCondition::new("details.restart_count", MatchOperator::GreaterThan, json!(3)),
            ],
            action: "escalate".into(),
            action_params: json!({
                "reason": "Service in crash loop - requires investigation",
                "include_logs": true
            }),
            hipaa_controls: vec![],
            severity_filter: None,
            enabled: true,
            priority: 10,
            cooldown_seconds: 300,
            max_retries: 1,
            source: RuleSource::Builtin,
        },
        Rule {
            id: "L1-BACKUP-001".into(),
            name: "Backup Job Failure".into(),
            description: "Backup job failed or missing".into(),
            conditions: vec![
                RuleCondition::new("check_type", MatchOperator::Equals, json!("backup")),
                RuleCondition::new("drift_detected", MatchOperator::Equals, json!(true)),
                RuleCondition::new("details.last_backup_success", MatchOperator::Equals, json!(false)),
            ],
            action: "run_backup_job".into(),
            action_params: json!({"job_name": "restic-backup"}),
            hipaa_controls: vec!["164.308(a)(7)(ii)(A)".into()],
            severity_filter: None,
            enabled: true,
            priority: 15,
            cooldown_seconds: 300,
            max_retries: 1,
            source: RuleSource::Builtin,
        },
        Rule {
            id: "L1-DISK-001".into(),
            name: "Disk Space Critical".into(),
            description: "Disk usage above 90%".into(),
            conditions: vec![
                RuleCondition::new("incident_type", MatchOperator::Equals, json!("disk_space")),
                RuleCondition::new("details.usage_percent", MatchOperator::GreaterThan, json!(90)),
            ],
            action: "cleanup_disk_space".into(),
            action_params: json!({"targets": ["/var/log", "/tmp", "/var/cache"]}),
            hipaa_controls: vec![],
            severity_filter: None,
            enabled: true,
            priority: 15,
            cooldown_seconds: 300,
            max_retries: 1,
            source: RuleSource::Builtin,
        },
        Rule {
            id: "L1-BACKUP-002".into(),
            name: "Backup Age Exceeded".into(),
            description: "Last successful backup too old".into(),
            conditions: vec![
                RuleCondition::new("check_type", MatchOperator::Equals, json!("backup")),
                RuleCondition::new("drift_detected", MatchOperator::Equals, json!(true)),
                RuleCondition::new("details.age_hours", MatchOperator::GreaterThan, json!(24)),
            ],
            action: "run_backup_job".into(),
            action_params: json!({"job_name": "restic-backup", "force": true}),
            hipaa_controls: vec!["164.308(a)(7)(ii)(A)".into()],
            severity_filter: None,
            enabled: true,
            priority: 20,
            cooldown_seconds: 300,
            max_retries: 1,
            source: RuleSource::Builtin,
        },
        Rule {
            id: "L1-CERT-001".into(),
            name: "Certificate Expiring".into(),
            description: "TLS certificate expiring within 30 days".into(),
            conditions: vec![
                RuleCondition::new("incident_type", MatchOperator::Equals, json!("cert_expiry")),
                RuleCondition::new("details.days_remaining", MatchOperator::LessThan, json!(30)),
            ],
            action: "renew_certificate".into(),
            action_params: json!({}),
            hipaa_controls: vec!["164.312(e)(1)".into()],
            severity_filter: None,
            enabled: true,
            priority: 25,
            cooldown_seconds: 300,
            max_retries: 1,
            source: RuleSource::Builtin,
        },
    ];

    for rule in &mut rules {
        // Builtins are authored against the allow-list; compile cannot fail
        // for them but keep the invariant checked.
        if let Err(e) = rule.finalize() {
            error!(rule = %rule.id, error = %e, "builtin rule failed validation");
        }
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ActionOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct RecordingExecutor {
        calls: AtomicUsize,
        succeed: bool,
    }

    #[async_trait]
    impl ActionExecutor for RecordingExecutor {
        async fn execute(
            &self,
            _action: &str,
            _params: &Value,
            _site_id: &str,
            _host_id: &str,
        ) -> crate::error::Result<ActionOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ActionOutcome {
                success: self.succeed,
                error: if self.succeed { None } else { Some("failed".into()) },
                method: "local".into(),
                detail: json!({"ok": self.succeed}),
            })
        }
    }

    fn engine_with(
        dir: &tempfile::TempDir,
        succeed: bool,
    ) -> (DeterministicEngine, Arc<IncidentStore>) {
        let store = Arc::new(IncidentStore::open(&dir.path().join("incidents.db")).unwrap());
        let executor = Arc::new(RecordingExecutor {
            calls: AtomicUsize::new(0),
            succeed,
        });
        let engine = DeterministicEngine::new(&dir.path().join("rules"), store.clone(), executor);
        (engine, store)
    }

    #[test]
    fn condition_operators() {
        let data = json!({
            "check_type": "backup",
            "details": {"age_hours": 30, "message": "restic: repository locked"},
            "tags": ["prod", "dc1"]
        });

        assert!(RuleCondition::new("check_type", MatchOperator::Equals, json!("backup")).matches(&data));
        assert!(RuleCondition::new("check_type", MatchOperator::NotEquals, json!("firewall")).matches(&data));
        assert!(RuleCondition::new("details.age_hours", MatchOperator::GreaterThan, json!(24)).matches(&data));
        assert!(RuleCondition::new("details.age_hours", MatchOperator::LessThan, json!(100)).matches(&data));
        assert!(RuleCondition::new("details.message", MatchOperator::Contains, json!("locked")).matches(&data));
        assert!(!RuleCondition::new("missing.path", MatchOperator::Equals, json!(1)).matches(&data));

        let mut re = RuleCondition::new("details.message", MatchOperator::Regex, json!("repo.*locked"));
        re.compile().unwrap();
        assert!(re.matches(&data));

        // `in` operates on the condition value list
        let data2 = json!({"distro": "debian"});
        assert!(RuleCondition::new("distro", MatchOperator::In, json!(["debian", "ubuntu"])).matches(&data2));
        assert!(RuleCondition::new("distro", MatchOperator::NotIn, json!(["rhel"])).matches(&data2));
    }

    #[test]
    fn builtin_rules_all_valid_and_sorted_by_priority() {
        let rules = builtin_rules();
        assert_eq!(rules.len(), 10);
        for rule in &rules {
            assert!(is_known_action(&rule.action), "action {}", rule.action);
        }
    }

    #[test]
    fn encryption_always_escalates_first() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine_with(&dir, true);
        let m = engine
            .match_incident(
                "INC-1",
                "encryption",
                Severity::Critical,
                &json!({"check_type": "encryption", "drift_detected": true}),
            )
            .unwrap();
        assert_eq!(m.rule.id, "L1-ENCRYPT-001");
        assert_eq!(m.action, "escalate");
    }

    #[tokio::test]
    async fn execute_records_resolution_once() {
        let dir = tempdir().unwrap();
        let (engine, store) = engine_with(&dir, true);

        let incident = store
            .create_incident(
                "s",
                "h1",
                "firewall",
                Severity::High,
                json!({"check_type": "firewall", "drift_detected": true}),
            )
            .unwrap();

        let m = engine
            .match_incident(&incident.id, "firewall", Severity::High, &incident.raw_data)
            .unwrap();
        assert_eq!(m.rule.id, "L1-FW-001");

        let execution = engine.execute(&m, "s", "h1").await;
        assert!(execution.success);

        let stored = store.get_incident(&incident.id).unwrap().unwrap();
        assert_eq!(stored.resolution_level, Some(ResolutionLevel::Level1Deterministic));
        assert_eq!(stored.outcome, Some(IncidentOutcome::Success));
    }

    #[tokio::test]
    async fn cooldown_suppresses_rematch_for_same_host() {
        let dir = tempdir().unwrap();
        let (engine, store) = engine_with(&dir, true);
        let raw = json!({"check_type": "firewall", "drift_detected": true, "host_id": "h1"});

        let incident = store
            .create_incident("s", "h1", "firewall", Severity::High, raw.clone())
            .unwrap();
        let m = engine
            .match_incident(&incident.id, "firewall", Severity::High, &raw)
            .unwrap();
        engine.execute(&m, "s", "h1").await;

        // same host now in cooldown
        assert!(engine
            .match_incident("INC-2", "firewall", Severity::High, &raw)
            .is_none());

        // a different host is unaffected
        let raw_h2 = json!({"check_type": "firewall", "drift_detected": true, "host_id": "h2"});
        assert!(engine
            .match_incident("INC-3", "firewall", Severity::High, &raw_h2)
            .is_some());
    }

    #[test]
    fn loads_custom_rules_from_directory() {
        let dir = tempdir().unwrap();
        let rules_dir = dir.path().join("rules");
        std::fs::create_dir_all(&rules_dir).unwrap();
        std::fs::write(
            rules_dir.join("custom.yaml"),
            r#"
id: CUSTOM-001
name: NTP drift
conditions:
  - field: check_type
    operator: eq
    value: ntp_sync
  - field: drift_detected
    operator: eq
    value: true
action: restart_service
action_params:
  service_name: chronyd
priority: 40
"#,
        )
        .unwrap();

        let (engine, _) = engine_with(&dir, true);
        let m = engine.match_incident(
            "INC-1",
            "ntp_sync",
            Severity::Medium,
            &json!({"check_type": "ntp_sync", "drift_detected": true}),
        );
        assert_eq!(m.unwrap().rule.id, "CUSTOM-001");
    }

    #[test]
    fn rejects_rule_with_unknown_action() {
        let dir = tempdir().unwrap();
        let rules_dir = dir.path().join("rules");
        std::fs::create_dir_all(&rules_dir).unwrap();
        std::fs::write(
            rules_dir.join("bad.yaml"),
            "id: BAD-001\nname: bad\nconditions: []\naction: wipe_everything\n",
        )
        .unwrap();

        let (engine, _) = engine_with(&dir, true);
        // bad rule dropped at load; builtins still present
        assert!(engine.rules().iter().all(|r| r.id != "BAD-001"));
        assert_eq!(engine.rule_stats().by_source.get("builtin"), Some(&10));
    }

    #[test]
    fn rule_yaml_roundtrip_is_equivalent() {
        let rules = builtin_rules();
        let rule = &rules[0];
        let yaml_value = rule_to_yaml_value(rule).unwrap();
        let text = serde_yaml::to_string(&yaml_value).unwrap();
        let mut reloaded: Rule = serde_yaml::from_str(&text).unwrap();
        reloaded.finalize().unwrap();

        assert_eq!(reloaded.id, rule.id);
        assert_eq!(reloaded.action, rule.action);
        assert_eq!(reloaded.priority, rule.priority);
        assert_eq!(reloaded.conditions.len(), rule.conditions.len());
        assert_eq!(reloaded.action_params, rule.action_params);
    }

    #[test]
    fn severity_filter_restricts_applicability() {
        let mut rule = builtin_rules().remove(4); // firewall rule
        rule.severity_filter = Some(vec![Severity::Critical]);
        let data = json!({"check_type": "firewall", "drift_detected": true});
        assert!(!rule.matches(Severity::High, &data));
        assert!(rule.matches(Severity::Critical, &data));
    }
}
