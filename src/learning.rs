//! Self-learning subsystem: the data flywheel.
//!
//! Turns repeated successful L2 resolutions into deterministic L1 rules,
//! watches the promoted rules' post-promotion health, and rolls them back on
//! regression. Rules land in `rules_dir/promoted/` with a promotion metadata
//! block; rolled-back rules move to `promoted/rolled_back/` disabled.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{ApplianceError, Result};
use crate::incident_store::{Incident, IncidentStore, PatternStats};
use crate::rules::{rule_to_yaml_value, MatchOperator, Rule, RuleCondition, RuleSource};

/// Configuration for the learning loop.
#[derive(Debug, Clone)]
pub struct PromotionConfig {
    pub min_occurrences: i64,
    pub min_l2_resolutions: i64,
    pub min_success_rate: f64,
    pub max_avg_resolution_time_ms: f64,
    pub check_interval_hours: u64,
    /// Deploy without human approval
    pub auto_promote: bool,
    pub promotion_output_dir: PathBuf,
    pub track_promotion_effectiveness: bool,
    /// Roll back when post-promotion failure rate exceeds this
    pub rollback_on_failure_rate: f64,
}

impl PromotionConfig {
    pub fn new(promotion_output_dir: PathBuf) -> Self {
        Self {
            min_occurrences: 5,
            min_l2_resolutions: 3,
            min_success_rate: 0.9,
            max_avg_resolution_time_ms: 30_000.0,
            check_interval_hours: 24,
            auto_promote: false,
            promotion_output_dir,
            track_promotion_effectiveness: true,
            rollback_on_failure_rate: 0.2,
        }
    }
}

/// A pattern eligible for L1 promotion.
#[derive(Debug, Clone)]
pub struct PromotionCandidate {
    pub pattern_signature: String,
    pub stats: PatternStats,
    pub sample_incidents: Vec<Incident>,
    pub recommended_action: String,
    pub action_params: Value,
    pub confidence_score: f64,
    pub promotion_reason: String,
}

/// Self-learning system for automatic rule promotion.
pub struct SelfLearningSystem {
    store: Arc<IncidentStore>,
    config: PromotionConfig,
    promoted_patterns: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl SelfLearningSystem {
    pub fn new(store: Arc<IncidentStore>, config: PromotionConfig) -> Self {
        Self {
            store,
            config,
            promoted_patterns: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PromotionConfig {
        &self.config
    }

    /// Find patterns eligible for L1 promotion, highest confidence first.
    pub fn find_promotion_candidates(&self) -> Result<Vec<PromotionCandidate>> {
        let mut candidates = Vec::new();
        let eligible = self.store.get_promotion_candidates()?;

        for stats in eligible {
            if self.promoted_patterns.lock().contains_key(&stats.pattern_signature) {
                continue;
            }
            if !self.meets_promotion_criteria(&stats) {
                continue;
            }

            let context = self.store.get_pattern_context(&stats.pattern_signature, 10)?;
            let Some((top_action, _)) = context.successful_actions.first() else {
                continue;
            };
            let action_name = top_action.clone();

            let confidence = calculate_confidence(&stats, &context.successful_actions);
            let action_params =
                extract_action_params(&context.recent_incidents, &action_name);
            let reason = format!(
                "Pattern seen {} times with {:.1}% success rate. {} L2 resolutions with consistent action. Confidence: {:.2}",
                stats.total_occurrences,
                stats.success_rate * 100.0,
                stats.l2_resolutions,
                confidence
            );

            candidates.push(PromotionCandidate {
                pattern_signature: stats.pattern_signature.clone(),
                sample_incidents: context.recent_incidents,
                recommended_action: action_name,
                action_params,
                confidence_score: confidence,
                promotion_reason: reason,
                stats,
            });
        }

        candidates.sort_by(|a, b| {
            b.confidence_score
                .partial_cmp(&a.confidence_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(candidates)
    }

    fn meets_promotion_criteria(&self, stats: &PatternStats) -> bool {
        stats.total_occurrences >= self.config.min_occurrences
            && stats.l2_resolutions >= self.config.min_l2_resolutions
            && stats.success_rate >= self.config.min_success_rate
            && stats.avg_resolution_time_ms <= self.config.max_avg_resolution_time_ms
    }

    /// Generate a deterministic rule from a promotion candidate.
    pub fn generate_rule(&self, candidate: &PromotionCandidate) -> Rule {
        let conditions = build_conditions(&candidate.sample_incidents);
        let rule_id = format!(
            "L1-PROMOTED-{}",
            candidate.pattern_signature[..8].to_uppercase()
        );

        Rule {
            id: rule_id,
            name: format!("Promoted: {}", candidate.recommended_action),
            description: format!("Auto-promoted from L2. {}", candidate.promotion_reason),
            conditions,
            action: candidate.recommended_action.clone(),
            action_params: candidate.action_params.clone(),
            hipaa_controls: crate::escalation::hipaa_controls_for(
                candidate
                    .sample_incidents
                    .first()
                    .map(|i| i.incident_type.as_str())
                    .unwrap_or(""),
            ),
            severity_filter: None,
            enabled: true,
            // Between built-in rules and user custom rules
            priority: 50,
            cooldown_seconds: 300,
            max_retries: 1,
            source: RuleSource::Promoted,
        }
    }

    /// Promote a pattern: write the rule file, register the promotion, track
    /// the signature.
    pub fn promote_pattern(&self, candidate: &PromotionCandidate, approved_by: &str) -> Result<Rule> {
        let rule = self.generate_rule(candidate);

        std::fs::create_dir_all(&self.config.promotion_output_dir)?;
        let rule_file = self.config.promotion_output_dir.join(format!("{}.yaml", rule.id));

        let mut yaml_value = rule_to_yaml_value(&rule)?;
        if let serde_yaml::Value::Mapping(map) = &mut yaml_value {
            let metadata = serde_yaml::to_value(json!({
                "promoted_at": Utc::now().to_rfc3339(),
                "promoted_by": approved_by,
                "confidence_score": candidate.confidence_score,
                "promotion_reason": candidate.promotion_reason,
                "sample_incident_count": candidate.sample_incidents.len(),
                "stats": {
                    "total_occurrences": candidate.stats.total_occurrences,
                    "success_rate": candidate.stats.success_rate,
                    "l2_resolutions": candidate.stats.l2_resolutions,
                }
            }))?;
            map.insert(
                serde_yaml::Value::String("_promotion_metadata".into()),
                metadata,
            );
        }
        let rule_yaml = serde_yaml::to_string(&yaml_value)?;
        std::fs::write(&rule_file, &rule_yaml)?;

        let incident_ids: Vec<String> =
            candidate.sample_incidents.iter().map(|i| i.id.clone()).collect();
        self.store
            .promote_pattern(&candidate.pattern_signature, &rule_yaml, &incident_ids)?;

        self.promoted_patterns
            .lock()
            .insert(candidate.pattern_signature.clone(), Utc::now());

        info!(
            pattern = %candidate.pattern_signature,
            rule = %rule.id,
            "promoted pattern to L1 rule"
        );
        Ok(rule)
    }

    /// Report promotable patterns without deploying (approval gate path).
    pub fn get_promotion_report(&self) -> Result<Value> {
        let candidates = self.find_promotion_candidates()?;
        Ok(json!({
            "generated_at": Utc::now().to_rfc3339(),
            "total_candidates": candidates.len(),
            "promotion_criteria": {
                "min_occurrences": self.config.min_occurrences,
                "min_l2_resolutions": self.config.min_l2_resolutions,
                "min_success_rate": self.config.min_success_rate,
                "max_avg_resolution_time_ms": self.config.max_avg_resolution_time_ms,
            },
            "candidates": candidates.iter().map(|c| json!({
                "pattern_signature": c.pattern_signature,
                "recommended_action": c.recommended_action,
                "confidence_score": c.confidence_score,
                "promotion_reason": c.promotion_reason,
                "stats": {
                    "total_occurrences": c.stats.total_occurrences,
                    "success_rate": c.stats.success_rate,
                    "l1_resolutions": c.stats.l1_resolutions,
                    "l2_resolutions": c.stats.l2_resolutions,
                    "l3_resolutions": c.stats.l3_resolutions,
                    "avg_resolution_time_ms": c.stats.avg_resolution_time_ms,
                }
            })).collect::<Vec<_>>(),
        }))
    }

    /// Monitor promoted rules and roll back the ones that regressed.
    ///
    /// A rule needs at least 3 post-promotion incidents before it is judged;
    /// beyond that, failure rate above the configured threshold moves it to
    /// `rolled_back/` disabled.
    pub fn monitor_promoted_rules(&self) -> Result<Value> {
        let mut report = json!({
            "monitored_at": Utc::now().to_rfc3339(),
            "rules_monitored": 0,
            "rules_healthy": 0,
            "rules_degraded": 0,
            "rollbacks_triggered": [],
            "rule_details": [],
        });

        if !self.config.promotion_output_dir.is_dir() {
            return Ok(report);
        }

        let mut monitored = 0usize;
        let mut healthy = 0usize;
        let mut degraded = 0usize;
        let mut rollbacks = Vec::new();
        let mut details = Vec::new();

        for entry in std::fs::read_dir(&self.config.promotion_output_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !matches!(ext, "yaml" | "yml") {
                continue;
            }
            monitored += 1;

            match self.monitor_rule_file(&path) {
                Ok(MonitorOutcome::Healthy(detail)) => {
                    healthy += 1;
                    details.push(detail);
                }
                Ok(MonitorOutcome::RolledBack(detail, rollback)) => {
                    degraded += 1;
                    rollbacks.push(rollback);
                    details.push(detail);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "error monitoring promoted rule");
                    details.push(json!({
                        "rule_id": path.file_stem().and_then(|s| s.to_str()).unwrap_or("unknown"),
                        "status": "error",
                        "error": e.to_string(),
                    }));
                }
            }
        }

        report["rules_monitored"] = json!(monitored);
        report["rules_healthy"] = json!(healthy);
        report["rules_degraded"] = json!(degraded);
        report["rollbacks_triggered"] = json!(rollbacks);
        report["rule_details"] = json!(details);
        Ok(report)
    }

    fn monitor_rule_file(&self, path: &Path) -> Result<MonitorOutcome> {
        let content = std::fs::read_to_string(path)?;
        let doc: serde_yaml::Value = serde_yaml::from_str(&content)?;

        let rule_id = doc
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| path.file_stem().and_then(|s| s.to_str()).unwrap_or("unknown"))
            .to_string();
        let promoted_at = doc
            .get("_promotion_metadata")
            .and_then(|m| m.get("promoted_at"))
            .and_then(|v| v.as_str())
            .map(String::from);

        let Some(promoted_at) = promoted_at else {
            // No metadata: treat as externally managed, leave it alone
            return Ok(MonitorOutcome::Healthy(json!({
                "rule_id": rule_id,
                "status": "monitoring",
            })));
        };

        let (total, successes, failures) = self.store.post_promotion_stats(&rule_id, &promoted_at)?;
        let failure_rate = if total > 0 {
            failures as f64 / total as f64
        } else {
            0.0
        };
        let success_rate = if total > 0 {
            successes as f64 / total as f64
        } else {
            1.0
        };

        let mut detail = json!({
            "rule_id": rule_id,
            "promoted_at": promoted_at,
            "post_promotion_incidents": total,
            "success_rate": success_rate,
            "failure_rate": failure_rate,
            "status": "healthy",
        });

        if total < 3 {
            detail["status"] = json!("monitoring");
            return Ok(MonitorOutcome::Healthy(detail));
        }

        if failure_rate > self.config.rollback_on_failure_rate
            && self.config.track_promotion_effectiveness
        {
            detail["status"] = json!("degraded");
            let rollback = self.rollback_rule(&rule_id, path, total, successes, failures, failure_rate)?;
            detail["rollback"] = rollback.clone();
            return Ok(MonitorOutcome::RolledBack(detail, rollback));
        }

        Ok(MonitorOutcome::Healthy(detail))
    }

    /// Disable a degraded rule and move it to the rolled-back directory.
    fn rollback_rule(
        &self,
        rule_id: &str,
        rule_file: &Path,
        total: i64,
        successes: i64,
        failures: i64,
        failure_rate: f64,
    ) -> Result<Value> {
        let reason = format!(
            "Failure rate {:.1}% exceeds threshold {:.1}%",
            failure_rate * 100.0,
            self.config.rollback_on_failure_rate * 100.0
        );
        let stats = json!({
            "total": total,
            "successes": successes,
            "failures": failures,
            "failure_rate": failure_rate,
        });

        let content = std::fs::read_to_string(rule_file)?;
        let mut doc: serde_yaml::Value = serde_yaml::from_str(&content)?;
        if let serde_yaml::Value::Mapping(map) = &mut doc {
            map.insert(
                serde_yaml::Value::String("enabled".into()),
                serde_yaml::Value::Bool(false),
            );
            map.insert(
                serde_yaml::Value::String("_rollback_metadata".into()),
                serde_yaml::to_value(json!({
                    "rolled_back_at": Utc::now().to_rfc3339(),
                    "reason": reason,
                    "stats_at_rollback": stats,
                }))?,
            );
        }

        let rollback_dir = self.config.promotion_output_dir.join("rolled_back");
        std::fs::create_dir_all(&rollback_dir)?;
        let rollback_file = rollback_dir.join(
            rule_file
                .file_name()
                .ok_or_else(|| ApplianceError::Config("rule file has no name".into()))?,
        );
        std::fs::write(&rollback_file, serde_yaml::to_string(&doc)?)?;
        std::fs::remove_file(rule_file)?;

        // Evict from the tracked-pattern set so the signature can re-qualify
        let suffix = rule_id.trim_start_matches("L1-PROMOTED-").to_lowercase();
        self.promoted_patterns
            .lock()
            .retain(|sig, _| !sig.starts_with(&suffix));

        warn!(rule_id, reason = %reason, "rolled back promoted rule");
        Ok(json!({
            "rule_id": rule_id,
            "rolled_back_at": Utc::now().to_rfc3339(),
            "reason": reason,
            "stats_at_rollback": stats,
            "rollback_file": rollback_file.display().to_string(),
            "success": true,
        }))
    }

    /// Metadata of previously rolled-back rules.
    pub fn get_rollback_history(&self) -> Result<Vec<Value>> {
        let rollback_dir = self.config.promotion_output_dir.join("rolled_back");
        if !rollback_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut history = Vec::new();
        for entry in std::fs::read_dir(&rollback_dir)? {
            let entry = entry?;
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !matches!(ext, "yaml" | "yml") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(ApplianceError::from)
                .and_then(|s| serde_yaml::from_str::<serde_yaml::Value>(&s).map_err(ApplianceError::from))
            {
                Ok(doc) => {
                    history.push(json!({
                        "rule_id": doc.get("id").and_then(|v| v.as_str()).unwrap_or("unknown"),
                        "name": doc.get("name").and_then(|v| v.as_str()).unwrap_or("Unknown"),
                        "rollback_metadata": yaml_to_json(doc.get("_rollback_metadata")),
                        "promotion_metadata": yaml_to_json(doc.get("_promotion_metadata")),
                    }));
                }
                Err(e) => warn!(file = %path.display(), error = %e, "error reading rollback history"),
            }
        }
        Ok(history)
    }

    /// Flywheel metrics: resolution breakdown plus promotion counts.
    pub fn get_learning_metrics(&self, days: u32) -> Result<Value> {
        let stats = self.store.get_stats_summary(days)?;
        let promoted_count = if self.config.promotion_output_dir.is_dir() {
            std::fs::read_dir(&self.config.promotion_output_dir)?
                .flatten()
                .filter(|e| {
                    e.path()
                        .extension()
                        .and_then(|x| x.to_str())
                        .map(|x| matches!(x, "yaml" | "yml"))
                        .unwrap_or(false)
                })
                .count()
        } else {
            0
        };

        Ok(json!({
            "period_days": days,
            "total_incidents": stats.total_incidents,
            "resolution_breakdown": {
                "l1_percentage": stats.l1_percentage,
                "l2_percentage": stats.l2_percentage,
                "l3_percentage": stats.l3_percentage,
            },
            "success_rate": stats.success_rate,
            "avg_resolution_time_ms": stats.avg_resolution_time_ms,
            "promoted_rules_count": promoted_count,
            "promotion_candidates": self.find_promotion_candidates()?.len(),
            "flywheel_status": assess_flywheel_health(stats.l1_percentage, stats.success_rate),
        }))
    }
}

enum MonitorOutcome {
    Healthy(Value),
    RolledBack(Value, Value),
}

fn yaml_to_json(value: Option<&serde_yaml::Value>) -> Value {
    value
        .and_then(|v| serde_json::to_value(v).ok())
        .unwrap_or(Value::Null)
}

/// Confidence score for a promotion candidate:
/// success rate, plus an occurrence bonus (up to 0.1), plus an action
/// consistency bonus (up to 0.1), minus a staleness penalty (up to 0.2),
/// clamped to [0, 1].
pub fn calculate_confidence(stats: &PatternStats, successful_actions: &[(String, i64)]) -> f64 {
    let base = stats.success_rate;
    let occurrence_bonus = (stats.total_occurrences as f64 / 50.0).min(0.1);

    let consistency_bonus = if let Some((_, top_count)) = successful_actions.first() {
        let total: i64 = successful_actions.iter().map(|(_, c)| c).sum();
        (*top_count as f64 / total.max(1) as f64) * 0.1
    } else {
        0.0
    };

    let recency_penalty = stats
        .last_seen
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|last| {
            let days = (Utc::now() - last.with_timezone(&Utc)).num_days() as f64;
            (days / 30.0).min(0.2)
        })
        .unwrap_or(0.0);

    (base + occurrence_bonus + consistency_bonus - recency_penalty).clamp(0.0, 1.0)
}

/// Per-action parameter keys worth carrying into a generated rule.
fn action_param_keys(action: &str) -> Vec<&'static str> {
    let specific: Vec<&'static str> = match action {
        "update_to_baseline_generation" => vec!["target_generation", "baseline_hash", "flake_url"],
        "restart_av_service" => vec!["service_name", "av_product", "expected_hash"],
        "run_backup_job" => vec!["backup_repo", "backup_paths", "restic_repo", "retention_days"],
        "restart_logging_services" => vec!["logging_services", "log_destination", "service_name"],
        "restore_firewall_baseline" => vec!["ruleset_path", "baseline_rules", "allowed_ports"],
        _ => vec![],
    };
    let mut keys = specific;
    keys.extend(["service_name", "target_path", "timeout", "host_id", "check_type", "severity"]);
    keys
}

/// Extract parameters that consistently appear across the sample incidents.
///
/// A value is included iff it shows up in at least half (rounded up) of the
/// incidents, which keeps the generated rule stable against outliers.
pub fn extract_action_params(incidents: &[Incident], action: &str) -> Value {
    if incidents.is_empty() {
        return json!({});
    }

    let keys = action_param_keys(action);
    // key -> value fingerprint -> (count, original value)
    let mut counts: HashMap<&str, HashMap<String, (usize, Value)>> = HashMap::new();

    for incident in incidents {
        for key in &keys {
            if let Some(value) = incident.raw_data.get(*key) {
                if value.is_null() {
                    continue;
                }
                let fingerprint = value.to_string();
                let entry = counts
                    .entry(*key)
                    .or_default()
                    .entry(fingerprint)
                    .or_insert((0, value.clone()));
                entry.0 += 1;
            }
        }
    }

    let min_occurrences = ((incidents.len() + 1) / 2).max(1);
    let mut params = serde_json::Map::new();

    for (key, value_counts) in counts {
        let best = value_counts.into_iter().max_by_key(|(_, (count, _))| *count);
        if let Some((_, (count, value))) = best {
            if count >= min_occurrences {
                params.insert(key.to_string(), value);
            }
        }
    }

    debug!(action, count = params.len(), "extracted promotion parameters");
    Value::Object(params)
}

/// Build rule conditions from the first sample incident: always the incident
/// type, plus check_type and drift_detected when present.
fn build_conditions(sample_incidents: &[Incident]) -> Vec<RuleCondition> {
    let mut conditions = Vec::new();
    let Some(first) = sample_incidents.first() else {
        return conditions;
    };

    conditions.push(RuleCondition::new(
        "incident_type",
        MatchOperator::Equals,
        json!(first.incident_type),
    ));

    if let Some(check_type) = first.raw_data.get("check_type") {
        if !check_type.is_null() {
            conditions.push(RuleCondition::new(
                "check_type",
                MatchOperator::Equals,
                check_type.clone(),
            ));
        }
    }
    if first
        .raw_data
        .get("drift_detected")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        conditions.push(RuleCondition::new(
            "drift_detected",
            MatchOperator::Equals,
            json!(true),
        ));
    }

    conditions
}

/// Health of the data flywheel from L1 share and success rate (percentages).
pub fn assess_flywheel_health(l1_percentage: f64, success_rate: f64) -> &'static str {
    if l1_percentage >= 70.0 && success_rate >= 95.0 {
        "excellent"
    } else if l1_percentage >= 50.0 && success_rate >= 85.0 {
        "good"
    } else if l1_percentage >= 30.0 && success_rate >= 70.0 {
        "developing"
    } else {
        "needs_attention"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident_store::{IncidentOutcome, ResolutionLevel, Severity};
    use tempfile::tempdir;

    fn seeded_store(dir: &tempfile::TempDir) -> (Arc<IncidentStore>, String) {
        let store = Arc::new(IncidentStore::open(&dir.path().join("incidents.db")).unwrap());
        let data = json!({
            "check_type": "av_edr",
            "drift_detected": true,
            "service_name": "clamav-daemon",
        });
        let mut sig = String::new();
        for _ in 0..6 {
            let inc = store
                .create_incident("site-1", "h1", "av_edr", Severity::High, data.clone())
                .unwrap();
            store
                .resolve_incident(
                    &inc.id,
                    ResolutionLevel::Level2Llm,
                    "restart_av_service",
                    IncidentOutcome::Success,
                    4_000,
                )
                .unwrap();
            sig = inc.pattern_signature;
        }
        (store, sig)
    }

    fn learning_system(
        dir: &tempfile::TempDir,
        store: Arc<IncidentStore>,
    ) -> SelfLearningSystem {
        SelfLearningSystem::new(
            store,
            PromotionConfig::new(dir.path().join("rules/promoted")),
        )
    }

    #[test]
    fn finds_candidate_with_confidence_and_params() {
        // S4: 6 successful L2 resolutions at 100% success, avg 4 s
        let dir = tempdir().unwrap();
        let (store, sig) = seeded_store(&dir);
        let learning = learning_system(&dir, store);

        let candidates = learning.find_promotion_candidates().unwrap();
        assert_eq!(candidates.len(), 1);
        let candidate = &candidates[0];
        assert_eq!(candidate.pattern_signature, sig);
        assert_eq!(candidate.recommended_action, "restart_av_service");
        assert!(candidate.confidence_score > 0.9);
        // majority-rule parameter extraction picked up the consistent service
        assert_eq!(candidate.action_params["service_name"], "clamav-daemon");
        assert_eq!(candidate.action_params["check_type"], "av_edr");
    }

    #[test]
    fn promotion_writes_rule_file_with_metadata() {
        let dir = tempdir().unwrap();
        let (store, sig) = seeded_store(&dir);
        let learning = learning_system(&dir, store.clone());

        let candidates = learning.find_promotion_candidates().unwrap();
        let rule = learning.promote_pattern(&candidates[0], "auto").unwrap();

        assert_eq!(rule.priority, 50);
        assert_eq!(rule.source, RuleSource::Promoted);
        assert!(rule.conditions.iter().any(|c| c.field == "incident_type"));
        assert!(rule.conditions.iter().any(|c| c.field == "drift_detected"));

        let rule_file = dir
            .path()
            .join("rules/promoted")
            .join(format!("{}.yaml", rule.id));
        let content = std::fs::read_to_string(&rule_file).unwrap();
        assert!(content.contains("_promotion_metadata"));
        assert!(content.contains("promoted_by: auto"));

        // eligibility cleared and incidents stamped
        let stats = store.get_pattern_stats(&sig).unwrap().unwrap();
        assert!(!stats.promotion_eligible);
        // repeated candidate search no longer returns it
        assert!(learning.find_promotion_candidates().unwrap().is_empty());
    }

    #[test]
    fn monitor_rolls_back_failing_rule() {
        // S4 continuation: 3 post-promotion L1 failures move the rule to
        // rolled_back/ with rollback metadata
        let dir = tempdir().unwrap();
        let (store, _sig) = seeded_store(&dir);
        let learning = learning_system(&dir, store.clone());

        let candidates = learning.find_promotion_candidates().unwrap();
        let rule = learning.promote_pattern(&candidates[0], "auto").unwrap();

        let data = json!({"check_type": "av_edr", "drift_detected": true});
        for _ in 0..3 {
            let inc = store
                .create_incident("site-1", "h1", "av_edr", Severity::High, data.clone())
                .unwrap();
            store
                .resolve_incident(
                    &inc.id,
                    ResolutionLevel::Level1Deterministic,
                    &rule.id,
                    IncidentOutcome::Failure,
                    500,
                )
                .unwrap();
        }

        let report = learning.monitor_promoted_rules().unwrap();
        assert_eq!(report["rules_monitored"], 1);
        assert_eq!(report["rules_degraded"], 1);
        assert_eq!(report["rollbacks_triggered"].as_array().unwrap().len(), 1);

        let active = dir
            .path()
            .join("rules/promoted")
            .join(format!("{}.yaml", rule.id));
        assert!(!active.exists());

        let rolled_back = dir
            .path()
            .join("rules/promoted/rolled_back")
            .join(format!("{}.yaml", rule.id));
        let content = std::fs::read_to_string(&rolled_back).unwrap();
        assert!(content.contains("_rollback_metadata"));
        assert!(content.contains("enabled: false"));

        let history = learning.get_rollback_history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["rule_id"], rule.id);
    }

    #[test]
    fn healthy_rule_survives_monitoring() {
        let dir = tempdir().unwrap();
        let (store, _sig) = seeded_store(&dir);
        let learning = learning_system(&dir, store.clone());
        let candidates = learning.find_promotion_candidates().unwrap();
        let rule = learning.promote_pattern(&candidates[0], "operator").unwrap();

        let data = json!({"check_type": "av_edr", "drift_detected": true});
        for _ in 0..4 {
            let inc = store
                .create_incident("site-1", "h1", "av_edr", Severity::High, data.clone())
                .unwrap();
            store
                .resolve_incident(
                    &inc.id,
                    ResolutionLevel::Level1Deterministic,
                    &rule.id,
                    IncidentOutcome::Success,
                    500,
                )
                .unwrap();
        }

        let report = learning.monitor_promoted_rules().unwrap();
        assert_eq!(report["rules_healthy"], 1);
        assert_eq!(report["rules_degraded"], 0);
        assert!(dir
            .path()
            .join("rules/promoted")
            .join(format!("{}.yaml", rule.id))
            .exists());
    }

    #[test]
    fn confidence_formula_components() {
        let stats = PatternStats {
            pattern_signature: "abcd".into(),
            total_occurrences: 50,
            l1_resolutions: 0,
            l2_resolutions: 10,
            l3_resolutions: 0,
            success_count: 50,
            success_rate: 1.0,
            avg_resolution_time_ms: 1000.0,
            total_resolution_time_ms: 50_000,
            last_seen: Some(Utc::now().to_rfc3339()),
            recommended_action: Some("restart_service".into()),
            promotion_eligible: true,
        };
        let actions = vec![("restart_service".to_string(), 50i64)];
        // 1.0 + 0.1 + 0.1 - ~0 clamps to 1.0
        assert_eq!(calculate_confidence(&stats, &actions), 1.0);

        let mut stale = stats.clone();
        stale.last_seen = Some((Utc::now() - chrono::Duration::days(60)).to_rfc3339());
        stale.success_rate = 0.9;
        let confidence = calculate_confidence(&stale, &actions);
        // 0.9 + 0.1 + 0.1 - 0.2 = 0.9
        assert!((confidence - 0.9).abs() < 0.01);
    }

    #[test]
    fn flywheel_health_bands() {
        assert_eq!(assess_flywheel_health(75.0, 96.0), "excellent");
        assert_eq!(assess_flywheel_health(55.0, 90.0), "good");
        assert_eq!(assess_flywheel_health(35.0, 75.0), "developing");
        assert_eq!(assess_flywheel_health(10.0, 50.0), "needs_attention");
    }

    #[test]
    fn majority_rule_drops_inconsistent_params() {
        let dir = tempdir().unwrap();
        let store = Arc::new(IncidentStore::open(&dir.path().join("i.db")).unwrap());
        let mut incidents = Vec::new();
        for i in 0..4 {
            let data = json!({
                "service_name": "clamav-daemon",
                "target_path": format!("/tmp/{}", i),
            });
            incidents.push(
                store
                    .create_incident("s", "h", "av_edr", Severity::High, data)
                    .unwrap(),
            );
        }
        let params = extract_action_params(&incidents, "restart_av_service");
        assert_eq!(params["service_name"], "clamav-daemon");
        // target_path varies per incident and is dropped
        assert!(params.get("target_path").is_none());
    }
}
