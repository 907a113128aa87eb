//! End-to-end flywheel test: incidents resolved at L2 become an L1 rule,
//! the promoted rule takes over, regression rolls it back, and the engine
//! stops matching it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use compliance_appliance::escalation::{EscalationConfig, EscalationHandler};
use compliance_appliance::executor::{ActionExecutor, ActionOutcome};
use compliance_appliance::healer::{AutoHealer, AutoHealerConfig};
use compliance_appliance::incident_store::{IncidentStore, ResolutionLevel, Severity};
use compliance_appliance::learning::{PromotionConfig, SelfLearningSystem};
use compliance_appliance::planner::{
    parse_response, Level2Planner, LlmBackend, LlmConfig, LlmDecision, PlanContext,
};
use compliance_appliance::rules::DeterministicEngine;

struct ToggleExecutor {
    succeed: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl ActionExecutor for ToggleExecutor {
    async fn execute(
        &self,
        _action: &str,
        _params: &Value,
        _site_id: &str,
        _host_id: &str,
    ) -> compliance_appliance::Result<ActionOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let succeed = self.succeed.load(Ordering::SeqCst);
        Ok(ActionOutcome {
            success: succeed,
            error: if succeed { None } else { Some("remediation failed".into()) },
            method: "local".into(),
            detail: json!({"simulated": true}),
        })
    }
}

struct FixedBackend;

#[async_trait]
impl LlmBackend for FixedBackend {
    async fn is_available(&self) -> bool {
        true
    }

    async fn plan(
        &self,
        incident: &compliance_appliance::incident_store::Incident,
        _context: &PlanContext,
        _config: &LlmConfig,
    ) -> compliance_appliance::Result<LlmDecision> {
        Ok(parse_response(
            &incident.id,
            r#"{"action": "restart_av_service", "params": {"service_name": "clamav-daemon"}, "confidence": 0.92, "reasoning": "service down, restart has always worked"}"#,
        ))
    }
}

fn incident_data() -> Value {
    json!({
        "check_type": "av_edr",
        "drift_detected": true,
        "service_name": "clamav-daemon",
        // no details.service_running key, so the builtin L1 AV rule does
        // not match and the incident reaches L2
    })
}

#[tokio::test]
async fn l2_pattern_promotes_to_l1_then_rolls_back_on_regression() {
    let dir = tempfile::tempdir().unwrap();
    let rules_dir = dir.path().join("rules");
    let promoted_dir = rules_dir.join("promoted");

    let store = Arc::new(IncidentStore::open(&dir.path().join("incidents.db")).unwrap());
    let executor = Arc::new(ToggleExecutor {
        succeed: AtomicBool::new(true),
        calls: AtomicUsize::new(0),
    });

    let level1 = Arc::new(DeterministicEngine::new(&rules_dir, store.clone(), executor.clone()));
    let level2 = Arc::new(Level2Planner::with_backend(
        LlmConfig::default(),
        store.clone(),
        executor.clone(),
        Box::new(FixedBackend),
    ));
    let level3 = Arc::new(EscalationHandler::new(EscalationConfig::default(), store.clone()));

    let healer = AutoHealer::new(
        AutoHealerConfig {
            // the seed heals the same circuit repeatedly on purpose
            max_flap_count: 100,
            max_heal_attempts_per_incident: 100,
            ..Default::default()
        },
        store.clone(),
        Some(level1.clone()),
        Some(level2),
        Some(level3),
    );

    // Phase 1: six incidents resolved by L2, all successful
    let mut signature = String::new();
    for _ in 0..6 {
        let result = healer
            .heal("clinic-001", "ws12", "av_edr", Severity::High, incident_data())
            .await
            .unwrap();
        assert!(result.success, "L2 heal should succeed: {:?}", result.error);
        assert_eq!(result.resolution_level, ResolutionLevel::Level2Llm);
        let incident = store.get_incident(&result.incident_id).unwrap().unwrap();
        signature = incident.pattern_signature;
    }

    let stats = store.get_pattern_stats(&signature).unwrap().unwrap();
    assert_eq!(stats.l2_resolutions, 6);
    assert!(stats.promotion_eligible);

    // Phase 2: promotion generates a deterministic rule
    let learning = SelfLearningSystem::new(store.clone(), {
        let mut config = PromotionConfig::new(promoted_dir.clone());
        config.auto_promote = true;
        config
    });
    let candidates = learning.find_promotion_candidates().unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].recommended_action, "restart_av_service");

    let rule = learning.promote_pattern(&candidates[0], "auto").unwrap();
    assert_eq!(rule.priority, 50);
    assert!(promoted_dir.join(format!("{}.yaml", rule.id)).exists());

    level1.reload_rules();
    assert!(level1.rules().iter().any(|r| r.id == rule.id));

    // Phase 3: the promoted rule now resolves the same pattern at L1
    let calls_before = executor.calls.load(Ordering::SeqCst);
    let result = healer
        .heal("clinic-001", "ws12", "av_edr", Severity::High, incident_data())
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.resolution_level, ResolutionLevel::Level1Deterministic);
    assert_eq!(executor.calls.load(Ordering::SeqCst), calls_before + 1);

    // Phase 4: regress the fix; three L1 failures trip the rollback monitor
    executor.succeed.store(false, Ordering::SeqCst);
    for host in ["ws13", "ws14", "ws15"] {
        // distinct hosts dodge the per-host rule cooldown
        let mut data = incident_data();
        data["host_id"] = json!(host);
        let result = healer
            .heal("clinic-001", host, "av_edr", Severity::High, data)
            .await
            .unwrap();
        assert_eq!(result.resolution_level, ResolutionLevel::Level1Deterministic);
        assert!(!result.success);
    }

    let report = learning.monitor_promoted_rules().unwrap();
    assert_eq!(report["rules_degraded"], 1);
    let rollbacks = report["rollbacks_triggered"].as_array().unwrap();
    assert_eq!(rollbacks.len(), 1);
    assert!(rollbacks[0]["reason"].as_str().unwrap().contains("Failure rate"));

    assert!(!promoted_dir.join(format!("{}.yaml", rule.id)).exists());
    let rolled_back_file = promoted_dir.join("rolled_back").join(format!("{}.yaml", rule.id));
    assert!(rolled_back_file.exists());
    let content = std::fs::read_to_string(&rolled_back_file).unwrap();
    assert!(content.contains("_rollback_metadata"));

    // Phase 5: after reload the pattern no longer matches at L1
    level1.reload_rules();
    assert!(!level1.rules().iter().any(|r| r.id == rule.id));
    executor.succeed.store(true, Ordering::SeqCst);
    let result = healer
        .heal("clinic-001", "ws16", "av_edr", Severity::High, incident_data())
        .await
        .unwrap();
    assert_eq!(result.resolution_level, ResolutionLevel::Level2Llm);
}

#[tokio::test]
async fn resolution_is_recorded_exactly_once_across_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(IncidentStore::open(&dir.path().join("incidents.db")).unwrap());
    let executor = Arc::new(ToggleExecutor {
        succeed: AtomicBool::new(true),
        calls: AtomicUsize::new(0),
    });
    let level1 = Arc::new(DeterministicEngine::new(
        &dir.path().join("rules"),
        store.clone(),
        executor.clone(),
    ));
    let level3 = Arc::new(EscalationHandler::new(EscalationConfig::default(), store.clone()));
    let healer = AutoHealer::new(
        AutoHealerConfig::default(),
        store.clone(),
        Some(level1),
        None,
        Some(level3),
    );

    let result = healer
        .heal(
            "clinic-001",
            "h1",
            "firewall",
            Severity::High,
            json!({"check_type": "firewall", "drift_detected": true}),
        )
        .await
        .unwrap();

    // L1 recorded the resolution; pattern stats reflect exactly one event
    let incident = store.get_incident(&result.incident_id).unwrap().unwrap();
    let stats = store
        .get_pattern_stats(&incident.pattern_signature)
        .unwrap()
        .unwrap();
    assert_eq!(stats.total_occurrences, 1);
    assert_eq!(stats.l1_resolutions, 1);
    assert_eq!(stats.l2_resolutions + stats.l3_resolutions, 0);
}
