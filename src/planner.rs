//! Level 2: LLM context-aware planner.
//!
//! Handles incidents that no deterministic rule matched. Builds historical
//! context from the incident store, consults a local or cloud model, then
//! forces the decision through safety guardrails before anything executes:
//! action allow-list, dangerous-pattern denylist over params and reasoning,
//! low-confidence approval, and a budget/rate governor that short-circuits to
//! escalation when spend runs out.

use std::sync::Arc;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::error::{ApplianceError, Result};
use crate::executor::{ActionExecutor, ALLOWED_ACTIONS};
use crate::incident_store::{Incident, IncidentOutcome, IncidentStore, ResolutionLevel};
use crate::scrubber::PhiScrubber;

/// LLM operation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmMode {
    /// Local model endpoint only
    Local,
    /// Cloud API only
    Api,
    /// Local first, API fallback
    Hybrid,
}

impl std::str::FromStr for LlmMode {
    type Err = ApplianceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "local" => Ok(LlmMode::Local),
            "api" => Ok(LlmMode::Api),
            "hybrid" => Ok(LlmMode::Hybrid),
            other => Err(ApplianceError::Config(format!("unknown LLM mode: {}", other))),
        }
    }
}

/// Configuration for the L2 planner.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub mode: LlmMode,
    pub local_model: String,
    pub local_endpoint: String,
    pub local_timeout_secs: u64,
    pub api_provider: String,
    pub api_model: String,
    pub api_endpoint: Option<String>,
    pub api_key: Option<String>,
    pub api_timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f64,
    pub allowed_actions: Vec<String>,
    pub max_concurrent_api_calls: usize,
    pub max_api_calls_per_hour: usize,
    pub daily_budget_usd: f64,
    /// Below this local confidence, escalate rather than spend API budget
    pub hybrid_min_confidence_for_api_fallback: f64,
    /// USD per million input tokens (from configuration, never hardcoded)
    pub input_cost_per_mtok: f64,
    /// USD per million output tokens
    pub output_cost_per_mtok: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            mode: LlmMode::Hybrid,
            local_model: "llama3.1:8b".into(),
            local_endpoint: "http://localhost:11434".into(),
            local_timeout_secs: 30,
            api_provider: "anthropic".into(),
            api_model: "claude-3-5-haiku-latest".into(),
            api_endpoint: None,
            api_key: None,
            api_timeout_secs: 60,
            max_tokens: 500,
            temperature: 0.1,
            allowed_actions: ALLOWED_ACTIONS.iter().map(|s| s.to_string()).collect(),
            max_concurrent_api_calls: 3,
            max_api_calls_per_hour: 60,
            daily_budget_usd: 10.0,
            hybrid_min_confidence_for_api_fallback: 0.0,
            input_cost_per_mtok: 0.0,
            output_cost_per_mtok: 0.0,
        }
    }
}

/// Decision from the LLM planner.
#[derive(Debug, Clone)]
pub struct LlmDecision {
    pub incident_id: String,
    pub recommended_action: String,
    pub action_params: Value,
    pub confidence: f64,
    pub reasoning: String,
    pub runbook_id: Option<String>,
    pub requires_approval: bool,
    pub escalate_to_l3: bool,
    pub security_violation: bool,
    pub api_tokens: u64,
    pub api_cost_usd: f64,
    pub planning_time_ms: i64,
}

impl LlmDecision {
    fn escalation(incident_id: &str, reason: &str) -> Self {
        Self {
            incident_id: incident_id.to_string(),
            recommended_action: "escalate".to_string(),
            action_params: json!({"reason": reason}),
            confidence: 0.0,
            reasoning: reason.to_string(),
            runbook_id: None,
            requires_approval: false,
            escalate_to_l3: true,
            security_violation: false,
            api_tokens: 0,
            api_cost_usd: 0.0,
            planning_time_ms: 0,
        }
    }
}

/// Historical context handed to the model.
#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    pub historical: Value,
    pub similar_incidents: Vec<Value>,
    pub successful_actions: Vec<Value>,
    pub has_recommended_action: bool,
    pub promotion_eligible: bool,
}

const SYSTEM_PROMPT: &str = "You are a compliance-focused infrastructure automation system for healthcare environments.\n\
Your role is to select the appropriate remediation action for infrastructure incidents.\n\n\
CRITICAL RULES:\n\
1. NEVER suggest actions that could expose PHI or patient data\n\
2. ONLY select from the provided allowed_actions list\n\
3. When uncertain, set escalate=true\n\
4. Provide clear reasoning for your decision\n\
5. Actions affecting encryption or access control require escalation\n\n\
You must respond with valid JSON containing:\n\
- action: the action to take (from allowed_actions)\n\
- params: action parameters (dict)\n\
- confidence: 0.0-1.0 confidence level\n\
- reasoning: brief explanation\n\
- runbook_id: optional runbook reference\n\
- requires_approval: true if human approval needed\n\
- escalate: true if should escalate to human";

fn build_user_prompt(incident: &Incident, raw_data: &Value, context: &PlanContext, allowed: &[String]) -> String {
    format!(
        "Analyze this infrastructure incident and recommend a remediation action.\n\n\
## Incident Details\n\
- Type: {incident_type}\n\
- Severity: {severity}\n\
- Site: {site_id}\n\
- Host: {host_id}\n\n\
## Raw Data\n{raw_data}\n\n\
## Historical Context\n{historical}\n\n\
## Similar Resolved Incidents\n{similar}\n\n\
## Previously Successful Actions\n{successful}\n\n\
## Allowed Actions\n{allowed}\n\n\
Based on the above, provide your recommendation as JSON:\n\
{{\n    \"action\": \"action_name\",\n    \"params\": {{}},\n    \"confidence\": 0.0-1.0,\n    \"reasoning\": \"brief explanation\",\n    \"runbook_id\": \"optional\",\n    \"requires_approval\": false,\n    \"escalate\": false\n}}",
        incident_type = incident.incident_type,
        severity = incident.severity,
        site_id = incident.site_id,
        host_id = incident.host_id,
        raw_data = serde_json::to_string_pretty(raw_data).unwrap_or_default(),
        historical = serde_json::to_string_pretty(&context.historical).unwrap_or_default(),
        similar = serde_json::to_string_pretty(&context.similar_incidents).unwrap_or_default(),
        successful = serde_json::to_string_pretty(&context.successful_actions).unwrap_or_default(),
        allowed = serde_json::to_string_pretty(&allowed).unwrap_or_default(),
    )
}

// ---------------------------------------------------------------------------
// Dangerous-pattern denylist
// ---------------------------------------------------------------------------

/// Command substrings that are never allowed in action parameters.
const DANGEROUS_PATTERNS: &[&str] = &[
    // Destructive file operations
    "rm -rf /",
    "rm -rf /*",
    "rm -rf ~",
    "rm -rf .",
    ":(){:|:&};:",
    "mkfs",
    "dd if=/dev/zero",
    "dd if=/dev/random",
    "dd if=/dev/urandom",
    "> /dev/sda",
    "shred",
    // Dangerous permissions
    "chmod -R 777",
    "chmod 777 /",
    "chmod -R 000",
    "chown -R",
    // Network attacks
    "iptables -F",
    "iptables --flush",
    "ufw disable",
    "firewall-cmd --panic-on",
    // Credential exposure
    "/etc/shadow",
    "/etc/passwd",
    "id_rsa",
    "id_ed25519",
    ".ssh/",
    "private_key",
    "secret_key",
    "api_key",
    "password",
    // System destruction
    "init 0",
    "shutdown -h now",
    "halt",
    "poweroff",
    "reboot",
    "kill -9 1",
    "killall",
    "pkill -9",
    // Dangerous downloads/execution
    "curl | bash",
    "curl | sh",
    "wget | bash",
    "wget | sh",
    "eval $(",
    "base64 -d",
    "python -c",
    "perl -e",
    "ruby -e",
    // Database destruction
    "DROP DATABASE",
    "DROP TABLE",
    "TRUNCATE",
    "DELETE FROM",
    "--no-preserve-root",
    // Container/VM escape
    "/proc/",
    "/sys/",
    "docker run --privileged",
    "nsenter",
];

fn dangerous_regexes() -> &'static Vec<Regex> {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        [
            r"rm\s+-[rf]+\s+/(?:\s|$)",
            r">\s*/dev/[sh]d[a-z]",
            r"chmod\s+-R\s+[0-7]{3}\s+/(?:\s|$)",
            r"wget\s+.*\|\s*(?:ba)?sh",
            r"curl\s+.*\|\s*(?:ba)?sh",
            r"dd\s+.*of=/dev/[sh]d",
            r"mkfs\.[a-z0-9]+\s+/dev/",
            r"nc\s+-[el]",
            r"/dev/tcp/",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

/// Check text against the dangerous-pattern denylist. Returns the matched
/// pattern when one is found.
pub fn contains_dangerous_pattern(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    let lowered = text.to_lowercase();
    for pattern in DANGEROUS_PATTERNS {
        if lowered.contains(&pattern.to_lowercase()) {
            return Some(pattern.to_string());
        }
    }
    for regex in dangerous_regexes() {
        if regex.is_match(text) {
            return Some(regex.as_str().to_string());
        }
    }
    None
}

/// Recursively scan action params (keys and string values) for dangerous
/// patterns.
pub fn validate_action_params(params: &Value) -> Option<String> {
    match params {
        Value::String(s) => contains_dangerous_pattern(s),
        Value::Object(map) => {
            for (key, value) in map {
                if let Some(pattern) = contains_dangerous_pattern(key) {
                    return Some(pattern);
                }
                if let Some(pattern) = validate_action_params(value) {
                    return Some(pattern);
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(validate_action_params),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Extract the first complete JSON object from a model response, tolerating
/// fenced code blocks and surrounding prose. Uses a brace-balanced scan.
pub fn extract_json_object(response: &str) -> Option<String> {
    let mut text = response.trim();

    if let Some(start) = text.find("```json") {
        let after = &text[start + 7..];
        if let Some(end) = after.find("```") {
            text = after[..end].trim();
        }
    } else if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        if let Some(end) = after.find("```") {
            text = after[..end].trim();
        }
    }

    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a raw model response into a decision. Unparseable responses become
/// an escalation carrying the truncated raw text as reasoning.
pub fn parse_response(incident_id: &str, response: &str) -> LlmDecision {
    let parsed = extract_json_object(response).and_then(|s| serde_json::from_str::<Value>(&s).ok());

    let Some(data) = parsed else {
        warn!(incident_id, "failed to parse LLM response, escalating");
        return LlmDecision {
            incident_id: incident_id.to_string(),
            recommended_action: "escalate".into(),
            action_params: json!({"reason": "Could not parse LLM response"}),
            confidence: 0.0,
            reasoning: response.chars().take(500).collect(),
            runbook_id: None,
            requires_approval: false,
            escalate_to_l3: true,
            security_violation: false,
            api_tokens: 0,
            api_cost_usd: 0.0,
            planning_time_ms: 0,
        };
    };

    LlmDecision {
        incident_id: incident_id.to_string(),
        recommended_action: data
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or("escalate")
            .to_string(),
        action_params: data.get("params").cloned().unwrap_or_else(|| json!({})),
        confidence: data.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.5),
        reasoning: data
            .get("reasoning")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        runbook_id: data.get("runbook_id").and_then(|v| v.as_str()).map(String::from),
        requires_approval: data
            .get("requires_approval")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        escalate_to_l3: data.get("escalate").and_then(|v| v.as_bool()).unwrap_or(false),
        security_violation: false,
        api_tokens: 0,
        api_cost_usd: 0.0,
        planning_time_ms: 0,
    }
}

// ---------------------------------------------------------------------------
// Guardrails
// ---------------------------------------------------------------------------

/// Apply safety guardrails, in order: allow-list, dangerous patterns in
/// params, suspicious reasoning, low confidence, dangerous action set.
pub fn apply_guardrails(mut decision: LlmDecision, allowed_actions: &[String]) -> LlmDecision {
    if !allowed_actions.iter().any(|a| a == &decision.recommended_action) {
        warn!(
            action = %decision.recommended_action,
            "action not in allowed list, escalating"
        );
        decision.recommended_action = "escalate".into();
        decision.escalate_to_l3 = true;
        decision.requires_approval = true;
        if let Value::Object(map) = &mut decision.action_params {
            map.insert("reason".into(), json!("Action not in allowed list"));
        } else {
            decision.action_params = json!({"reason": "Action not in allowed list"});
        }
    }

    if let Some(pattern) = validate_action_params(&decision.action_params) {
        error!(
            incident_id = %decision.incident_id,
            pattern = %pattern,
            "BLOCKED: dangerous pattern in action params"
        );
        let original = decision.recommended_action.clone();
        decision.recommended_action = "escalate".into();
        decision.escalate_to_l3 = true;
        decision.requires_approval = true;
        decision.confidence = 0.0;
        decision.security_violation = true;
        decision.action_params = json!({
            "reason": format!("BLOCKED: Dangerous pattern detected: {}", pattern),
            "original_action": original,
            "security_violation": true,
        });
    }

    if let Some(pattern) = contains_dangerous_pattern(&decision.reasoning) {
        warn!(
            incident_id = %decision.incident_id,
            pattern = %pattern,
            "suspicious pattern in LLM reasoning, flagging for review"
        );
        decision.requires_approval = true;
    }

    if decision.confidence < 0.6 {
        decision.requires_approval = true;
    }

    const DANGEROUS_ACTIONS: [&str; 4] = ["delete", "format", "reboot", "shutdown"];
    if DANGEROUS_ACTIONS.contains(&decision.recommended_action.as_str()) {
        decision.requires_approval = true;
    }

    decision
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// A model backend the planner can consult.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn is_available(&self) -> bool;
    async fn plan(&self, incident: &Incident, context: &PlanContext, config: &LlmConfig)
        -> Result<LlmDecision>;
}

/// Local model endpoint (Ollama-style API). Data stays on the appliance, so
/// no scrubbing is applied.
pub struct LocalBackend {
    http: reqwest::Client,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmBackend for LocalBackend {
    async fn is_available(&self) -> bool {
        // is_available is configured per call site; actual reachability is
        // checked with a short timeout against the tags endpoint
        true
    }

    async fn plan(
        &self,
        incident: &Incident,
        context: &PlanContext,
        config: &LlmConfig,
    ) -> Result<LlmDecision> {
        let probe = self
            .http
            .get(format!("{}/api/tags", config.local_endpoint))
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await;
        if !matches!(probe, Ok(r) if r.status().is_success()) {
            return Ok(LlmDecision::escalation(&incident.id, "Local LLM not available"));
        }

        let prompt = format!(
            "{}\n\n{}",
            SYSTEM_PROMPT,
            build_user_prompt(incident, &incident.raw_data, context, &config.allowed_actions)
        );

        let response = self
            .http
            .post(format!("{}/api/generate", config.local_endpoint))
            .timeout(std::time::Duration::from_secs(config.local_timeout_secs))
            .json(&json!({
                "model": config.local_model,
                "prompt": prompt,
                "stream": false,
                "options": {
                    "temperature": config.temperature,
                    "num_predict": config.max_tokens,
                }
            }))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let body: Value = resp.json().await?;
                let text = body.get("response").and_then(|v| v.as_str()).unwrap_or("");
                Ok(parse_response(&incident.id, text))
            }
            Ok(resp) => Ok(LlmDecision::escalation(
                &incident.id,
                &format!("Local LLM request failed: {}", resp.status()),
            )),
            Err(e) if e.is_timeout() => {
                warn!("local LLM timeout, escalating");
                Ok(LlmDecision::escalation(&incident.id, "Local LLM timed out"))
            }
            Err(e) => Ok(LlmDecision::escalation(
                &incident.id,
                &format!("Local LLM error: {}", e),
            )),
        }
    }
}

/// Cloud API backend (OpenAI chat completions or Anthropic messages).
///
/// Every field sent off-appliance passes through the PHI scrubber first;
/// infrastructure identifiers (IPs) are preserved by configuration.
pub struct ApiBackend {
    http: reqwest::Client,
    scrubber: PhiScrubber,
}

impl ApiBackend {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            scrubber: PhiScrubber::outbound(),
        }
    }

    fn scrubbed_prompt(&self, incident: &Incident, context: &PlanContext, config: &LlmConfig) -> String {
        let (raw_data, scrub) = self.scrubber.scrub_value(&incident.raw_data);
        if scrub.phi_scrubbed {
            info!(patterns = scrub.patterns_matched, "PHI scrubbed from L2 cloud LLM input");
        }
        let mut scrubbed_context = context.clone();
        scrubbed_context.similar_incidents = context
            .similar_incidents
            .iter()
            .map(|inc| self.scrubber.scrub_value(inc).0)
            .collect();
        build_user_prompt(incident, &raw_data, &scrubbed_context, &config.allowed_actions)
    }
}

impl Default for ApiBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmBackend for ApiBackend {
    async fn is_available(&self) -> bool {
        true
    }

    async fn plan(
        &self,
        incident: &Incident,
        context: &PlanContext,
        config: &LlmConfig,
    ) -> Result<LlmDecision> {
        let Some(api_key) = config.api_key.as_deref().filter(|k| !k.is_empty()) else {
            return Ok(LlmDecision::escalation(&incident.id, "No API key configured"));
        };

        let prompt = self.scrubbed_prompt(incident, context, config);
        let timeout = std::time::Duration::from_secs(config.api_timeout_secs);

        let (response_text, input_tokens, output_tokens) = match config.api_provider.as_str() {
            "openai" => {
                let url = config
                    .api_endpoint
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string());
                let resp = self
                    .http
                    .post(&url)
                    .timeout(timeout)
                    .bearer_auth(api_key)
                    .json(&json!({
                        "model": config.api_model,
                        "messages": [
                            {"role": "system", "content": SYSTEM_PROMPT},
                            {"role": "user", "content": prompt},
                        ],
                        "max_tokens": config.max_tokens,
                        "temperature": config.temperature,
                        "response_format": {"type": "json_object"},
                    }))
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Ok(LlmDecision::escalation(
                        &incident.id,
                        &format!("API error: {}", resp.status()),
                    ));
                }
                let body: Value = resp.json().await?;
                let text = body["choices"][0]["message"]["content"]
                    .as_str()
                    .unwrap_or("")
                    .to_string();
                let input = body["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
                let output = body["usage"]["completion_tokens"].as_u64().unwrap_or(0);
                (text, input, output)
            }
            "anthropic" => {
                let url = config
                    .api_endpoint
                    .clone()
                    .unwrap_or_else(|| "https://api.anthropic.com/v1/messages".to_string());
                let resp = self
                    .http
                    .post(&url)
                    .timeout(timeout)
                    .header("x-api-key", api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&json!({
                        "model": config.api_model,
                        "max_tokens": config.max_tokens,
                        "system": SYSTEM_PROMPT,
                        "messages": [{"role": "user", "content": prompt}],
                    }))
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Ok(LlmDecision::escalation(
                        &incident.id,
                        &format!("API error: {}", resp.status()),
                    ));
                }
                let body: Value = resp.json().await?;
                let text = body["content"][0]["text"].as_str().unwrap_or("").to_string();
                let input = body["usage"]["input_tokens"].as_u64().unwrap_or(0);
                let output = body["usage"]["output_tokens"].as_u64().unwrap_or(0);
                (text, input, output)
            }
            other => {
                return Err(ApplianceError::Config(format!("unknown API provider: {}", other)));
            }
        };

        let cost = input_tokens as f64 * config.input_cost_per_mtok / 1e6
            + output_tokens as f64 * config.output_cost_per_mtok / 1e6;
        info!(
            tokens = input_tokens + output_tokens,
            cost_usd = cost,
            provider = %config.api_provider,
            "LLM API usage"
        );

        let mut decision = parse_response(&incident.id, &response_text);
        decision.api_tokens = input_tokens + output_tokens;
        decision.api_cost_usd = cost;
        Ok(decision)
    }
}

/// Local-first backend with API fallback gated on local confidence.
pub struct HybridBackend {
    local: LocalBackend,
    api: ApiBackend,
}

impl HybridBackend {
    pub fn new() -> Self {
        Self {
            local: LocalBackend::new(),
            api: ApiBackend::new(),
        }
    }
}

impl Default for HybridBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmBackend for HybridBackend {
    async fn is_available(&self) -> bool {
        true
    }

    async fn plan(
        &self,
        incident: &Incident,
        context: &PlanContext,
        config: &LlmConfig,
    ) -> Result<LlmDecision> {
        let local_decision = self.local.plan(incident, context, config).await?;

        if local_decision.confidence >= 0.7 && !local_decision.escalate_to_l3 {
            info!(confidence = local_decision.confidence, "using local LLM decision");
            return Ok(local_decision);
        }

        let min_conf = config.hybrid_min_confidence_for_api_fallback;
        if !local_decision.escalate_to_l3 && local_decision.confidence < min_conf {
            info!(
                confidence = local_decision.confidence,
                threshold = min_conf,
                "local confidence below API fallback threshold, escalating instead of spending"
            );
            return Ok(LlmDecision::escalation(
                &incident.id,
                &format!(
                    "Local confidence too low ({:.2}) for API fallback",
                    local_decision.confidence
                ),
            ));
        }

        if config.api_key.as_deref().map(|k| !k.is_empty()).unwrap_or(false) {
            info!("falling back to API LLM");
            return self.api.plan(incident, context, config).await;
        }

        Ok(LlmDecision::escalation(&incident.id, "No LLM available"))
    }
}

/// Assemble the historical context for an incident: pattern stats, recent
/// incidents for its signature, top successful actions, and similar
/// incidents scoped to the same site. Shared by L2 planning and L3 tickets.
pub fn build_plan_context(store: &IncidentStore, incident: &Incident) -> Result<PlanContext> {
    let pattern = store.get_pattern_context(&incident.pattern_signature, 5)?;
    let similar = store.get_similar_incidents(&incident.incident_type, Some(&incident.site_id), 5)?;

    Ok(PlanContext {
        historical: pattern
            .stats
            .as_ref()
            .map(|s| serde_json::to_value(s).unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        similar_incidents: similar
            .iter()
            .map(|i| serde_json::to_value(i).unwrap_or(Value::Null))
            .collect(),
        successful_actions: pattern
            .successful_actions
            .iter()
            .map(|(action, count)| json!({"resolution_action": action, "count": count}))
            .collect(),
        has_recommended_action: pattern.has_recommended_action,
        promotion_eligible: pattern.promotion_eligible,
    })
}

// ---------------------------------------------------------------------------
// Budget governor
// ---------------------------------------------------------------------------

struct BudgetState {
    daily_cost_usd: f64,
    daily_cost_date: String,
    hourly_calls: Vec<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Execution result from an L2 decision.
#[derive(Debug, Clone)]
pub struct PlannerExecution {
    pub incident_id: String,
    pub action: String,
    pub success: bool,
    pub output: Value,
    pub error: Option<String>,
    pub requires_approval: bool,
    pub escalated: bool,
    pub duration_ms: i64,
}

/// Level 2 planner with guardrails and cost controls.
pub struct Level2Planner {
    config: LlmConfig,
    store: Arc<IncidentStore>,
    executor: Arc<dyn ActionExecutor>,
    backend: Box<dyn LlmBackend>,
    budget: Mutex<BudgetState>,
    api_semaphore: Semaphore,
}

impl Level2Planner {
    pub fn new(config: LlmConfig, store: Arc<IncidentStore>, executor: Arc<dyn ActionExecutor>) -> Self {
        let backend: Box<dyn LlmBackend> = match config.mode {
            LlmMode::Local => Box::new(LocalBackend::new()),
            LlmMode::Api => Box::new(ApiBackend::new()),
            LlmMode::Hybrid => Box::new(HybridBackend::new()),
        };
        Self::with_backend(config, store, executor, backend)
    }

    pub fn with_backend(
        config: LlmConfig,
        store: Arc<IncidentStore>,
        executor: Arc<dyn ActionExecutor>,
        backend: Box<dyn LlmBackend>,
    ) -> Self {
        let permits = config.max_concurrent_api_calls.max(1);
        Self {
            config,
            store,
            executor,
            backend,
            budget: Mutex::new(BudgetState {
                daily_cost_usd: 0.0,
                daily_cost_date: Utc::now().format("%Y-%m-%d").to_string(),
                hourly_calls: Vec::new(),
            }),
            api_semaphore: Semaphore::new(permits),
        }
    }

    pub async fn is_available(&self) -> bool {
        self.backend.is_available().await
    }

    /// Build historical context for a decision: pattern stats, recent
    /// incidents for the signature, top successful actions, and similar
    /// incidents scoped to the site.
    pub fn build_context(&self, incident: &Incident) -> Result<PlanContext> {
        build_plan_context(&self.store, incident)
    }

    /// Check the daily budget and hourly rate window. Returns the rejection
    /// reason when a call must not be made.
    fn check_budget(&self) -> Option<String> {
        let now = Utc::now();
        let today = now.format("%Y-%m-%d").to_string();
        let mut budget = self.budget.lock();

        if budget.daily_cost_date != today {
            budget.daily_cost_usd = 0.0;
            budget.daily_cost_date = today;
        }

        if budget.daily_cost_usd >= self.config.daily_budget_usd {
            return Some(format!(
                "Daily API budget exhausted (${:.4} / ${:.2})",
                budget.daily_cost_usd, self.config.daily_budget_usd
            ));
        }

        let one_hour_ago = now - Duration::hours(1);
        budget.hourly_calls.retain(|t| *t > one_hour_ago);
        if budget.hourly_calls.len() >= self.config.max_api_calls_per_hour {
            return Some(format!(
                "Hourly API rate limit reached ({}/{})",
                budget.hourly_calls.len(),
                self.config.max_api_calls_per_hour
            ));
        }

        None
    }

    /// Record the cost of a completed API call.
    pub fn record_api_cost(&self, cost_usd: f64, tokens: u64) {
        let mut budget = self.budget.lock();
        budget.hourly_calls.push(Utc::now());
        budget.daily_cost_usd += cost_usd;
        info!(
            cost_usd,
            tokens,
            daily_total = budget.daily_cost_usd,
            daily_budget = self.config.daily_budget_usd,
            hourly_calls = budget.hourly_calls.len(),
            "L2 API cost recorded"
        );
    }

    /// Generate a guarded decision for an incident.
    pub async fn plan(&self, incident: &Incident) -> Result<LlmDecision> {
        let started = Utc::now();

        if let Some(rejection) = self.check_budget() {
            warn!(reason = %rejection, "L2 budget guard tripped, escalating");
            let mut decision = LlmDecision::escalation(&incident.id, &rejection);
            decision.planning_time_ms = (Utc::now() - started).num_milliseconds();
            return Ok(decision);
        }

        let context = self.build_context(incident)?;

        let decision = {
            let _permit = self
                .api_semaphore
                .acquire()
                .await
                .map_err(|e| ApplianceError::Other(anyhow::anyhow!(e)))?;
            self.backend.plan(incident, &context, &self.config).await?
        };

        if decision.api_cost_usd > 0.0 {
            self.record_api_cost(decision.api_cost_usd, decision.api_tokens);
        }

        let mut decision = apply_guardrails(decision, &self.config.allowed_actions);
        decision.planning_time_ms = (Utc::now() - started).num_milliseconds();

        info!(
            incident_id = %incident.id,
            action = %decision.recommended_action,
            confidence = decision.confidence,
            "L2 decision"
        );
        Ok(decision)
    }

    /// Execute a decision. Approval-gated and escalated decisions never reach
    /// the executor.
    pub async fn execute(&self, decision: &LlmDecision, site_id: &str, host_id: &str) -> PlannerExecution {
        let started = Utc::now();
        let mut execution = PlannerExecution {
            incident_id: decision.incident_id.clone(),
            action: decision.recommended_action.clone(),
            success: false,
            output: Value::Null,
            error: None,
            requires_approval: false,
            escalated: false,
            duration_ms: 0,
        };

        if decision.requires_approval {
            execution.error = Some("Action requires human approval".into());
            execution.requires_approval = true;
            return execution;
        }
        if decision.escalate_to_l3 {
            execution.escalated = true;
            return execution;
        }

        match self
            .executor
            .execute(&decision.recommended_action, &decision.action_params, site_id, host_id)
            .await
        {
            Ok(outcome) => {
                execution.success = outcome.success;
                execution.error = outcome.error;
                execution.output = outcome.detail;
            }
            Err(e) => {
                error!(error = %e, "L2 execution failed");
                execution.error = Some(e.to_string());
            }
        }
        execution.duration_ms = (Utc::now() - started).num_milliseconds();

        let outcome = if execution.success {
            IncidentOutcome::Success
        } else {
            IncidentOutcome::Failure
        };
        if let Err(e) = self.store.resolve_incident(
            &decision.incident_id,
            ResolutionLevel::Level2Llm,
            &decision.recommended_action,
            outcome,
            execution.duration_ms,
        ) {
            error!(error = %e, "failed to record L2 resolution");
        }

        execution
    }
}
