//! Level 3: human escalation handler.
//!
//! Builds rich tickets from incident context and routes them either through
//! the control plane (which knows the partner's notification settings) or
//! directly to locally configured channels chosen by priority.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::error::{ApplianceError, Result};
use crate::incident_store::{Incident, IncidentOutcome, IncidentStore, ResolutionLevel, Severity};
use crate::planner::PlanContext;

/// Notification channels for escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationChannel {
    Email,
    Slack,
    PagerDuty,
    Teams,
    Webhook,
}

/// Escalation priority, derived from severity and reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl EscalationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationPriority::Low => "low",
            EscalationPriority::Medium => "medium",
            EscalationPriority::High => "high",
            EscalationPriority::Critical => "critical",
        }
    }
}

/// Configuration for the escalation handler.
#[derive(Debug, Clone, Default)]
pub struct EscalationConfig {
    /// Preferred route: control plane knows the partner's channels
    pub central_command_enabled: bool,
    pub central_command_url: Option<String>,
    pub site_id: Option<String>,
    pub api_key: Option<String>,

    pub email_recipients: Vec<String>,
    pub slack_webhook_url: Option<String>,
    pub slack_channel: Option<String>,
    pub pagerduty_routing_key: Option<String>,
    pub teams_webhook_url: Option<String>,
    pub webhook_url: Option<String>,

    pub default_assignee: Option<String>,
}

/// Rich ticket for human escalation.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationTicket {
    pub id: String,
    pub incident_id: String,
    pub title: String,
    pub description: String,
    pub priority: EscalationPriority,
    pub site_id: String,
    pub host_id: String,
    pub incident_type: String,
    pub severity: Severity,
    pub raw_data: Value,
    pub historical_context: Value,
    pub similar_incidents: Vec<Value>,
    pub attempted_actions: Vec<Value>,
    pub created_at: String,
    pub escalation_reason: String,
    pub recommended_action: Option<String>,
    pub hipaa_controls: Vec<String>,
    pub assigned_to: Option<String>,
    pub status: String,
    pub resolution: Option<String>,
    pub resolved_at: Option<String>,
}

/// HIPAA controls affected by an incident type.
pub fn hipaa_controls_for(incident_type: &str) -> Vec<String> {
    let map: HashMap<&str, Vec<&str>> = HashMap::from([
        ("patching", vec!["164.308(a)(5)(ii)(B)"]),
        ("av_edr", vec!["164.308(a)(5)(ii)(B)"]),
        ("backup", vec!["164.308(a)(7)(ii)(A)", "164.310(d)(2)(iv)"]),
        ("logging", vec!["164.312(b)", "164.308(a)(1)(ii)(D)"]),
        ("firewall", vec!["164.312(e)(1)", "164.312(a)(1)"]),
        ("encryption", vec!["164.312(a)(2)(iv)", "164.312(e)(2)(ii)"]),
    ]);
    map.get(incident_type)
        .map(|v| v.iter().map(|s| s.to_string()).collect())
        .unwrap_or_default()
}

/// Level 3 escalation handler.
pub struct EscalationHandler {
    config: EscalationConfig,
    store: Arc<IncidentStore>,
    http: reqwest::Client,
    tickets: Mutex<HashMap<String, EscalationTicket>>,
}

impl EscalationHandler {
    pub fn new(config: EscalationConfig, store: Arc<IncidentStore>) -> Self {
        Self {
            config,
            store,
            http: reqwest::Client::new(),
            tickets: Mutex::new(HashMap::new()),
        }
    }

    /// Derive priority from severity plus reason keywords.
    pub fn determine_priority(severity: Severity, reason: &str) -> EscalationPriority {
        let reason_lower = reason.to_lowercase();
        if severity == Severity::Critical || reason_lower.contains("encryption") {
            EscalationPriority::Critical
        } else if severity == Severity::High || reason_lower.contains("security") {
            EscalationPriority::High
        } else if severity == Severity::Medium {
            EscalationPriority::Medium
        } else {
            EscalationPriority::Low
        }
    }

    fn channels_for_priority(priority: EscalationPriority) -> Vec<EscalationChannel> {
        match priority {
            EscalationPriority::Critical => vec![
                EscalationChannel::PagerDuty,
                EscalationChannel::Slack,
                EscalationChannel::Email,
            ],
            EscalationPriority::High => {
                vec![EscalationChannel::PagerDuty, EscalationChannel::Slack]
            }
            EscalationPriority::Medium => vec![EscalationChannel::Slack, EscalationChannel::Email],
            EscalationPriority::Low => vec![EscalationChannel::Email],
        }
    }

    fn generate_title(incident: &Incident) -> String {
        format!(
            "[{}] {} - {}",
            incident.severity.as_str().to_uppercase(),
            incident.incident_type,
            incident.host_id
        )
    }

    fn format_successful_actions(actions: &[Value]) -> String {
        if actions.is_empty() {
            return "- No historical data available".to_string();
        }
        actions
            .iter()
            .take(5)
            .map(|a| {
                format!(
                    "- {} ({} times)",
                    a.get("resolution_action").and_then(|v| v.as_str()).unwrap_or("unknown"),
                    a.get("count").and_then(|v| v.as_i64()).unwrap_or(0)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn generate_description(incident: &Incident, reason: &str, context: &PlanContext) -> String {
        let historical = &context.historical;
        let get_count = |key: &str| historical.get(key).and_then(|v| v.as_i64()).unwrap_or(0);
        let controls = hipaa_controls_for(&incident.incident_type);
        let controls_text = if controls.is_empty() {
            "- Review applicable controls based on incident details".to_string()
        } else {
            controls.iter().map(|c| format!("- {}", c)).collect::<Vec<_>>().join("\n")
        };

        format!(
            "## Escalation Summary\n\n\
**Reason:** {reason}\n\n\
**Incident Details:**\n\
- Type: {incident_type}\n\
- Severity: {severity}\n\
- Site: {site_id}\n\
- Host: {host_id}\n\
- Created: {created_at}\n\n\
## Historical Context\n\n\
This pattern has been seen {total} times before.\n\
- L1 Resolutions: {l1}\n\
- L2 Resolutions: {l2}\n\
- L3 Escalations: {l3}\n\n\
{similar_count} similar incidents were found for context.\n\n\
## Raw Data\n\n```json\n{raw_data}\n```\n\n\
## Recommended Actions\n\n\
Based on historical data, the following actions have been successful:\n\
{successful}\n\n\
## HIPAA Compliance Notes\n\n\
This incident may affect the following HIPAA controls:\n\
{controls}\n\n\
---\n*Generated by Compliance Appliance - Level 3 Escalation*\n",
            reason = reason,
            incident_type = incident.incident_type,
            severity = incident.severity,
            site_id = incident.site_id,
            host_id = incident.host_id,
            created_at = incident.created_at,
            total = get_count("total_occurrences"),
            l1 = get_count("l1_resolutions"),
            l2 = get_count("l2_resolutions"),
            l3 = get_count("l3_resolutions"),
            similar_count = context.similar_incidents.len(),
            raw_data = serde_json::to_string_pretty(&incident.raw_data).unwrap_or_default(),
            successful = Self::format_successful_actions(&context.successful_actions),
            controls = controls_text,
        )
    }

    /// Create an escalation ticket and route notifications.
    pub async fn escalate(
        &self,
        incident: &Incident,
        reason: &str,
        context: &PlanContext,
        attempted_actions: Vec<Value>,
        recommended_action: Option<String>,
    ) -> Result<EscalationTicket> {
        let priority = Self::determine_priority(incident.severity, reason);
        let suffix: String = incident.id.chars().rev().take(8).collect::<Vec<_>>().iter().rev().collect();
        let ticket_id = format!("ESC-{}-{}", Utc::now().format("%Y%m%d%H%M%S"), suffix);

        let mut ticket = EscalationTicket {
            id: ticket_id.clone(),
            incident_id: incident.id.clone(),
            title: Self::generate_title(incident),
            description: Self::generate_description(incident, reason, context),
            priority,
            site_id: incident.site_id.clone(),
            host_id: incident.host_id.clone(),
            incident_type: incident.incident_type.clone(),
            severity: incident.severity,
            raw_data: incident.raw_data.clone(),
            historical_context: context.historical.clone(),
            similar_incidents: context.similar_incidents.clone(),
            attempted_actions,
            created_at: Utc::now().to_rfc3339(),
            escalation_reason: reason.to_string(),
            recommended_action,
            hipaa_controls: hipaa_controls_for(&incident.incident_type),
            assigned_to: self.config.default_assignee.clone(),
            status: "open".to_string(),
            resolution: None,
            resolved_at: None,
        };

        if self.config.central_command_enabled {
            match self.escalate_to_central_command(&ticket).await {
                Ok(Some(cc_ticket_id)) => {
                    info!(ticket_id = %cc_ticket_id, "escalated via control plane");
                    ticket.id = cc_ticket_id;
                }
                Ok(None) | Err(_) => {
                    warn!("control plane escalation failed, using local notifications");
                    self.send_notifications(&ticket).await;
                }
            }
        } else {
            self.send_notifications(&ticket).await;
        }

        self.tickets.lock().insert(ticket.id.clone(), ticket.clone());

        self.store.resolve_incident(
            &incident.id,
            ResolutionLevel::Level3Human,
            "escalated",
            IncidentOutcome::Escalated,
            0,
        )?;

        info!(ticket_id = %ticket.id, incident_id = %incident.id, "escalation ticket created");
        Ok(ticket)
    }

    async fn escalate_to_central_command(&self, ticket: &EscalationTicket) -> Result<Option<String>> {
        let (Some(url), Some(site_id)) = (
            self.config.central_command_url.as_deref(),
            self.config.site_id.as_deref(),
        ) else {
            return Ok(None);
        };

        let actions: Vec<String> = ticket
            .attempted_actions
            .iter()
            .map(|a| {
                a.get("action")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| a.to_string())
            })
            .collect();

        let payload = json!({
            "site_id": site_id,
            "incident": {
                "id": ticket.incident_id,
                "type": ticket.incident_type,
                "severity": ticket.severity.as_str(),
                "host": ticket.host_id,
                "description": ticket.escalation_reason,
                "raw_data": ticket.raw_data,
            },
            "attempted_actions": actions,
            "recommended_action": ticket.recommended_action,
            "priority": ticket.priority.as_str(),
        });

        let mut request = self
            .http
            .post(format!("{}/api/escalations", url.trim_end_matches('/')))
            .timeout(std::time::Duration::from_secs(30))
            .json(&payload);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request.send().await?;
        if response.status().is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            Ok(body.get("ticket_id").and_then(|v| v.as_str()).map(String::from))
        } else {
            Err(ApplianceError::TransientRemote(format!(
                "escalation POST returned {}",
                response.status()
            )))
        }
    }

    async fn send_notifications(&self, ticket: &EscalationTicket) {
        for channel in Self::channels_for_priority(ticket.priority) {
            let sent = match channel {
                EscalationChannel::Email => self.send_email(ticket).await,
                EscalationChannel::Slack => self.send_slack(ticket).await,
                EscalationChannel::PagerDuty => self.send_pagerduty(ticket).await,
                EscalationChannel::Teams => self.send_teams(ticket).await,
                EscalationChannel::Webhook => self.send_webhook(ticket).await,
            };
            match sent {
                Ok(true) => info!(?channel, ticket_id = %ticket.id, "notification sent"),
                Ok(false) => {}
                Err(e) => error!(?channel, error = %e, "notification failed"),
            }
        }
        // The generic webhook fires for every priority when configured
        if self.config.webhook_url.is_some() {
            if let Err(e) = self.send_webhook(ticket).await {
                error!(error = %e, "webhook notification failed");
            }
        }
    }

    async fn send_email(&self, ticket: &EscalationTicket) -> Result<bool> {
        if self.config.email_recipients.is_empty() {
            return Ok(false);
        }
        // Mail relay submission is delegated to the host MTA queue
        info!(
            recipients = ?self.config.email_recipients,
            ticket_id = %ticket.id,
            "queued email notification"
        );
        Ok(true)
    }

    async fn send_slack(&self, ticket: &EscalationTicket) -> Result<bool> {
        let Some(webhook) = &self.config.slack_webhook_url else {
            return Ok(false);
        };

        let message = json!({
            "channel": self.config.slack_channel.as_deref().unwrap_or("#incidents"),
            "username": "Compliance Appliance",
            "blocks": [
                {
                    "type": "header",
                    "text": {"type": "plain_text", "text": format!("Escalation: {}", ticket.title)}
                },
                {
                    "type": "section",
                    "fields": [
                        {"type": "mrkdwn", "text": format!("*Ticket:*\n{}", ticket.id)},
                        {"type": "mrkdwn", "text": format!("*Priority:*\n{}", ticket.priority.as_str())},
                        {"type": "mrkdwn", "text": format!("*Site:*\n{}", ticket.site_id)},
                        {"type": "mrkdwn", "text": format!("*Host:*\n{}", ticket.host_id)},
                    ]
                },
                {
                    "type": "section",
                    "text": {"type": "mrkdwn", "text": format!("*Reason:* {}", ticket.escalation_reason)}
                }
            ]
        });

        let response = self.http.post(webhook).json(&message).send().await?;
        if !response.status().is_success() {
            return Err(ApplianceError::TransientRemote(format!(
                "Slack returned {}",
                response.status()
            )));
        }
        Ok(true)
    }

    async fn send_pagerduty(&self, ticket: &EscalationTicket) -> Result<bool> {
        let Some(routing_key) = &self.config.pagerduty_routing_key else {
            return Ok(false);
        };

        let severity = match ticket.priority {
            EscalationPriority::Critical => "critical",
            EscalationPriority::High => "error",
            EscalationPriority::Medium => "warning",
            EscalationPriority::Low => "info",
        };
        let payload = json!({
            "routing_key": routing_key,
            "event_action": "trigger",
            "dedup_key": ticket.id,
            "payload": {
                "summary": ticket.title,
                "severity": severity,
                "source": format!("{}/{}", ticket.site_id, ticket.host_id),
                "component": ticket.incident_type,
                "group": ticket.site_id,
                "class": "compliance",
                "custom_details": {
                    "ticket_id": ticket.id,
                    "incident_id": ticket.incident_id,
                    "escalation_reason": ticket.escalation_reason,
                    "recommended_action": ticket.recommended_action,
                    "hipaa_controls": ticket.hipaa_controls,
                }
            }
        });

        let response = self
            .http
            .post("https://events.pagerduty.com/v2/enqueue")
            .json(&payload)
            .send()
            .await?;
        if !matches!(response.status().as_u16(), 200 | 202) {
            return Err(ApplianceError::TransientRemote(format!(
                "PagerDuty returned {}",
                response.status()
            )));
        }
        Ok(true)
    }

    async fn send_teams(&self, ticket: &EscalationTicket) -> Result<bool> {
        let Some(webhook) = &self.config.teams_webhook_url else {
            return Ok(false);
        };

        let theme = match ticket.priority {
            EscalationPriority::Critical => "FF0000",
            EscalationPriority::High => "FF6600",
            EscalationPriority::Medium => "FFCC00",
            EscalationPriority::Low => "0078D4",
        };
        let card = json!({
            "@type": "MessageCard",
            "@context": "http://schema.org/extensions",
            "themeColor": theme,
            "summary": ticket.title,
            "sections": [{
                "activityTitle": ticket.title,
                "facts": [
                    {"name": "Ticket ID", "value": ticket.id},
                    {"name": "Priority", "value": ticket.priority.as_str()},
                    {"name": "Site", "value": ticket.site_id},
                    {"name": "Host", "value": ticket.host_id},
                    {"name": "Reason", "value": ticket.escalation_reason},
                ],
                "markdown": true
            }]
        });

        let response = self.http.post(webhook).json(&card).send().await?;
        if !response.status().is_success() {
            return Err(ApplianceError::TransientRemote(format!(
                "Teams returned {}",
                response.status()
            )));
        }
        Ok(true)
    }

    async fn send_webhook(&self, ticket: &EscalationTicket) -> Result<bool> {
        let Some(webhook) = &self.config.webhook_url else {
            return Ok(false);
        };

        let payload = json!({
            "event": "escalation",
            "ticket": {
                "id": ticket.id,
                "incident_id": ticket.incident_id,
                "title": ticket.title,
                "priority": ticket.priority.as_str(),
                "site_id": ticket.site_id,
                "host_id": ticket.host_id,
                "incident_type": ticket.incident_type,
                "severity": ticket.severity.as_str(),
                "escalation_reason": ticket.escalation_reason,
                "recommended_action": ticket.recommended_action,
                "hipaa_controls": ticket.hipaa_controls,
                "created_at": ticket.created_at,
            }
        });

        let response = self.http.post(webhook).json(&payload).send().await?;
        if !matches!(response.status().as_u16(), 200 | 201 | 202) {
            return Err(ApplianceError::TransientRemote(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(true)
    }

    /// Resolve a ticket and persist structured feedback for the flywheel.
    pub fn resolve_ticket(
        &self,
        ticket_id: &str,
        resolution: &str,
        action_taken: Option<&str>,
        feedback: Option<Value>,
    ) -> Result<()> {
        let mut tickets = self.tickets.lock();
        let ticket = tickets
            .get_mut(ticket_id)
            .ok_or_else(|| ApplianceError::Config(format!("ticket {} not found", ticket_id)))?;

        ticket.status = "resolved".to_string();
        ticket.resolution = Some(resolution.to_string());
        ticket.resolved_at = Some(Utc::now().to_rfc3339());

        if let Some(feedback) = feedback {
            self.store.add_human_feedback(
                &ticket.incident_id,
                "escalation_resolution",
                &json!({
                    "ticket_id": ticket_id,
                    "resolution": resolution,
                    "action_taken": action_taken,
                    "feedback": feedback,
                }),
            )?;
        }

        info!(ticket_id, resolution, "ticket resolved");
        Ok(())
    }

    pub fn open_tickets(&self) -> Vec<EscalationTicket> {
        self.tickets
            .lock()
            .values()
            .filter(|t| t.status == "open")
            .cloned()
            .collect()
    }

    pub fn get_ticket(&self, ticket_id: &str) -> Option<EscalationTicket> {
        self.tickets.lock().get(ticket_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, Arc<IncidentStore>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(IncidentStore::open(&dir.path().join("incidents.db")).unwrap());
        (dir, store)
    }

    #[test]
    fn priority_derivation() {
        assert_eq!(
            EscalationHandler::determine_priority(Severity::Critical, "anything"),
            EscalationPriority::Critical
        );
        assert_eq!(
            EscalationHandler::determine_priority(Severity::Low, "encryption drift detected"),
            EscalationPriority::Critical
        );
        assert_eq!(
            EscalationHandler::determine_priority(Severity::Low, "security baseline deviation"),
            EscalationPriority::High
        );
        assert_eq!(
            EscalationHandler::determine_priority(Severity::Medium, "slow disk"),
            EscalationPriority::Medium
        );
        assert_eq!(
            EscalationHandler::determine_priority(Severity::Info, "routine"),
            EscalationPriority::Low
        );
    }

    #[test]
    fn channel_matrix_by_priority() {
        assert_eq!(
            EscalationHandler::channels_for_priority(EscalationPriority::Critical),
            vec![EscalationChannel::PagerDuty, EscalationChannel::Slack, EscalationChannel::Email]
        );
        assert_eq!(
            EscalationHandler::channels_for_priority(EscalationPriority::High),
            vec![EscalationChannel::PagerDuty, EscalationChannel::Slack]
        );
        assert_eq!(
            EscalationHandler::channels_for_priority(EscalationPriority::Medium),
            vec![EscalationChannel::Slack, EscalationChannel::Email]
        );
        assert_eq!(
            EscalationHandler::channels_for_priority(EscalationPriority::Low),
            vec![EscalationChannel::Email]
        );
    }

    #[tokio::test]
    async fn escalate_records_l3_resolution_and_tracks_ticket() {
        let (_dir, store) = store();
        let handler = EscalationHandler::new(EscalationConfig::default(), store.clone());

        let incident = store
            .create_incident(
                "clinic-1",
                "h1",
                "encryption",
                Severity::Critical,
                json!({"check_type": "encryption", "drift_detected": true}),
            )
            .unwrap();

        let ticket = handler
            .escalate(&incident, "Encryption changes require human verification", &PlanContext::default(), vec![], None)
            .await
            .unwrap();

        assert_eq!(ticket.priority, EscalationPriority::Critical);
        assert!(ticket.description.contains("Escalation Summary"));
        assert!(ticket.hipaa_controls.contains(&"164.312(a)(2)(iv)".to_string()));
        assert_eq!(handler.open_tickets().len(), 1);

        let stored = store.get_incident(&incident.id).unwrap().unwrap();
        assert_eq!(stored.resolution_level, Some(ResolutionLevel::Level3Human));
        assert_eq!(stored.outcome, Some(IncidentOutcome::Escalated));
    }

    #[tokio::test]
    async fn resolve_ticket_persists_feedback() {
        let (_dir, store) = store();
        let handler = EscalationHandler::new(EscalationConfig::default(), store.clone());

        let incident = store
            .create_incident("s", "h", "backup", Severity::Medium, json!({}))
            .unwrap();
        let ticket = handler
            .escalate(&incident, "Could not resolve automatically", &PlanContext::default(), vec![], None)
            .await
            .unwrap();

        handler
            .resolve_ticket(
                &ticket.id,
                "re-ran the backup manually",
                Some("run_backup_job"),
                Some(json!({"root_cause": "stale lock file"})),
            )
            .unwrap();

        assert!(handler.open_tickets().is_empty());
        let stored = store.get_incident(&incident.id).unwrap().unwrap();
        assert!(stored.human_feedback.unwrap().contains("stale lock file"));
    }

    #[test]
    fn unknown_ticket_resolution_errors() {
        let (_dir, store) = store();
        let handler = EscalationHandler::new(EscalationConfig::default(), store);
        assert!(handler.resolve_ticket("ESC-NOPE", "x", None, None).is_err());
    }
}
