//! Sensor ingress and workstation agent registry.
//!
//! Windows sensors push drift events to `/api/sensor/*`, Linux sensors to
//! `/sensor/*`. Workstation agents register here and poll heal commands on
//! heartbeat, which gives the executor a fast path that avoids opening a
//! remote shell session.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::healer::AutoHealer;
use crate::incident_store::Severity;

/// A typed heal command queued for delivery to a workstation agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealCommand {
    pub command_id: String,
    pub check_type: String,
    pub action: String,
    pub params: Value,
    pub timeout_seconds: u64,
}

/// A registered workstation agent.
#[derive(Debug, Clone)]
pub struct AgentEntry {
    pub agent_id: String,
    pub hostname: String,
    pub capabilities: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub queued_commands: Vec<HealCommand>,
}

/// Concurrent read-heavy registry of connected workstation agents.
#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<String, AgentEntry>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runbooks the agent channel can execute locally, mapped to the agent's
    /// fast-check vocabulary.
    pub fn fast_path_for(runbook_id: &str) -> Option<(&'static str, &'static str)> {
        match runbook_id {
            "RB-WIN-SEC-001" => Some(("firewall", "enable")),
            "RB-WIN-SEC-003" => Some(("screenlock", "configure")),
            "RB-WIN-SEC-005" => Some(("bitlocker", "enable")),
            "RB-WIN-SEC-006" => Some(("defender", "start")),
            _ => None,
        }
    }

    pub fn register(&self, agent_id: &str, hostname: &str, capabilities: Vec<String>) {
        let key = hostname.to_lowercase();
        self.agents.insert(
            key,
            AgentEntry {
                agent_id: agent_id.to_string(),
                hostname: hostname.to_string(),
                capabilities,
                last_heartbeat: Utc::now(),
                queued_commands: Vec::new(),
            },
        );
        info!(agent_id, hostname, "agent registered");
    }

    pub fn has_agent_for_host(&self, hostname: &str) -> bool {
        self.agents.contains_key(&hostname.to_lowercase())
    }

    /// Queue a heal command for delivery on the agent's next heartbeat.
    /// Returns false when no agent is registered for the host.
    pub fn queue_heal_command(&self, hostname: &str, command: HealCommand) -> bool {
        match self.agents.get_mut(&hostname.to_lowercase()) {
            Some(mut entry) => {
                entry.queued_commands.push(command);
                true
            }
            None => false,
        }
    }

    /// Drain queued commands at heartbeat time and refresh the liveness stamp.
    pub fn heartbeat(&self, hostname: &str) -> Vec<HealCommand> {
        match self.agents.get_mut(&hostname.to_lowercase()) {
            Some(mut entry) => {
                entry.last_heartbeat = Utc::now();
                std::mem::take(&mut entry.queued_commands)
            }
            None => Vec::new(),
        }
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn status(&self) -> Vec<Value> {
        self.agents
            .iter()
            .map(|entry| {
                json!({
                    "agent_id": entry.agent_id,
                    "hostname": entry.hostname,
                    "capabilities": entry.capabilities,
                    "last_heartbeat": entry.last_heartbeat.to_rfc3339(),
                    "queued_commands": entry.queued_commands.len(),
                })
            })
            .collect()
    }
}

/// A drift event pushed by a sensor.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorDriftEvent {
    pub hostname: String,
    pub check_type: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub details: Value,
}

/// Agent registration request.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub hostname: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Heartbeat request from a workstation agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentHeartbeat {
    pub hostname: String,
}

/// Shared state behind the sensor API.
pub struct SensorState {
    pub site_id: String,
    pub healer: Option<Arc<AutoHealer>>,
    pub registry: Arc<AgentRegistry>,
    pub version: &'static str,
}

async fn health(State(state): State<Arc<SensorState>>) -> Json<Value> {
    Json(json!({"status": "ok", "version": state.version}))
}

async fn sensor_drift(
    State(state): State<Arc<SensorState>>,
    Json(event): Json<SensorDriftEvent>,
) -> Json<Value> {
    handle_drift_event(&state, event, "windows_sensor").await
}

async fn linux_sensor_drift(
    State(state): State<Arc<SensorState>>,
    Json(event): Json<SensorDriftEvent>,
) -> Json<Value> {
    handle_drift_event(&state, event, "linux_sensor").await
}

async fn handle_drift_event(state: &SensorState, event: SensorDriftEvent, source: &str) -> Json<Value> {
    let severity = event
        .severity
        .as_deref()
        .and_then(|s| s.parse::<Severity>().ok())
        .unwrap_or(Severity::High);

    let Some(healer) = &state.healer else {
        warn!(check_type = %event.check_type, "drift event received but healing disabled");
        return Json(json!({"accepted": true, "healed": false}));
    };

    let raw_data = json!({
        "check_type": event.check_type,
        "drift_detected": true,
        "source": source,
        "details": if event.details.is_null() { json!({}) } else { event.details.clone() },
    });

    let result = healer
        .heal(&state.site_id, &event.hostname, &event.check_type, severity, raw_data)
        .await;

    match result {
        Ok(healing) => Json(json!({
            "accepted": true,
            "incident_id": healing.incident_id,
            "resolution_level": healing.resolution_level.as_str(),
            "success": healing.success,
            "escalated": healing.escalated,
        })),
        Err(e) => {
            warn!(error = %e, "sensor-driven healing failed");
            Json(json!({"accepted": true, "healed": false, "error": e.to_string()}))
        }
    }
}

async fn agent_register(
    State(state): State<Arc<SensorState>>,
    Json(registration): Json<AgentRegistration>,
) -> Json<Value> {
    state
        .registry
        .register(&registration.agent_id, &registration.hostname, registration.capabilities);
    Json(json!({"registered": true}))
}

async fn agent_heartbeat(
    State(state): State<Arc<SensorState>>,
    Json(heartbeat): Json<AgentHeartbeat>,
) -> Json<Value> {
    let commands = state.registry.heartbeat(&heartbeat.hostname);
    Json(json!({"heal_commands": commands}))
}

async fn agent_status(State(state): State<Arc<SensorState>>) -> Json<Value> {
    Json(json!({"agents": state.registry.status()}))
}

/// Build the sensor API router.
pub fn sensor_router(state: Arc<SensorState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sensor/drift", post(sensor_drift))
        .route("/sensor/drift", post(linux_sensor_drift))
        .route("/api/agent/register", post(agent_register))
        .route("/api/agent/heartbeat", post(agent_heartbeat))
        .route("/api/agent/status", get(agent_status))
        .with_state(state)
}

/// Serve the sensor API until the shutdown signal flips.
pub async fn serve_sensor_api(
    state: Arc<SensorState>,
    port: u16,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> crate::error::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "sensor API server started");

    axum::serve(listener, sensor_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    info!("sensor API server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_queue_and_heartbeat_drain() {
        let registry = AgentRegistry::new();
        registry.register("agent-1", "WS12", vec!["firewall".into()]);

        assert!(registry.has_agent_for_host("ws12"));
        assert!(!registry.has_agent_for_host("ws99"));

        let cmd = HealCommand {
            command_id: "heal-abc".into(),
            check_type: "firewall".into(),
            action: "enable".into(),
            params: json!({}),
            timeout_seconds: 60,
        };
        assert!(registry.queue_heal_command("WS12", cmd));
        assert!(!registry.queue_heal_command("ws99", HealCommand {
            command_id: "x".into(),
            check_type: "firewall".into(),
            action: "enable".into(),
            params: json!({}),
            timeout_seconds: 60,
        }));

        let drained = registry.heartbeat("ws12");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].command_id, "heal-abc");
        // queue is drained after delivery
        assert!(registry.heartbeat("ws12").is_empty());
    }

    #[test]
    fn fast_path_covers_agent_runbooks() {
        assert_eq!(AgentRegistry::fast_path_for("RB-WIN-SEC-001"), Some(("firewall", "enable")));
        assert_eq!(AgentRegistry::fast_path_for("RB-WIN-SEC-006"), Some(("defender", "start")));
        assert_eq!(AgentRegistry::fast_path_for("RB-WIN-PATCH-001"), None);
    }
}
