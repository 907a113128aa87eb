//! Self-healing compliance appliance.
//!
//! On-premises appliance for regulated environments: observes managed
//! endpoints for drift from a declared baseline, remediates through a
//! three-tier decision engine (deterministic rules, LLM planner with
//! guardrails, human escalation), emits cryptographically signed
//! tamper-evident evidence, and syncs telemetry with a central control
//! plane through a durable offline queue.
//!
//! Subsystem map:
//! - [`incident_store`]: append-only incident log and pattern statistics
//! - [`rules`]: L1 deterministic engine
//! - [`planner`]: L2 LLM planner with safety guardrails and budget governor
//! - [`escalation`]: L3 ticket routing
//! - [`healer`]: tier dispatch with circuit breaker and flap detection
//! - [`learning`]: L2-to-L1 promotion flywheel with rollback
//! - [`evidence`]: signed, deduplicated, hash-chained evidence bundles
//! - [`sync`]: durable outbound queue and promoted-rule pull
//! - [`agent`]: the orchestrator cycle

pub mod agent;
pub mod client;
pub mod config;
pub mod crypto;
pub mod detectors;
pub mod error;
pub mod escalation;
pub mod evidence;
pub mod executor;
pub mod healer;
pub mod incident_store;
pub mod learning;
pub mod ntp;
pub mod ots;
pub mod planner;
pub mod provisioning;
pub mod rules;
pub mod scrubber;
pub mod sensors;
pub mod sync;
pub mod update;

pub use config::ApplianceConfig;
pub use error::{ApplianceError, Result};
