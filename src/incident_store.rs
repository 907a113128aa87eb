//! Incident store: the single source of truth for the data flywheel.
//!
//! Append-only incident log with a single resolution update per row, plus
//! materialized pattern statistics, promoted-rule records, learning feedback,
//! and persistent flap suppressions. All three healing tiers read their
//! historical context from here.
//!
//! Single-writer discipline: one WAL-journaled connection behind a mutex; the
//! insert-incident / upsert-stats pair runs inside one transaction.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crypto::sha256_hex;
use crate::error::{ApplianceError, Result};

/// Incident severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ApplianceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(ApplianceError::Config(format!("unknown severity: {}", other))),
        }
    }
}

/// Which tier resolved the incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionLevel {
    #[serde(rename = "L1")]
    Level1Deterministic,
    #[serde(rename = "L2")]
    Level2Llm,
    #[serde(rename = "L3")]
    Level3Human,
    #[serde(rename = "UNRESOLVED")]
    Unresolved,
}

impl ResolutionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionLevel::Level1Deterministic => "L1",
            ResolutionLevel::Level2Llm => "L2",
            ResolutionLevel::Level3Human => "L3",
            ResolutionLevel::Unresolved => "UNRESOLVED",
        }
    }
}

impl FromStr for ResolutionLevel {
    type Err = ApplianceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "L1" => Ok(ResolutionLevel::Level1Deterministic),
            "L2" => Ok(ResolutionLevel::Level2Llm),
            "L3" => Ok(ResolutionLevel::Level3Human),
            "UNRESOLVED" => Ok(ResolutionLevel::Unresolved),
            other => Err(ApplianceError::Config(format!("unknown resolution level: {}", other))),
        }
    }
}

/// Outcome of incident resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentOutcome {
    Success,
    Failure,
    Partial,
    Escalated,
    Timeout,
}

impl IncidentOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentOutcome::Success => "success",
            IncidentOutcome::Failure => "failure",
            IncidentOutcome::Partial => "partial",
            IncidentOutcome::Escalated => "escalated",
            IncidentOutcome::Timeout => "timeout",
        }
    }
}

impl FromStr for IncidentOutcome {
    type Err = ApplianceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(IncidentOutcome::Success),
            "failure" => Ok(IncidentOutcome::Failure),
            "partial" => Ok(IncidentOutcome::Partial),
            "escalated" => Ok(IncidentOutcome::Escalated),
            "timeout" => Ok(IncidentOutcome::Timeout),
            other => Err(ApplianceError::Config(format!("unknown outcome: {}", other))),
        }
    }
}

/// An incident observed by the appliance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub site_id: String,
    pub host_id: String,
    pub incident_type: String,
    pub severity: Severity,
    pub raw_data: serde_json::Value,
    pub pattern_signature: String,
    pub created_at: String,
    pub resolved_at: Option<String>,
    pub resolution_level: Option<ResolutionLevel>,
    pub resolution_action: Option<String>,
    pub outcome: Option<IncidentOutcome>,
    pub resolution_time_ms: Option<i64>,
    pub human_feedback: Option<String>,
    pub promoted_to_l1: bool,
}

/// Materialized statistics for a pattern signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternStats {
    pub pattern_signature: String,
    pub total_occurrences: i64,
    pub l1_resolutions: i64,
    pub l2_resolutions: i64,
    pub l3_resolutions: i64,
    pub success_count: i64,
    pub success_rate: f64,
    pub avg_resolution_time_ms: f64,
    pub total_resolution_time_ms: i64,
    pub last_seen: Option<String>,
    pub recommended_action: Option<String>,
    pub promotion_eligible: bool,
}

/// Historical context for a pattern, consumed by L2 and L3.
#[derive(Debug, Clone, Serialize)]
pub struct PatternContext {
    pub pattern_signature: String,
    pub stats: Option<PatternStats>,
    pub recent_incidents: Vec<Incident>,
    /// (resolution_action, count), most frequent first
    pub successful_actions: Vec<(String, i64)>,
    pub has_recommended_action: bool,
    pub promotion_eligible: bool,
}

/// An active flap suppression row.
#[derive(Debug, Clone, Serialize)]
pub struct FlapSuppression {
    pub site_id: String,
    pub host_id: String,
    pub incident_type: String,
    pub suppressed_at: String,
    pub reason: String,
}

/// Report from a pruning pass.
#[derive(Debug, Clone, Serialize)]
pub struct PruneReport {
    pub incidents_deleted: usize,
    pub feedback_deleted: usize,
    pub pattern_stats_deleted: usize,
    pub incidents_before: i64,
    pub incidents_after: i64,
    pub retention_days: u32,
}

/// Aggregate resolution statistics over a window, for dashboards and the
/// flywheel health assessment.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub period_days: u32,
    pub total_incidents: i64,
    pub l1_percentage: f64,
    pub l2_percentage: f64,
    pub l3_percentage: f64,
    pub success_rate: f64,
    pub avg_resolution_time_ms: f64,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn timestamp_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}").unwrap())
}

fn ip_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}").unwrap())
}

fn uuid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}").unwrap()
    })
}

fn hash_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/[a-z0-9]{32}/").unwrap())
}

/// Normalize an error message by replacing variable parts with placeholders.
fn normalize_error(error: &str) -> String {
    let s = timestamp_regex().replace_all(error, "<TIMESTAMP>");
    let s = ip_regex().replace_all(&s, "<IP>");
    let s = uuid_regex().replace_all(&s, "<UUID>");
    let s = hash_path_regex().replace_all(&s, "/<HASH>/");
    s.chars().take(200).collect()
}

/// Generate a stable pattern signature for an incident.
///
/// Hashes the incident type plus a curated subset of `raw_data` with variable
/// content (timestamps, IPs, UUIDs, 32-hex path segments) normalized out, so
/// the same kind of incident maps to the same 16-hex signature across hosts
/// and time.
pub fn generate_pattern_signature(incident_type: &str, raw_data: &serde_json::Value) -> String {
    let mut fields: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
    fields.insert("type", serde_json::Value::String(incident_type.to_string()));

    for key in ["check_type", "drift_type", "service_name"] {
        if let Some(v) = raw_data.get(key) {
            if !v.is_null() {
                fields.insert(key, v.clone());
            }
        }
    }

    if let Some(error) = raw_data.get("error_message").and_then(|v| v.as_str()) {
        fields.insert(
            "error_pattern",
            serde_json::Value::String(normalize_error(error)),
        );
    }

    let canonical = serde_json::to_string(&fields).unwrap_or_default();
    sha256_hex(canonical.as_bytes())[..16].to_string()
}

/// SQLite-backed incident database.
pub struct IncidentStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl IncidentStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS incidents (
                id TEXT PRIMARY KEY,
                site_id TEXT NOT NULL,
                host_id TEXT NOT NULL,
                incident_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                raw_data TEXT NOT NULL,
                pattern_signature TEXT NOT NULL,
                created_at TEXT NOT NULL,
                resolved_at TEXT,
                resolution_level TEXT,
                resolution_action TEXT,
                outcome TEXT,
                resolution_time_ms INTEGER,
                human_feedback TEXT,
                promoted_to_l1 BOOLEAN DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS pattern_stats (
                pattern_signature TEXT PRIMARY KEY,
                total_occurrences INTEGER DEFAULT 0,
                l1_resolutions INTEGER DEFAULT 0,
                l2_resolutions INTEGER DEFAULT 0,
                l3_resolutions INTEGER DEFAULT 0,
                success_count INTEGER DEFAULT 0,
                total_resolution_time_ms INTEGER DEFAULT 0,
                last_seen TEXT,
                recommended_action TEXT,
                promotion_eligible BOOLEAN DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS promoted_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pattern_signature TEXT NOT NULL UNIQUE,
                rule_yaml TEXT NOT NULL,
                promoted_at TEXT NOT NULL,
                promoted_from_incidents TEXT NOT NULL,
                success_rate_at_promotion REAL NOT NULL,
                occurrences_at_promotion INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS learning_feedback (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                incident_id TEXT NOT NULL,
                feedback_type TEXT NOT NULL,
                feedback_data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (incident_id) REFERENCES incidents(id)
            );

            CREATE TABLE IF NOT EXISTS flap_suppressions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                site_id TEXT NOT NULL,
                host_id TEXT NOT NULL,
                incident_type TEXT NOT NULL,
                suppressed_at TEXT NOT NULL,
                reason TEXT NOT NULL,
                cleared_at TEXT,
                cleared_by TEXT,
                UNIQUE(site_id, host_id, incident_type)
            );

            CREATE INDEX IF NOT EXISTS idx_incidents_pattern ON incidents(pattern_signature);
            CREATE INDEX IF NOT EXISTS idx_incidents_type ON incidents(incident_type);
            CREATE INDEX IF NOT EXISTS idx_incidents_site ON incidents(site_id);
            CREATE INDEX IF NOT EXISTS idx_incidents_created ON incidents(created_at);
            CREATE INDEX IF NOT EXISTS idx_incidents_outcome ON incidents(outcome);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Create a new incident and update pattern stats atomically.
    pub fn create_incident(
        &self,
        site_id: &str,
        host_id: &str,
        incident_type: &str,
        severity: Severity,
        raw_data: serde_json::Value,
    ) -> Result<Incident> {
        let now = Utc::now();
        let created_at = now.to_rfc3339();
        let id = format!(
            "INC-{}-{:06}-{}",
            now.format("%Y%m%d%H%M%S"),
            now.timestamp_subsec_micros(),
            &uuid::Uuid::new_v4().simple().to_string()[..4]
        );
        let pattern_signature = generate_pattern_signature(incident_type, &raw_data);

        let incident = Incident {
            id: id.clone(),
            site_id: site_id.to_string(),
            host_id: host_id.to_string(),
            incident_type: incident_type.to_string(),
            severity,
            raw_data: raw_data.clone(),
            pattern_signature: pattern_signature.clone(),
            created_at: created_at.clone(),
            resolved_at: None,
            resolution_level: None,
            resolution_action: None,
            outcome: None,
            resolution_time_ms: None,
            human_feedback: None,
            promoted_to_l1: false,
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO incidents (
                id, site_id, host_id, incident_type, severity,
                raw_data, pattern_signature, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                incident.id,
                incident.site_id,
                incident.host_id,
                incident.incident_type,
                incident.severity.as_str(),
                serde_json::to_string(&incident.raw_data)?,
                incident.pattern_signature,
                incident.created_at,
            ],
        )?;
        tx.execute(
            "INSERT INTO pattern_stats (pattern_signature, total_occurrences, last_seen)
             VALUES (?1, 1, ?2)
             ON CONFLICT(pattern_signature) DO UPDATE SET
                 total_occurrences = total_occurrences + 1,
                 last_seen = excluded.last_seen",
            params![pattern_signature, created_at],
        )?;
        tx.commit()?;

        Ok(incident)
    }

    /// Record the resolution of an incident and fold it into pattern stats.
    ///
    /// Idempotent: a second call for an already-resolved incident is a no-op.
    pub fn resolve_incident(
        &self,
        incident_id: &str,
        level: ResolutionLevel,
        action: &str,
        outcome: IncidentOutcome,
        resolution_time_ms: i64,
    ) -> Result<()> {
        let resolved_at = now_iso();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let row: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT pattern_signature, resolved_at FROM incidents WHERE id = ?1",
                params![incident_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((pattern_signature, existing)) = row else {
            return Err(ApplianceError::Config(format!(
                "incident {} not found",
                incident_id
            )));
        };

        if existing.is_some() {
            debug!(incident_id, "incident already resolved, skipping");
            return Ok(());
        }

        tx.execute(
            "UPDATE incidents SET
                resolved_at = ?1,
                resolution_level = ?2,
                resolution_action = ?3,
                outcome = ?4,
                resolution_time_ms = ?5
             WHERE id = ?6",
            params![
                resolved_at,
                level.as_str(),
                action,
                outcome.as_str(),
                resolution_time_ms,
                incident_id,
            ],
        )?;

        let level_code: i64 = match level {
            ResolutionLevel::Level1Deterministic => 1,
            ResolutionLevel::Level2Llm => 2,
            _ => 3,
        };
        let success_increment: i64 = if outcome == IncidentOutcome::Success { 1 } else { 0 };

        tx.execute(
            "UPDATE pattern_stats SET
                l1_resolutions = l1_resolutions + CASE WHEN ?1 = 1 THEN 1 ELSE 0 END,
                l2_resolutions = l2_resolutions + CASE WHEN ?1 = 2 THEN 1 ELSE 0 END,
                l3_resolutions = l3_resolutions + CASE WHEN ?1 = 3 THEN 1 ELSE 0 END,
                success_count = success_count + ?2,
                total_resolution_time_ms = total_resolution_time_ms + ?3,
                recommended_action = CASE WHEN ?4 = 'success' THEN ?5 ELSE recommended_action END
             WHERE pattern_signature = ?6",
            params![
                level_code,
                success_increment,
                resolution_time_ms,
                outcome.as_str(),
                action,
                pattern_signature,
            ],
        )?;

        Self::check_promotion_eligibility(&tx, &pattern_signature)?;
        tx.commit()?;
        Ok(())
    }

    /// Re-evaluate the promotion eligibility flag for a pattern.
    ///
    /// Eligible iff: >= 5 occurrences, >= 3 L2 resolutions, success rate
    /// >= 0.9, average resolution time <= 30 s, and a recommended action set.
    fn check_promotion_eligibility(conn: &Connection, pattern_signature: &str) -> Result<()> {
        let row: Option<(i64, i64, i64, i64, Option<String>)> = conn
            .query_row(
                "SELECT total_occurrences, l2_resolutions, success_count,
                        total_resolution_time_ms, recommended_action
                 FROM pattern_stats WHERE pattern_signature = ?1",
                params![pattern_signature],
                |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                },
            )
            .optional()?;

        let Some((total, l2, success, total_ms, action)) = row else {
            return Ok(());
        };

        if total >= 5 && l2 >= 3 && action.is_some() {
            let success_rate = success as f64 / total as f64;
            let avg_ms = total_ms as f64 / total as f64;
            if success_rate >= 0.9 && avg_ms <= 30_000.0 {
                conn.execute(
                    "UPDATE pattern_stats SET promotion_eligible = 1
                     WHERE pattern_signature = ?1",
                    params![pattern_signature],
                )?;
            }
        }
        Ok(())
    }

    fn incident_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Incident> {
        let severity: String = row.get("severity")?;
        let raw: String = row.get("raw_data")?;
        let level: Option<String> = row.get("resolution_level")?;
        let outcome: Option<String> = row.get("outcome")?;
        Ok(Incident {
            id: row.get("id")?,
            site_id: row.get("site_id")?,
            host_id: row.get("host_id")?,
            incident_type: row.get("incident_type")?,
            severity: severity.parse().unwrap_or(Severity::Info),
            raw_data: serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
            pattern_signature: row.get("pattern_signature")?,
            created_at: row.get("created_at")?,
            resolved_at: row.get("resolved_at")?,
            resolution_level: level.and_then(|l| l.parse().ok()),
            resolution_action: row.get("resolution_action")?,
            outcome: outcome.and_then(|o| o.parse().ok()),
            resolution_time_ms: row.get("resolution_time_ms")?,
            human_feedback: row.get("human_feedback")?,
            promoted_to_l1: row.get("promoted_to_l1")?,
        })
    }

    fn stats_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PatternStats> {
        let total: i64 = row.get("total_occurrences")?;
        let success: i64 = row.get("success_count")?;
        let total_ms: i64 = row.get("total_resolution_time_ms")?;
        let denom = total.max(1) as f64;
        Ok(PatternStats {
            pattern_signature: row.get("pattern_signature")?,
            total_occurrences: total,
            l1_resolutions: row.get("l1_resolutions")?,
            l2_resolutions: row.get("l2_resolutions")?,
            l3_resolutions: row.get("l3_resolutions")?,
            success_count: success,
            success_rate: success as f64 / denom,
            avg_resolution_time_ms: total_ms as f64 / denom,
            total_resolution_time_ms: total_ms,
            last_seen: row.get("last_seen")?,
            recommended_action: row.get("recommended_action")?,
            promotion_eligible: row.get("promotion_eligible")?,
        })
    }

    pub fn get_incident(&self, incident_id: &str) -> Result<Option<Incident>> {
        let conn = self.conn.lock();
        let incident = conn
            .query_row(
                "SELECT * FROM incidents WHERE id = ?1",
                params![incident_id],
                Self::incident_from_row,
            )
            .optional()?;
        Ok(incident)
    }

    pub fn get_pattern_stats(&self, pattern_signature: &str) -> Result<Option<PatternStats>> {
        let conn = self.conn.lock();
        let stats = conn
            .query_row(
                "SELECT * FROM pattern_stats WHERE pattern_signature = ?1",
                params![pattern_signature],
                Self::stats_from_row,
            )
            .optional()?;
        Ok(stats)
    }

    /// Historical context for a pattern: stats, recent incidents, and the top
    /// successful actions by frequency.
    pub fn get_pattern_context(&self, pattern_signature: &str, limit: usize) -> Result<PatternContext> {
        let stats = self.get_pattern_stats(pattern_signature)?;
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT * FROM incidents WHERE pattern_signature = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let recent_incidents: Vec<Incident> = stmt
            .query_map(params![pattern_signature, limit as i64], Self::incident_from_row)?
            .collect::<rusqlite::Result<_>>()?;

        let mut stmt = conn.prepare(
            "SELECT resolution_action, COUNT(*) as count FROM incidents
             WHERE pattern_signature = ?1 AND outcome = 'success'
             GROUP BY resolution_action ORDER BY count DESC LIMIT 5",
        )?;
        let successful_actions: Vec<(String, i64)> = stmt
            .query_map(params![pattern_signature], |row| {
                Ok((row.get::<_, Option<String>>(0)?.unwrap_or_default(), row.get(1)?))
            })?
            .collect::<rusqlite::Result<_>>()?;

        let has_recommended_action = stats
            .as_ref()
            .map(|s| s.recommended_action.is_some())
            .unwrap_or(false);
        let promotion_eligible = stats.as_ref().map(|s| s.promotion_eligible).unwrap_or(false);

        Ok(PatternContext {
            pattern_signature: pattern_signature.to_string(),
            stats,
            recent_incidents,
            successful_actions,
            has_recommended_action,
            promotion_eligible,
        })
    }

    /// Recent successfully-resolved incidents of the same type, optionally
    /// scoped to a site.
    pub fn get_similar_incidents(
        &self,
        incident_type: &str,
        site_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Incident>> {
        let conn = self.conn.lock();
        let mut query = String::from(
            "SELECT * FROM incidents WHERE incident_type = ?1 AND outcome = 'success'",
        );
        if site_id.is_some() {
            query.push_str(" AND site_id = ?2");
        }
        query.push_str(" ORDER BY created_at DESC LIMIT ?");
        query.push_str(if site_id.is_some() { "3" } else { "2" });

        let mut stmt = conn.prepare(&query)?;
        let incidents: Vec<Incident> = if let Some(site) = site_id {
            stmt.query_map(params![incident_type, site, limit as i64], Self::incident_from_row)?
                .collect::<rusqlite::Result<_>>()?
        } else {
            stmt.query_map(params![incident_type, limit as i64], Self::incident_from_row)?
                .collect::<rusqlite::Result<_>>()?
        };
        Ok(incidents)
    }

    /// Patterns currently flagged promotion-eligible, most frequent first.
    pub fn get_promotion_candidates(&self) -> Result<Vec<PatternStats>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM pattern_stats WHERE promotion_eligible = 1
             ORDER BY total_occurrences DESC",
        )?;
        let stats: Vec<PatternStats> = stmt
            .query_map([], Self::stats_from_row)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(stats)
    }

    /// All pattern stats rows, for outbound sync.
    pub fn all_pattern_stats(&self) -> Result<Vec<PatternStats>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM pattern_stats")?;
        let stats: Vec<PatternStats> = stmt
            .query_map([], Self::stats_from_row)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(stats)
    }

    /// Record a completed promotion: insert the promoted rule, stamp the
    /// source incidents, and clear the eligibility flag.
    pub fn promote_pattern(
        &self,
        pattern_signature: &str,
        rule_yaml: &str,
        incident_ids: &[String],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let row: Option<(i64, i64)> = tx
            .query_row(
                "SELECT success_count, total_occurrences FROM pattern_stats
                 WHERE pattern_signature = ?1",
                params![pattern_signature],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((success, occurrences)) = row else {
            return Err(ApplianceError::Config(format!(
                "pattern {} not found",
                pattern_signature
            )));
        };
        let success_rate = success as f64 / occurrences.max(1) as f64;

        tx.execute(
            "INSERT INTO promoted_rules (
                pattern_signature, rule_yaml, promoted_at, promoted_from_incidents,
                success_rate_at_promotion, occurrences_at_promotion
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                pattern_signature,
                rule_yaml,
                now_iso(),
                serde_json::to_string(incident_ids)?,
                success_rate,
                occurrences,
            ],
        )?;
        tx.execute(
            "UPDATE incidents SET promoted_to_l1 = 1 WHERE pattern_signature = ?1",
            params![pattern_signature],
        )?;
        tx.execute(
            "UPDATE pattern_stats SET promotion_eligible = 0 WHERE pattern_signature = ?1",
            params![pattern_signature],
        )?;
        tx.commit()?;

        info!(pattern_signature, "pattern promoted to L1");
        Ok(())
    }

    /// Post-promotion L1 performance for a rule since its promotion time.
    ///
    /// Matches by `resolution_action LIKE '%<rule_id>%'`; returns
    /// (total, successes, failures).
    pub fn post_promotion_stats(&self, rule_id: &str, promoted_at: &str) -> Result<(i64, i64, i64)> {
        let conn = self.conn.lock();
        let pattern = format!("%{}%", rule_id);
        let row = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN outcome = 'success' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN outcome = 'failure' THEN 1 ELSE 0 END), 0)
             FROM incidents
             WHERE resolution_level = 'L1'
               AND resolution_action LIKE ?1
               AND resolved_at >= ?2",
            params![pattern, promoted_at],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(row)
    }

    /// Record human feedback for learning; mirrored onto the incident row.
    pub fn add_human_feedback(
        &self,
        incident_id: &str,
        feedback_type: &str,
        feedback_data: &serde_json::Value,
    ) -> Result<()> {
        let data = serde_json::to_string(feedback_data)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO learning_feedback (incident_id, feedback_type, feedback_data, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![incident_id, feedback_type, data, now_iso()],
        )?;
        tx.execute(
            "UPDATE incidents SET human_feedback = ?1 WHERE id = ?2",
            params![data, incident_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_recent_incidents(&self, limit: usize, site_id: Option<&str>) -> Result<Vec<Incident>> {
        let conn = self.conn.lock();
        let incidents = if let Some(site) = site_id {
            let mut stmt = conn.prepare(
                "SELECT * FROM incidents WHERE site_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![site, limit as i64], Self::incident_from_row)?
                .collect::<rusqlite::Result<_>>()?;
            rows
        } else {
            let mut stmt =
                conn.prepare("SELECT * FROM incidents ORDER BY created_at DESC LIMIT ?1")?;
            let rows = stmt
                .query_map(params![limit as i64], Self::incident_from_row)?
                .collect::<rusqlite::Result<_>>()?;
            rows
        };
        Ok(incidents)
    }

    pub fn get_stats_summary(&self, days: u32) -> Result<StatsSummary> {
        let cutoff = (Utc::now() - Duration::days(days as i64)).to_rfc3339();
        let conn = self.conn.lock();
        let row: (i64, i64, i64, i64, i64, Option<f64>) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN resolution_level = 'L1' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN resolution_level = 'L2' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN resolution_level = 'L3' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN outcome = 'success' THEN 1 ELSE 0 END), 0),
                    AVG(resolution_time_ms)
             FROM incidents WHERE created_at >= ?1",
            params![cutoff],
            |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
            },
        )?;

        let total = row.0.max(1) as f64;
        Ok(StatsSummary {
            period_days: days,
            total_incidents: row.0,
            l1_percentage: row.1 as f64 / total * 100.0,
            l2_percentage: row.2 as f64 / total * 100.0,
            l3_percentage: row.3 as f64 / total * 100.0,
            success_rate: row.4 as f64 / total * 100.0,
            avg_resolution_time_ms: row.5.unwrap_or(0.0),
        })
    }

    /// Delete old resolved incidents, cascading learning feedback and pruning
    /// orphan pattern stats; compacts the database afterwards.
    pub fn prune_old_incidents(&self, retention_days: u32, keep_unresolved: bool) -> Result<PruneReport> {
        let cutoff = (Utc::now() - Duration::days(retention_days as i64)).to_rfc3339();
        let conn = self.conn.lock();

        let before: i64 = conn.query_row("SELECT COUNT(*) FROM incidents", [], |r| r.get(0))?;

        let feedback_deleted = conn.execute(
            "DELETE FROM learning_feedback WHERE incident_id IN (
                SELECT id FROM incidents
                WHERE created_at < ?1 AND (resolved_at IS NOT NULL OR ?2 = 0)
             )",
            params![cutoff, keep_unresolved as i64],
        )?;

        let incidents_deleted = if keep_unresolved {
            conn.execute(
                "DELETE FROM incidents WHERE created_at < ?1 AND resolved_at IS NOT NULL",
                params![cutoff],
            )?
        } else {
            conn.execute("DELETE FROM incidents WHERE created_at < ?1", params![cutoff])?
        };

        let stats_deleted = conn.execute(
            "DELETE FROM pattern_stats
             WHERE last_seen < ?1 AND promotion_eligible = 0
               AND pattern_signature NOT IN (SELECT DISTINCT pattern_signature FROM incidents)",
            params![cutoff],
        )?;

        conn.execute_batch("VACUUM")?;

        let after: i64 = conn.query_row("SELECT COUNT(*) FROM incidents", [], |r| r.get(0))?;

        let report = PruneReport {
            incidents_deleted,
            feedback_deleted,
            pattern_stats_deleted: stats_deleted,
            incidents_before: before,
            incidents_after: after,
            retention_days,
        };
        info!(
            incidents = report.incidents_deleted,
            feedback = report.feedback_deleted,
            stats = report.pattern_stats_deleted,
            retention_days,
            "pruned incident database"
        );
        Ok(report)
    }

    /// Database size and record counts for monitoring.
    pub fn get_database_stats(&self) -> Result<serde_json::Value> {
        let conn = self.conn.lock();
        let mut stats = serde_json::Map::new();

        if let Ok(meta) = std::fs::metadata(&self.db_path) {
            stats.insert("file_size_bytes".into(), meta.len().into());
        }
        let wal_path = PathBuf::from(format!("{}-wal", self.db_path.display()));
        if let Ok(meta) = std::fs::metadata(&wal_path) {
            stats.insert("wal_size_bytes".into(), meta.len().into());
        }

        for table in ["incidents", "pattern_stats", "promoted_rules", "learning_feedback"] {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))?;
            stats.insert(format!("{}_count", table), count.into());
        }

        let (oldest, newest): (Option<String>, Option<String>) = conn.query_row(
            "SELECT MIN(created_at), MAX(created_at) FROM incidents",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        stats.insert("oldest_incident".into(), oldest.into());
        stats.insert("newest_incident".into(), newest.into());

        let unresolved: i64 = conn.query_row(
            "SELECT COUNT(*) FROM incidents WHERE resolved_at IS NULL",
            [],
            |r| r.get(0),
        )?;
        stats.insert("unresolved_count".into(), unresolved.into());

        Ok(serde_json::Value::Object(stats))
    }

    /// Record a flap suppression. Healing stays suppressed until cleared by a
    /// human; re-recording re-activates a previously cleared row.
    pub fn record_flap_suppression(
        &self,
        site_id: &str,
        host_id: &str,
        incident_type: &str,
        reason: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO flap_suppressions (site_id, host_id, incident_type, suppressed_at, reason)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(site_id, host_id, incident_type) DO UPDATE SET
                 suppressed_at = excluded.suppressed_at,
                 reason = excluded.reason,
                 cleared_at = NULL,
                 cleared_by = NULL",
            params![site_id, host_id, incident_type, now_iso(), reason],
        )?;
        warn!(site_id, host_id, incident_type, "flap suppression recorded");
        Ok(())
    }

    pub fn is_flap_suppressed(&self, site_id: &str, host_id: &str, incident_type: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM flap_suppressions
                 WHERE site_id = ?1 AND host_id = ?2 AND incident_type = ?3
                   AND cleared_at IS NULL",
                params![site_id, host_id, incident_type],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Clear a suppression so healing can resume. Returns true if a row was
    /// actually cleared.
    pub fn clear_flap_suppression(
        &self,
        site_id: &str,
        host_id: &str,
        incident_type: &str,
        cleared_by: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE flap_suppressions SET cleared_at = ?1, cleared_by = ?2
             WHERE site_id = ?3 AND host_id = ?4 AND incident_type = ?5
               AND cleared_at IS NULL",
            params![now_iso(), cleared_by, site_id, host_id, incident_type],
        )?;
        Ok(changed > 0)
    }

    pub fn get_active_suppressions(&self) -> Result<Vec<FlapSuppression>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT site_id, host_id, incident_type, suppressed_at, reason
             FROM flap_suppressions WHERE cleared_at IS NULL
             ORDER BY suppressed_at DESC",
        )?;
        let rows: Vec<FlapSuppression> = stmt
            .query_map([], |row| {
                Ok(FlapSuppression {
                    site_id: row.get(0)?,
                    host_id: row.get(1)?,
                    incident_type: row.get(2)?,
                    suppressed_at: row.get(3)?,
                    reason: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }
}
