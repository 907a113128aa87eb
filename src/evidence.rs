//! Evidence generation: canonical, hashed, signed records of check outcomes.
//!
//! Every drift check produces an evidence bundle: canonical JSON data, a
//! SHA-256 bundle hash, an NTP verification annotation, and an Ed25519
//! signature over the exact submission payload bytes. A deduplication gate
//! admits only state changes and periodic heartbeats, which keeps storage
//! flat for flapping checks without ever losing a transition.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto::{canonical_json, sha256_hex, Ed25519Signer};
use crate::error::Result;
use crate::ntp::NtpVerificationResult;

/// HIPAA control references for host drift checks.
pub fn hipaa_control_for_check(check_name: &str) -> Option<&'static str> {
    match check_name {
        "nixos_generation" => Some("164.312(c)(1)"),
        "ntp_sync" => Some("164.312(b)"),
        "services_running" => Some("164.312(a)(1)"),
        "disk_usage" => Some("164.308(a)(7)"),
        "firewall_enabled" => Some("164.312(e)(1)"),
        _ => None,
    }
}

/// An evidence bundle ready for submission and local persistence.
#[derive(Debug, Clone)]
pub struct EvidenceBundle {
    pub bundle_id: String,
    pub check_type: String,
    pub check_result: String,
    pub evidence_data: Value,
    /// SHA-256 over the canonical evidence data (signature excluded)
    pub bundle_hash: String,
    pub previous_bundle_hash: Option<String>,
}

/// The exact payload submitted to the control plane, with the byte-stable
/// signed document alongside its signature.
#[derive(Debug, Clone)]
pub struct SignedSubmission {
    pub payload: Value,
    pub signed_data: Option<String>,
    pub agent_signature: Option<String>,
}

/// Evidence generator with deduplication and per-host hash chaining.
pub struct EvidenceGenerator {
    site_id: String,
    agent_version: String,
    evidence_dir: PathBuf,
    signer: Mutex<Option<Arc<Ed25519Signer>>>,
    heartbeat_interval_secs: i64,
    /// check_type -> (last result, last submit time)
    dedup: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
    /// host:check_type -> last bundle hash
    chain: Mutex<HashMap<String, String>>,
}

impl EvidenceGenerator {
    pub fn new(
        site_id: &str,
        agent_version: &str,
        evidence_dir: PathBuf,
        signer: Option<Arc<Ed25519Signer>>,
        heartbeat_interval_secs: i64,
    ) -> Self {
        Self {
            site_id: site_id.to_string(),
            agent_version: agent_version.to_string(),
            evidence_dir,
            signer: Mutex::new(signer),
            heartbeat_interval_secs,
            dedup: Mutex::new(HashMap::new()),
            chain: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a signer is currently attached.
    pub fn has_signer(&self) -> bool {
        self.signer.lock().is_some()
    }

    /// Attach (or replace) the signer; the orchestrator retries signer
    /// initialization on later cycles after a startup failure.
    pub fn set_signer(&self, signer: Arc<Ed25519Signer>) {
        *self.signer.lock() = Some(signer);
    }

    /// Deduplication gate. Submit iff this is the first observation for the
    /// check type, the result changed, or the heartbeat interval elapsed.
    pub fn should_submit(&self, check_type: &str, result: &str) -> bool {
        let now = Utc::now();
        let mut dedup = self.dedup.lock();

        match dedup.get(check_type) {
            None => {
                dedup.insert(check_type.to_string(), (result.to_string(), now));
                debug!(check_type, "evidence submit: first observation");
                true
            }
            Some((last_result, last_time)) => {
                if last_result != result {
                    info!(
                        check_type,
                        from = %last_result,
                        to = %result,
                        "evidence submit: state changed"
                    );
                    dedup.insert(check_type.to_string(), (result.to_string(), now));
                    return true;
                }
                let elapsed = (now - *last_time).num_seconds();
                if elapsed >= self.heartbeat_interval_secs {
                    debug!(check_type, elapsed, "evidence submit: heartbeat");
                    dedup.insert(check_type.to_string(), (result.to_string(), now));
                    return true;
                }
                debug!(check_type, elapsed, "evidence skip: duplicate within heartbeat window");
                false
            }
        }
    }

    /// Assemble an evidence bundle for a check outcome. Returns `None` when
    /// the deduplication gate rejects it.
    pub fn build_bundle(
        &self,
        check_name: &str,
        status: &str,
        details: &Value,
        host_id: &str,
        ntp: Option<&NtpVerificationResult>,
        healing: Option<Value>,
    ) -> Result<Option<EvidenceBundle>> {
        if !self.should_submit(check_name, status) {
            return Ok(None);
        }

        let bundle_id = Uuid::new_v4().to_string();
        let chain_key = format!("{}:{}", host_id, check_name);
        let previous_bundle_hash = self.chain.lock().get(&chain_key).cloned();

        let mut evidence_data = serde_json::Map::new();
        evidence_data.insert("check_name".into(), json!(check_name));
        evidence_data.insert("status".into(), json!(status));
        evidence_data.insert("details".into(), details.clone());
        evidence_data.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        evidence_data.insert("site_id".into(), json!(self.site_id));
        evidence_data.insert("host_id".into(), json!(host_id));
        evidence_data.insert("agent_version".into(), json!(self.agent_version));
        if let Some(ntp) = ntp {
            evidence_data.insert("ntp_verification".into(), serde_json::to_value(ntp)?);
        }
        if let Some(healing) = healing {
            evidence_data.insert("healing".into(), healing);
        }
        if let Some(prev) = &previous_bundle_hash {
            evidence_data.insert("previous_bundle_hash".into(), json!(prev));
        }

        let evidence_data = Value::Object(evidence_data);
        let bundle_hash = sha256_hex(canonical_json(&evidence_data)?.as_bytes());
        self.chain.lock().insert(chain_key, bundle_hash.clone());

        Ok(Some(EvidenceBundle {
            bundle_id,
            check_type: check_name.to_string(),
            check_result: status.to_string(),
            evidence_data,
            bundle_hash,
            previous_bundle_hash,
        }))
    }

    /// Build the control-plane submission. The signature covers the exact
    /// sorted-keys serialization of `{site_id, checked_at, checks, summary}`,
    /// shipped verbatim as `signed_data`.
    pub fn build_submission(
        &self,
        bundle: &EvidenceBundle,
        host_id: &str,
        hipaa_control: Option<&str>,
    ) -> Result<SignedSubmission> {
        let checked_at = Utc::now().to_rfc3339();
        let checks = json!([{
            "check": bundle.check_type,
            "status": bundle.check_result,
            "host": host_id,
            "details": bundle.evidence_data,
            "hipaa_control": hipaa_control,
        }]);
        let result = bundle.check_result.as_str();
        let summary = json!({
            "total_checks": 1,
            "compliant": if matches!(result, "pass" | "compliant") { 1 } else { 0 },
            "non_compliant": if matches!(result, "fail" | "non_compliant") { 1 } else { 0 },
            "errors": if result == "error" { 1 } else { 0 },
            "local_hash": bundle.bundle_hash,
        });

        let mut payload = json!({
            "site_id": self.site_id,
            "checked_at": checked_at,
            "checks": checks,
            "summary": summary,
        });

        let signer = self.signer.lock().clone();
        let (signed_data, agent_signature) = match signer {
            Some(signer) => {
                let signed_data = canonical_json(&payload)?;
                let signature = signer.sign_hex(signed_data.as_bytes());
                (Some(signed_data), Some(signature))
            }
            None => (None, None),
        };

        if let (Some(signed_data), Some(signature)) = (&signed_data, &agent_signature) {
            if let Value::Object(map) = &mut payload {
                map.insert("agent_signature".into(), json!(signature));
                map.insert("signed_data".into(), json!(signed_data));
            }
        } else {
            warn!(bundle_id = %bundle.bundle_id, "submitting evidence unsigned");
        }

        Ok(SignedSubmission {
            payload,
            signed_data,
            agent_signature,
        })
    }

    /// Persist the bundle under `evidence_dir/YYYY/MM/DD/<bundle_id>/`.
    pub fn persist_local(&self, bundle: &EvidenceBundle, signature: Option<&str>) -> Result<PathBuf> {
        let date = Utc::now();
        let bundle_dir = self
            .evidence_dir
            .join(date.format("%Y").to_string())
            .join(date.format("%m").to_string())
            .join(date.format("%d").to_string())
            .join(&bundle.bundle_id);
        std::fs::create_dir_all(&bundle_dir)?;

        let bundle_path = bundle_dir.join("bundle.json");
        std::fs::write(
            &bundle_path,
            serde_json::to_string_pretty(&bundle.evidence_data)?,
        )?;

        if let Some(signature) = signature {
            std::fs::write(bundle_dir.join("bundle.sig"), signature)?;
            debug!(path = %bundle_path.display(), "local evidence stored with signature");
        } else {
            debug!(path = %bundle_path.display(), "local evidence stored");
        }

        Ok(bundle_path)
    }

    /// Remove bundles older than the retention period.
    pub fn cleanup_old_bundles(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let mut deleted = 0usize;

        if !self.evidence_dir.is_dir() {
            return Ok(0);
        }

        for year in std::fs::read_dir(&self.evidence_dir)?.flatten() {
            for month in std::fs::read_dir(year.path()).into_iter().flatten().flatten() {
                for day in std::fs::read_dir(month.path()).into_iter().flatten().flatten() {
                    let parts = format!(
                        "{}-{}-{}",
                        year.file_name().to_string_lossy(),
                        month.file_name().to_string_lossy(),
                        day.file_name().to_string_lossy()
                    );
                    let Ok(date) = chrono::NaiveDate::parse_from_str(&parts, "%Y-%m-%d") else {
                        continue;
                    };
                    if date
                        < cutoff.date_naive()
                    {
                        if let Ok(()) = std::fs::remove_dir_all(day.path()) {
                            deleted += 1;
                        }
                    }
                }
            }
        }

        if deleted > 0 {
            info!(deleted, retention_days, "cleaned up old evidence bundles");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ensure_signing_key, verify_signature};
    use tempfile::tempdir;

    fn generator(dir: &tempfile::TempDir, signed: bool, heartbeat_secs: i64) -> EvidenceGenerator {
        let signer = if signed {
            let key_path = dir.path().join("signing.key");
            ensure_signing_key(&key_path).unwrap();
            Some(Arc::new(Ed25519Signer::load(&key_path).unwrap()))
        } else {
            None
        };
        EvidenceGenerator::new(
            "clinic-001",
            "1.0.16",
            dir.path().join("evidence"),
            signer,
            heartbeat_secs,
        )
    }

    #[test]
    fn dedup_admits_first_then_changes_only() {
        // S5: repeated identical results collapse to one submission; the
        // state change is always admitted
        let dir = tempdir().unwrap();
        let generator = generator(&dir, false, 3600);

        assert!(generator.should_submit("linux_ntp_sync", "pass"));
        for _ in 0..9 {
            assert!(!generator.should_submit("linux_ntp_sync", "pass"));
        }
        assert!(generator.should_submit("linux_ntp_sync", "fail"));
        assert!(!generator.should_submit("linux_ntp_sync", "fail"));
        assert!(generator.should_submit("linux_ntp_sync", "pass"));
    }

    #[test]
    fn dedup_heartbeat_readmits_unchanged_state() {
        let dir = tempdir().unwrap();
        // zero-second heartbeat: every observation qualifies as a heartbeat
        let generator = generator(&dir, false, 0);
        assert!(generator.should_submit("firewall_enabled", "pass"));
        assert!(generator.should_submit("firewall_enabled", "pass"));
    }

    #[test]
    fn dedup_is_per_check_type() {
        let dir = tempdir().unwrap();
        let generator = generator(&dir, false, 3600);
        assert!(generator.should_submit("a", "pass"));
        assert!(generator.should_submit("b", "pass"));
        assert!(!generator.should_submit("a", "pass"));
    }

    #[test]
    fn bundle_hash_excludes_nothing_but_is_chained() {
        let dir = tempdir().unwrap();
        let generator = generator(&dir, false, 0);

        let first = generator
            .build_bundle("nixos_generation", "pass", &json!({"generation": 42}), "h1", None, None)
            .unwrap()
            .unwrap();
        assert!(first.previous_bundle_hash.is_none());
        assert_eq!(first.bundle_hash.len(), 64);

        let second = generator
            .build_bundle("nixos_generation", "pass", &json!({"generation": 42}), "h1", None, None)
            .unwrap()
            .unwrap();
        assert_eq!(second.previous_bundle_hash.as_deref(), Some(first.bundle_hash.as_str()));

        // chains are per host
        let other_host = generator
            .build_bundle("nixos_generation", "pass", &json!({"generation": 42}), "h2", None, None)
            .unwrap()
            .unwrap();
        assert!(other_host.previous_bundle_hash.is_none());
    }

    #[test]
    fn signed_submission_verifies_over_exact_bytes() {
        // S6: agent_signature verifies against the exact signed_data bytes
        let dir = tempdir().unwrap();
        let generator = generator(&dir, true, 0);

        let bundle = generator
            .build_bundle("nixos_generation", "pass", &json!({"generation": 7}), "h1", None, None)
            .unwrap()
            .unwrap();
        let submission = generator
            .build_submission(&bundle, "h1", hipaa_control_for_check("nixos_generation"))
            .unwrap();

        let signed_data = submission.signed_data.unwrap();
        let signature = submission.agent_signature.unwrap();

        let key_path = dir.path().join("signing.key");
        let signer = Ed25519Signer::load(&key_path).unwrap();
        assert!(verify_signature(
            &signer.public_key_hex(),
            signed_data.as_bytes(),
            &signature
        ));
        assert!(!verify_signature(
            &signer.public_key_hex(),
            signed_data.replace("pass", "fail").as_bytes(),
            &signature
        ));

        // the payload carries the same signed_data and signature
        assert_eq!(submission.payload["signed_data"], json!(signed_data));
        assert_eq!(submission.payload["agent_signature"], json!(signature));
        // signed_data excludes the signature fields themselves
        assert!(!signed_data.contains("agent_signature"));
        // summary counted the check as compliant
        assert_eq!(submission.payload["summary"]["compliant"], 1);
        assert_eq!(submission.payload["summary"]["total_checks"], 1);
    }

    #[test]
    fn unsigned_submission_still_builds() {
        let dir = tempdir().unwrap();
        let generator = generator(&dir, false, 0);
        let bundle = generator
            .build_bundle("disk_usage", "fail", &json!({"usage_percent": 95}), "h1", None, None)
            .unwrap()
            .unwrap();
        let submission = generator.build_submission(&bundle, "h1", None).unwrap();
        assert!(submission.signed_data.is_none());
        assert!(submission.payload.get("agent_signature").is_none());
        assert_eq!(submission.payload["summary"]["non_compliant"], 1);
    }

    #[test]
    fn persists_under_dated_directory() {
        let dir = tempdir().unwrap();
        let generator = generator(&dir, false, 0);
        let bundle = generator
            .build_bundle("firewall_enabled", "pass", &json!({}), "h1", None, None)
            .unwrap()
            .unwrap();

        let path = generator.persist_local(&bundle, Some("deadbeef")).unwrap();
        assert!(path.exists());
        assert!(path.parent().unwrap().join("bundle.sig").exists());

        let now = Utc::now();
        let expected_prefix = dir
            .path()
            .join("evidence")
            .join(now.format("%Y").to_string())
            .join(now.format("%m").to_string())
            .join(now.format("%d").to_string());
        assert!(path.starts_with(expected_prefix));
    }
}
