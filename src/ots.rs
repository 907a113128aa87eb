//! OpenTimestamps blockchain anchoring for evidence bundles.
//!
//! Submits SHA-256 bundle hashes to OTS calendar servers and tracks the
//! proof lifecycle: pending -> anchored (Bitcoin attestation present) ->
//! verified, or failed. Proofs are persisted under `state_dir/ots/`.
//!
//! Bitcoin attestation parsing is limited to marker detection and block
//! height extraction; full merkle-path verification is deferred to a
//! reference implementation.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{ApplianceError, Result};

/// OTS calendar servers, in priority order.
pub const OTS_CALENDARS: [&str; 4] = [
    "https://a.pool.opentimestamps.org",
    "https://b.pool.opentimestamps.org",
    "https://alice.btc.calendar.opentimestamps.org",
    "https://bob.btc.calendar.opentimestamps.org",
];

/// Marker bytes preceding a Bitcoin block attestation in an OTS proof.
const BITCOIN_ATTESTATION_MARKER: [u8; 8] = [0x05, 0x88, 0x96, 0x0d, 0x73, 0xd7, 0x19, 0x01];

/// Proof lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtsStatus {
    Pending,
    Anchored,
    Verified,
    Failed,
}

/// An OpenTimestamps proof for an evidence bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtsProof {
    pub bundle_hash: String,
    pub bundle_id: String,
    /// Base64-encoded raw proof bytes
    pub proof_data: String,
    pub calendar_url: String,
    pub submitted_at: DateTime<Utc>,
    pub bitcoin_block: Option<u64>,
    pub anchored_at: Option<DateTime<Utc>>,
    pub status: OtsStatus,
    pub error: Option<String>,
}

/// Configuration for the OTS client.
#[derive(Debug, Clone)]
pub struct OtsConfig {
    pub enabled: bool,
    pub calendars: Vec<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub proof_dir: Option<PathBuf>,
}

impl Default for OtsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            calendars: OTS_CALENDARS.iter().map(|s| s.to_string()).collect(),
            timeout_secs: 30,
            max_retries: 2,
            proof_dir: None,
        }
    }
}

/// OpenTimestamps client for evidence anchoring.
pub struct OtsClient {
    config: OtsConfig,
    http: reqwest::Client,
    pending: Mutex<HashMap<String, OtsProof>>,
}

impl OtsClient {
    pub fn new(config: OtsConfig) -> Result<Self> {
        if let Some(dir) = &config.proof_dir {
            std::fs::create_dir_all(dir)?;
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .user_agent("OsirisCare-Compliance-Appliance/1.0")
            .build()
            .map_err(|e| ApplianceError::Config(e.to_string()))?;
        Ok(Self {
            config,
            http,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Submit a bundle hash to the calendars, first success wins.
    pub async fn submit_hash(&self, bundle_hash: &str, bundle_id: &str) -> Option<OtsProof> {
        if !self.config.enabled {
            debug!("OTS disabled, skipping hash submission");
            return None;
        }
        if bundle_hash.len() != 64 {
            error!(len = bundle_hash.len(), "invalid bundle hash length");
            return None;
        }
        let hash_bytes = match hex::decode(bundle_hash) {
            Ok(b) => b,
            Err(_) => {
                error!("invalid hex bundle hash");
                return None;
            }
        };

        for calendar in &self.config.calendars {
            for attempt in 0..=self.config.max_retries {
                match self.submit_to_calendar(calendar, &hash_bytes, bundle_id).await {
                    Ok(Some(proof)) => {
                        self.pending.lock().insert(bundle_id.to_string(), proof.clone());
                        if self.config.proof_dir.is_some() {
                            if let Err(e) = self.save_proof(&proof) {
                                warn!(error = %e, "failed to save OTS proof");
                            }
                        }
                        info!(bundle_id, calendar = %calendar, "OTS hash submitted");
                        return Some(proof);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(calendar = %calendar, attempt, error = %e, "OTS submission attempt failed");
                    }
                }
                if attempt < self.config.max_retries {
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
            }
        }

        error!(bundle_id, "OTS submission failed for all calendars");
        None
    }

    async fn submit_to_calendar(
        &self,
        calendar_url: &str,
        hash_bytes: &[u8],
        bundle_id: &str,
    ) -> Result<Option<OtsProof>> {
        let url = format!("{}/digest", calendar_url);
        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Accept", "application/vnd.opentimestamps.v1")
            .body(hash_bytes.to_vec())
            .send()
            .await?;

        match response.status().as_u16() {
            200 => {
                let proof_bytes = response.bytes().await?;
                if let Err(reason) = validate_proof(&proof_bytes, hash_bytes) {
                    warn!(calendar_url, reason, "calendar returned invalid proof");
                    return Ok(None);
                }
                debug!(len = proof_bytes.len(), calendar_url, "OTS proof validated");
                Ok(Some(OtsProof {
                    bundle_hash: hex::encode(hash_bytes),
                    bundle_id: bundle_id.to_string(),
                    proof_data: base64::engine::general_purpose::STANDARD.encode(&proof_bytes),
                    calendar_url: calendar_url.to_string(),
                    submitted_at: Utc::now(),
                    bitcoin_block: None,
                    anchored_at: None,
                    status: OtsStatus::Pending,
                    error: None,
                }))
            }
            400 => {
                warn!(calendar_url, "OTS bad request");
                Ok(None)
            }
            503 => {
                warn!(calendar_url, "OTS calendar busy");
                Ok(None)
            }
            status => {
                warn!(calendar_url, status, "OTS unexpected status");
                Ok(None)
            }
        }
    }

    /// Attempt to upgrade a pending proof with a Bitcoin attestation.
    pub async fn upgrade_proof(&self, mut proof: OtsProof) -> OtsProof {
        if proof.status != OtsStatus::Pending {
            return proof;
        }

        let url = format!("{}/timestamp/{}", proof.calendar_url, proof.bundle_hash);
        match self.http.get(&url).send().await {
            Ok(response) if response.status().as_u16() == 200 => {
                match response.bytes().await {
                    Ok(upgraded) => {
                        if has_bitcoin_attestation(&upgraded) {
                            proof.proof_data =
                                base64::engine::general_purpose::STANDARD.encode(&upgraded);
                            proof.status = OtsStatus::Anchored;
                            proof.anchored_at = Some(Utc::now());
                            proof.bitcoin_block = extract_block_height(&upgraded);
                            info!(
                                bundle_id = %proof.bundle_id,
                                block = proof.bitcoin_block,
                                "OTS proof anchored"
                            );
                            if self.config.proof_dir.is_some() {
                                if let Err(e) = self.save_proof(&proof) {
                                    warn!(error = %e, "failed to update OTS proof on disk");
                                }
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "OTS upgrade read failed"),
                }
            }
            Ok(response) if response.status().as_u16() == 404 => {
                debug!(bundle_id = %proof.bundle_id, "OTS proof still pending");
            }
            Ok(response) => {
                warn!(status = response.status().as_u16(), "OTS upgrade status");
            }
            Err(e) => warn!(error = %e, "OTS upgrade failed"),
        }

        proof
    }

    /// Upgrade every cached pending proof. Returns (checked, upgraded, pending).
    pub async fn upgrade_all_pending(&self) -> (usize, usize, usize) {
        let snapshot: Vec<OtsProof> = self.pending.lock().values().cloned().collect();
        let mut upgraded = 0;
        let mut still_pending = 0;

        for proof in snapshot {
            let updated = self.upgrade_proof(proof).await;
            if updated.status == OtsStatus::Anchored {
                upgraded += 1;
                self.pending.lock().remove(&updated.bundle_id);
            } else {
                still_pending += 1;
                self.pending.lock().insert(updated.bundle_id.clone(), updated);
            }
        }

        (upgraded + still_pending, upgraded, still_pending)
    }

    /// Verify a proof's current status.
    pub fn verify_proof(&self, proof: &OtsProof) -> (bool, String) {
        match proof.status {
            OtsStatus::Pending => (true, "Proof pending Bitcoin confirmation".to_string()),
            OtsStatus::Failed => (
                false,
                format!("Proof failed: {}", proof.error.as_deref().unwrap_or("unknown")),
            ),
            OtsStatus::Anchored | OtsStatus::Verified => (
                true,
                format!(
                    "Proof anchored in Bitcoin block {}",
                    proof.bitcoin_block.map(|b| b.to_string()).unwrap_or_else(|| "?".into())
                ),
            ),
        }
    }

    fn save_proof(&self, proof: &OtsProof) -> Result<()> {
        let Some(dir) = &self.config.proof_dir else {
            return Ok(());
        };
        let path = dir.join(format!("{}.ots.json", proof.bundle_id));
        std::fs::write(path, serde_json::to_string_pretty(proof)?)?;
        Ok(())
    }

    /// Load pending proofs from disk into the in-memory cache.
    pub fn load_pending_proofs(&self) -> Result<usize> {
        let Some(dir) = &self.config.proof_dir else {
            return Ok(0);
        };
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".ots.json") {
                continue;
            }
            match std::fs::read_to_string(entry.path())
                .map_err(ApplianceError::from)
                .and_then(|s| serde_json::from_str::<OtsProof>(&s).map_err(ApplianceError::from))
            {
                Ok(proof) if proof.status == OtsStatus::Pending => {
                    self.pending.lock().insert(proof.bundle_id.clone(), proof);
                    loaded += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(file = %name, error = %e, "failed to load OTS proof"),
            }
        }
        info!(loaded, "loaded pending OTS proofs");
        Ok(loaded)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Sanity-check a calendar response before accepting it as a proof.
fn validate_proof(proof_bytes: &[u8], expected_hash: &[u8]) -> std::result::Result<(), &'static str> {
    if proof_bytes.len() < 50 {
        return Err("proof too short");
    }
    if !proof_bytes.windows(expected_hash.len()).any(|w| w == expected_hash) {
        return Err("proof does not contain submitted hash");
    }
    // Known OTS operation codes: attestation, SHA256, append, prepend
    let valid_opcodes = [0x00u8, 0x08, 0xf0, 0xf1, 0x02, 0x03];
    if !proof_bytes.iter().take(20).any(|b| valid_opcodes.contains(b)) {
        return Err("proof does not contain valid OTS opcodes");
    }
    Ok(())
}

fn has_bitcoin_attestation(proof_bytes: &[u8]) -> bool {
    proof_bytes
        .windows(BITCOIN_ATTESTATION_MARKER.len())
        .any(|w| w == BITCOIN_ATTESTATION_MARKER)
}

/// Extract the little-endian block height that follows the attestation marker.
fn extract_block_height(proof_bytes: &[u8]) -> Option<u64> {
    let pos = proof_bytes
        .windows(BITCOIN_ATTESTATION_MARKER.len())
        .position(|w| w == BITCOIN_ATTESTATION_MARKER)?;
    let start = pos + BITCOIN_ATTESTATION_MARKER.len();
    if start + 8 > proof_bytes.len() {
        return None;
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&proof_bytes[start..start + 8]);
    Some(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_proof_structure() {
        let hash = [0xaau8; 32];
        let mut proof = vec![0x08u8];
        proof.extend_from_slice(&hash);
        proof.extend_from_slice(&[0x00; 40]);
        assert!(validate_proof(&proof, &hash).is_ok());

        assert_eq!(validate_proof(&[0u8; 10], &hash), Err("proof too short"));

        let other = vec![0x08u8; 80];
        assert_eq!(
            validate_proof(&other, &hash),
            Err("proof does not contain submitted hash")
        );
    }

    #[test]
    fn detects_bitcoin_attestation_and_height() {
        let mut proof = vec![0u8; 16];
        proof.extend_from_slice(&BITCOIN_ATTESTATION_MARKER);
        proof.extend_from_slice(&880_123u64.to_le_bytes());
        assert!(has_bitcoin_attestation(&proof));
        assert_eq!(extract_block_height(&proof), Some(880_123));

        let plain = vec![0u8; 64];
        assert!(!has_bitcoin_attestation(&plain));
        assert_eq!(extract_block_height(&plain), None);
    }

    #[test]
    fn proof_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let client = OtsClient::new(OtsConfig {
            proof_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();

        let proof = OtsProof {
            bundle_hash: "ab".repeat(32),
            bundle_id: "EB-TEST-0001".into(),
            proof_data: "AAAA".into(),
            calendar_url: "https://a.pool.opentimestamps.org".into(),
            submitted_at: Utc::now(),
            bitcoin_block: None,
            anchored_at: None,
            status: OtsStatus::Pending,
            error: None,
        };
        client.save_proof(&proof).unwrap();

        let loaded = client.load_pending_proofs().unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(client.pending_count(), 1);
    }

    #[test]
    fn verify_reflects_status() {
        let client = OtsClient::new(OtsConfig {
            enabled: false,
            ..Default::default()
        })
        .unwrap();
        let mut proof = OtsProof {
            bundle_hash: "ab".repeat(32),
            bundle_id: "EB".into(),
            proof_data: String::new(),
            calendar_url: String::new(),
            submitted_at: Utc::now(),
            bitcoin_block: Some(880_000),
            anchored_at: Some(Utc::now()),
            status: OtsStatus::Anchored,
            error: None,
        };
        assert!(client.verify_proof(&proof).0);
        proof.status = OtsStatus::Failed;
        proof.error = Some("boom".into());
        assert!(!client.verify_proof(&proof).0);
    }
}
