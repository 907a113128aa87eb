//! Ed25519 evidence signing and canonical hashing.
//!
//! The signing key lives at `state_dir/signing.key` (32 raw bytes, hex-encoded,
//! mode 0600) and never leaves the process. Evidence payloads are serialized as
//! canonical JSON (sorted keys) so the signature covers a byte-stable document
//! that the control plane can re-derive and verify.

use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{ApplianceError, Result};

/// Compute hex-encoded SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Serialize a JSON value with sorted keys.
///
/// `serde_json::Map` is BTree-backed, so any `Value` built from maps
/// serializes with its keys in sorted order. Callers must go through `Value`
/// (never a struct with positional fields) when the bytes are signed.
pub fn canonical_json(value: &serde_json::Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Ensure a signing key exists at `path`, generating one if absent.
///
/// Returns `(was_generated, public_key_hex)`.
pub fn ensure_signing_key(path: &Path) -> Result<(bool, String)> {
    if path.exists() {
        let signer = Ed25519Signer::load(path)?;
        return Ok((false, signer.public_key_hex()));
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let key = SigningKey::generate(&mut OsRng);
    fs::write(path, hex::encode(key.to_bytes()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok((true, hex::encode(key.verifying_key().to_bytes())))
}

/// Ed25519 signer bound to the appliance identity key.
pub struct Ed25519Signer {
    key: SigningKey,
    key_path: PathBuf,
}

impl Ed25519Signer {
    /// Load the signing key from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let bytes = hex::decode(raw.trim())
            .map_err(|e| ApplianceError::Signing(format!("invalid key encoding: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ApplianceError::Signing("signing key must be 32 bytes".to_string()))?;

        Ok(Self {
            key: SigningKey::from_bytes(&bytes),
            key_path: path.to_path_buf(),
        })
    }

    /// Sign a message, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.key.sign(message).to_bytes()
    }

    /// Hex-encoded signature over `message`.
    pub fn sign_hex(&self, message: &[u8]) -> String {
        hex::encode(self.sign(message))
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }
}

/// Verify an Ed25519 signature against a hex-encoded public key.
pub fn verify_signature(public_key_hex: &str, message: &[u8], signature_hex: &str) -> bool {
    let key_bytes = match hex::decode(public_key_hex) {
        Ok(b) => b,
        Err(_) => return false,
    };
    let key_bytes: [u8; 32] = match key_bytes.try_into() {
        Ok(b) => b,
        Err(_) => return false,
    };
    let key = match VerifyingKey::from_bytes(&key_bytes) {
        Ok(k) => k,
        Err(_) => return false,
    };
    let sig_bytes = match hex::decode(signature_hex) {
        Ok(b) => b,
        Err(_) => return false,
    };
    let sig_bytes: [u8; 64] = match sig_bytes.try_into() {
        Ok(b) => b,
        Err(_) => return false,
    };
    key.verify(message, &Signature::from_bytes(&sig_bytes)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn key_bootstrap_generates_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("signing.key");

        let (generated, pk1) = ensure_signing_key(&path).unwrap();
        assert!(generated);

        let (generated, pk2) = ensure_signing_key(&path).unwrap();
        assert!(!generated);
        assert_eq!(pk1, pk2);
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("signing.key");
        ensure_signing_key(&path).unwrap();

        let signer = Ed25519Signer::load(&path).unwrap();
        let message = b"{\"checked_at\":\"2025-01-01T00:00:00Z\"}";
        let sig = signer.sign_hex(message);

        assert!(verify_signature(&signer.public_key_hex(), message, &sig));
        assert!(!verify_signature(&signer.public_key_hex(), b"tampered", &sig));
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let value = json!({"zulu": 1, "alpha": {"m": 2, "a": 1}});
        let s = canonical_json(&value).unwrap();
        assert_eq!(s, r#"{"alpha":{"a":1,"m":2},"zulu":1}"#);
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
