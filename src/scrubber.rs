//! PHI/PII pattern scrubber.
//!
//! Redacts protected health information from any payload crossing the
//! appliance boundary (control plane, cloud LLM). Infrastructure categories
//! (IP addresses) can be excluded where that data is intentionally shared.

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::crypto::sha256_hex;

/// One redaction category: detection pattern plus replacement token.
struct PhiPattern {
    name: &'static str,
    regex: Regex,
    replacement: &'static str,
}

fn patterns() -> &'static Vec<PhiPattern> {
    static PATTERNS: OnceLock<Vec<PhiPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            PhiPattern {
                name: "ssn",
                regex: Regex::new(r"\b(\d{3}[-\s]?\d{2}[-\s]?\d{4})\b").unwrap(),
                replacement: "[SSN-REDACTED]",
            },
            PhiPattern {
                name: "mrn",
                regex: Regex::new(r"(?i)\b(MRN\s*[:=#]?\s*\d{4,12})\b").unwrap(),
                replacement: "[MRN-REDACTED]",
            },
            PhiPattern {
                name: "patient_id",
                regex: Regex::new(r"(?i)\b(patient[_\s]?id\s*[:=#]?\s*[\w\d-]{4,20})\b").unwrap(),
                replacement: "[PATIENT-ID-REDACTED]",
            },
            PhiPattern {
                name: "phone",
                regex: Regex::new(r"\b(\+?1?[-.\s]?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4})\b").unwrap(),
                replacement: "[PHONE-REDACTED]",
            },
            PhiPattern {
                name: "email",
                regex: Regex::new(r"\b([a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,})\b").unwrap(),
                replacement: "[EMAIL-REDACTED]",
            },
            PhiPattern {
                name: "credit_card",
                regex: Regex::new(r"\b(\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4})\b").unwrap(),
                replacement: "[CC-REDACTED]",
            },
            PhiPattern {
                name: "dob",
                regex: Regex::new(
                    r"(?i)\b(DOB\s*[:=]?\s*\d{1,2}[-/]\d{1,2}[-/]\d{2,4}|birth\s*date\s*[:=]?\s*\d{1,2}[-/]\d{1,2}[-/]\d{2,4})\b",
                )
                .unwrap(),
                replacement: "[DOB-REDACTED]",
            },
            PhiPattern {
                name: "address",
                regex: Regex::new(
                    r"(?i)\b(\d{1,5}\s+[\w\s]{1,30}\s+(?:street|st|avenue|ave|road|rd|boulevard|blvd|drive|dr|lane|ln|court|ct|place|pl|way|circle|cir)(?:\s*[,.]?\s*(?:apt|apartment|suite|ste|unit|#)\s*[\w\d-]+)?)\b",
                )
                .unwrap(),
                replacement: "[ADDRESS-REDACTED]",
            },
            PhiPattern {
                name: "zip",
                regex: Regex::new(r"\b(\d{5}(?:-\d{4})?)\b").unwrap(),
                replacement: "[ZIP-REDACTED]",
            },
            PhiPattern {
                name: "ip_address",
                regex: Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\b").unwrap(),
                replacement: "[IP-REDACTED]",
            },
            PhiPattern {
                name: "account_number",
                regex: Regex::new(r"(?i)\b(account\s*(?:number|num|no|#)?\s*[:=]?\s*[\w\d-]{6,20})\b")
                    .unwrap(),
                replacement: "[ACCOUNT-REDACTED]",
            },
            PhiPattern {
                name: "insurance_id",
                regex: Regex::new(r"(?i)\b(insurance\s*(?:id|#|number)?\s*[:=]?\s*[\w\d-]{6,20})\b")
                    .unwrap(),
                replacement: "[INSURANCE-ID-REDACTED]",
            },
            PhiPattern {
                name: "medicare",
                regex: Regex::new(r"(?i)\b(medicare\s*(?:id|#|number)?\s*[:=]?\s*[\w\d-]{8,15})\b")
                    .unwrap(),
                replacement: "[MEDICARE-REDACTED]",
            },
            PhiPattern {
                name: "drivers_license",
                regex: Regex::new(r"(?i)\b(DL\s*[:=#]?\s*[\w\d]{6,15})\b").unwrap(),
                replacement: "[DL-REDACTED]",
            },
        ]
    })
}

/// Result of a scrubbing operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrubResult {
    pub patterns_matched: usize,
    pub patterns_by_type: BTreeMap<String, usize>,
    pub phi_scrubbed: bool,
}

impl ScrubResult {
    fn merge(&mut self, other: &ScrubResult) {
        self.patterns_matched += other.patterns_matched;
        for (k, v) in &other.patterns_by_type {
            *self.patterns_by_type.entry(k.clone()).or_insert(0) += v;
        }
        self.phi_scrubbed |= other.phi_scrubbed;
    }
}

/// Regex + structured PHI redaction.
#[derive(Clone)]
pub struct PhiScrubber {
    /// Append an 8-hex SHA-256 suffix so redacted values stay correlatable
    hash_redacted: bool,
    exclude_categories: HashSet<String>,
}

impl PhiScrubber {
    pub fn new(hash_redacted: bool, exclude_categories: &[&str]) -> Self {
        Self {
            hash_redacted,
            exclude_categories: exclude_categories.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Scrubber used for payloads leaving the appliance. IP addresses are
    /// infrastructure data intentionally shared with the control plane.
    pub fn outbound() -> Self {
        Self::new(true, &["ip_address"])
    }

    pub fn scrub(&self, text: &str) -> (String, ScrubResult) {
        let mut scrubbed = text.to_string();
        let mut result = ScrubResult::default();

        for pattern in patterns() {
            if self.exclude_categories.contains(pattern.name) {
                continue;
            }
            let count = pattern.regex.find_iter(&scrubbed).count();
            if count == 0 {
                continue;
            }
            result.patterns_matched += count;
            result.patterns_by_type.insert(pattern.name.to_string(), count);
            result.phi_scrubbed = true;

            if self.hash_redacted {
                scrubbed = pattern
                    .regex
                    .replace_all(&scrubbed, |caps: &regex::Captures<'_>| {
                        let suffix = &sha256_hex(caps[0].as_bytes())[..8];
                        let base = pattern.replacement.trim_end_matches(']');
                        format!("{}-{}]", base, suffix)
                    })
                    .into_owned();
            } else {
                scrubbed = pattern
                    .regex
                    .replace_all(&scrubbed, pattern.replacement)
                    .into_owned();
            }
        }

        (scrubbed, result)
    }

    /// Recursively scrub all string values (and keys' values) in a JSON value.
    pub fn scrub_value(&self, value: &serde_json::Value) -> (serde_json::Value, ScrubResult) {
        let mut total = ScrubResult::default();
        let scrubbed = self.scrub_value_inner(value, &mut total);
        (scrubbed, total)
    }

    fn scrub_value_inner(
        &self,
        value: &serde_json::Value,
        total: &mut ScrubResult,
    ) -> serde_json::Value {
        match value {
            serde_json::Value::String(s) => {
                let (scrubbed, result) = self.scrub(s);
                total.merge(&result);
                serde_json::Value::String(scrubbed)
            }
            serde_json::Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.scrub_value_inner(v, total));
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(items) => serde_json::Value::Array(
                items.iter().map(|v| self.scrub_value_inner(v, total)).collect(),
            ),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scrubs_ssn_and_email() {
        let scrubber = PhiScrubber::new(false, &[]);
        let (out, result) = scrubber.scrub("patient SSN 123-45-6789 email bob@clinic.example.com");
        assert!(out.contains("[SSN-REDACTED]"));
        assert!(out.contains("[EMAIL-REDACTED]"));
        assert!(result.phi_scrubbed);
        assert!(result.patterns_by_type.contains_key("ssn"));
    }

    #[test]
    fn outbound_preserves_ip_addresses() {
        let scrubber = PhiScrubber::outbound();
        let (out, result) = scrubber.scrub("host 192.168.1.10 unreachable");
        assert!(out.contains("192.168.1.10"));
        assert!(!result.patterns_by_type.contains_key("ip_address"));
    }

    #[test]
    fn hash_redaction_is_correlatable() {
        let scrubber = PhiScrubber::new(true, &[]);
        let (a, _) = scrubber.scrub("MRN: 123456");
        let (b, _) = scrubber.scrub("MRN: 123456");
        let (c, _) = scrubber.scrub("MRN: 654321");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("[MRN-REDACTED-"));
    }

    #[test]
    fn scrub_value_walks_nested_structures() {
        let scrubber = PhiScrubber::new(false, &[]);
        let value = json!({
            "details": {"note": "DOB: 01/02/1980"},
            "list": ["patient_id: ABC-1234", 42]
        });
        let (scrubbed, result) = scrubber.scrub_value(&value);
        assert!(scrubbed["details"]["note"].as_str().unwrap().contains("[DOB-REDACTED]"));
        assert!(scrubbed["list"][0].as_str().unwrap().contains("[PATIENT-ID-REDACTED]"));
        assert_eq!(scrubbed["list"][1], 42);
        assert!(result.patterns_matched >= 2);
    }

    #[test]
    fn clean_text_untouched() {
        let scrubber = PhiScrubber::new(false, &[]);
        let (out, result) = scrubber.scrub("service nginx restarted");
        assert_eq!(out, "service nginx restarted");
        assert!(!result.phi_scrubbed);
    }
}
