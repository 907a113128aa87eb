//! Multi-source NTP time verification.
//!
//! Queries several NTP servers concurrently and checks the local clock
//! against their consensus before evidence is signed. Verification never
//! blocks evidence emission; a failed result is attached as an annotation.

use chrono::{DateTime, TimeZone, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default NTP servers (NIST, Google, Cloudflare, pool, Apple).
pub const DEFAULT_NTP_SERVERS: [&str; 5] = [
    "time.nist.gov",
    "time.google.com",
    "time.cloudflare.com",
    "pool.ntp.org",
    "time.apple.com",
];

/// NTPv3 client-mode request: LI=0, VN=3, Mode=3, rest zeroed.
const NTP_PACKET_HEADER: u8 = 0x1b;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_DELTA: f64 = 2_208_988_800.0;

/// Result from a single NTP server query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NtpServerResult {
    pub server: String,
    pub offset_ms: Option<f64>,
    pub round_trip_ms: Option<f64>,
    pub stratum: Option<u8>,
    pub success: bool,
    pub error: Option<String>,
}

/// Result of multi-source NTP verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NtpVerificationResult {
    pub passed: bool,
    pub local_time: DateTime<Utc>,
    pub servers_queried: usize,
    pub servers_responded: usize,
    pub median_offset_ms: Option<f64>,
    pub max_skew_ms: Option<f64>,
    pub min_stratum: Option<u8>,
    pub sources: Vec<NtpServerResult>,
    pub error: Option<String>,
}

/// Multi-source NTP verifier.
///
/// Passes iff at least `min_servers` responded, the median offset is within
/// `max_offset_ms`, and the spread between sources is within `max_skew_ms`.
pub struct NtpVerifier {
    servers: Vec<String>,
    min_servers: usize,
    max_offset_ms: f64,
    max_skew_ms: f64,
    timeout_secs: u64,
}

impl Default for NtpVerifier {
    fn default() -> Self {
        Self {
            servers: DEFAULT_NTP_SERVERS.iter().map(|s| s.to_string()).collect(),
            min_servers: 3,
            max_offset_ms: 5000.0,
            max_skew_ms: 5000.0,
            timeout_secs: 5,
        }
    }
}

impl NtpVerifier {
    pub fn new(servers: Vec<String>, min_servers: usize, max_offset_ms: f64, max_skew_ms: f64) -> Self {
        Self {
            servers,
            min_servers,
            max_offset_ms,
            max_skew_ms,
            timeout_secs: 5,
        }
    }

    pub async fn verify(&self) -> NtpVerificationResult {
        let mut result = NtpVerificationResult {
            passed: false,
            local_time: Utc::now(),
            servers_queried: self.servers.len(),
            servers_responded: 0,
            median_offset_ms: None,
            max_skew_ms: None,
            min_stratum: None,
            sources: Vec::new(),
            error: None,
        };

        let queries = self.servers.iter().map(|s| self.query_server(s.clone()));
        result.sources = join_all(queries).await;
        result.servers_responded = result.sources.iter().filter(|r| r.success).count();

        if result.servers_responded < self.min_servers {
            result.error = Some(format!(
                "Only {} of {} required servers responded",
                result.servers_responded, self.min_servers
            ));
            warn!(error = ?result.error, "NTP verification failed");
            return result;
        }

        let mut offsets: Vec<f64> = result
            .sources
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| r.offset_ms)
            .collect();
        if offsets.is_empty() {
            result.error = Some("No valid offsets received from NTP servers".to_string());
            warn!(error = ?result.error, "NTP verification failed");
            return result;
        }

        offsets.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = if offsets.len() % 2 == 1 {
            offsets[offsets.len() / 2]
        } else {
            (offsets[offsets.len() / 2 - 1] + offsets[offsets.len() / 2]) / 2.0
        };
        let skew = offsets[offsets.len() - 1] - offsets[0];
        result.median_offset_ms = Some(median);
        result.max_skew_ms = Some(skew);
        result.min_stratum = result
            .sources
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| r.stratum)
            .min();

        if median.abs() > self.max_offset_ms {
            result.error = Some(format!(
                "Local clock offset {:.1}ms exceeds threshold {:.0}ms",
                median, self.max_offset_ms
            ));
            warn!(error = ?result.error, "NTP verification failed");
            return result;
        }
        if skew > self.max_skew_ms {
            result.error = Some(format!(
                "NTP source skew {:.1}ms exceeds threshold {:.0}ms",
                skew, self.max_skew_ms
            ));
            warn!(error = ?result.error, "NTP verification failed");
            return result;
        }

        result.passed = true;
        info!(
            servers = result.servers_responded,
            median_offset_ms = median,
            max_skew_ms = skew,
            "NTP verification passed"
        );
        result
    }

    /// Query a single server with a raw NTPv3 packet over UDP.
    async fn query_server(&self, server: String) -> NtpServerResult {
        let mut result = NtpServerResult {
            server: server.clone(),
            offset_ms: None,
            round_trip_ms: None,
            stratum: None,
            success: false,
            error: None,
        };

        let query = async {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            // Bare hostnames default to the NTP port; an explicit port is honored
            if server.contains(':') {
                socket.connect(server.as_str()).await?;
            } else {
                socket.connect((server.as_str(), 123)).await?;
            }

            let mut packet = [0u8; 48];
            packet[0] = NTP_PACKET_HEADER;

            let t1 = Utc::now();
            socket.send(&packet).await?;

            let mut buf = [0u8; 48];
            let n = socket.recv(&mut buf).await?;
            let t4 = Utc::now();

            if n < 48 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "incomplete NTP response",
                ));
            }
            Ok::<_, std::io::Error>((buf, t1, t4))
        };

        match timeout(std::time::Duration::from_secs(self.timeout_secs), query).await {
            Ok(Ok((buf, t1, t4))) => {
                result.stratum = Some(buf[1]);

                // Transmit timestamp: 32-bit seconds + 32-bit fraction at bytes 40-48
                let seconds = u32::from_be_bytes([buf[40], buf[41], buf[42], buf[43]]) as f64;
                let fraction = u32::from_be_bytes([buf[44], buf[45], buf[46], buf[47]]) as f64;
                let t3 = seconds + fraction / 2f64.powi(32) - NTP_UNIX_DELTA;

                let t4_unix = t4.timestamp() as f64 + t4.timestamp_subsec_nanos() as f64 / 1e9;
                result.round_trip_ms =
                    Some((t4 - t1).num_microseconds().unwrap_or(0) as f64 / 1000.0);
                // Transmit-timestamp-only offset: positive = local clock behind
                result.offset_ms = Some((t3 - t4_unix) * 1000.0);
                result.success = true;
                debug!(
                    server = %result.server,
                    offset_ms = result.offset_ms,
                    rtt_ms = result.round_trip_ms,
                    stratum = result.stratum,
                    "NTP response"
                );
            }
            Ok(Err(e)) => {
                result.error = Some(e.to_string());
            }
            Err(_) => {
                result.error = Some("Timeout".to_string());
            }
        }

        result
    }
}

/// Convenience wrapper used by the evidence pipeline.
pub async fn verify_time_for_evidence() -> NtpVerificationResult {
    NtpVerifier::default().verify().await
}

/// Interpret an NTP transmit timestamp pair as a UTC datetime.
pub fn ntp_to_datetime(seconds: u32, fraction: u32) -> Option<DateTime<Utc>> {
    let unix = seconds as f64 + fraction as f64 / 2f64.powi(32) - NTP_UNIX_DELTA;
    Utc.timestamp_opt(unix as i64, ((unix.fract()) * 1e9) as u32).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_result(offset: f64) -> NtpServerResult {
        NtpServerResult {
            server: "test".into(),
            offset_ms: Some(offset),
            round_trip_ms: Some(10.0),
            stratum: Some(2),
            success: true,
            error: None,
        }
    }

    // Decision-rule checks run against a local mock responder so no external
    // network is needed.
    async fn run_mock_server(responses: usize, offset_secs: f64) -> String {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 48];
            for _ in 0..responses {
                let Ok((_, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let mut reply = [0u8; 48];
                reply[0] = 0x1c; // LI=0 VN=3 Mode=4 (server)
                reply[1] = 2; // stratum
                let now = Utc::now();
                let unix = now.timestamp() as f64
                    + now.timestamp_subsec_nanos() as f64 / 1e9
                    + offset_secs;
                let ntp = unix + NTP_UNIX_DELTA;
                let secs = ntp as u32;
                let frac = ((ntp - secs as f64) * 2f64.powi(32)) as u32;
                reply[40..44].copy_from_slice(&secs.to_be_bytes());
                reply[44..48].copy_from_slice(&frac.to_be_bytes());
                let _ = socket.send_to(&reply, peer).await;
            }
        });
        format!("127.0.0.1:{}", addr.port())
    }

    #[test]
    fn median_and_skew_math() {
        let mut offsets = [12.0, -3.0, 5.0];
        offsets.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(offsets[1], 5.0);
        assert_eq!(offsets[2] - offsets[0], 15.0);
        let _ = server_result(5.0);
    }

    #[tokio::test]
    async fn fails_when_too_few_servers() {
        // Unroutable servers: all queries fail, below min_servers
        let verifier = NtpVerifier::new(
            vec!["127.0.0.1:1".into()],
            3,
            5000.0,
            5000.0,
        );
        let result = verifier.verify().await;
        assert!(!result.passed);
        assert!(result.error.unwrap().contains("required servers"));
    }

    #[tokio::test]
    async fn passes_against_aligned_mock_servers() {
        let s1 = run_mock_server(1, 0.0).await;
        let s2 = run_mock_server(1, 0.1).await;
        let s3 = run_mock_server(1, -0.1).await;
        let verifier = NtpVerifier::new(vec![s1, s2, s3], 3, 5000.0, 5000.0);
        let result = verifier.verify().await;
        assert!(result.passed, "error: {:?}", result.error);
        assert_eq!(result.servers_responded, 3);
        assert!(result.median_offset_ms.unwrap().abs() < 5000.0);
    }

    #[tokio::test]
    async fn fails_on_large_offset() {
        let s1 = run_mock_server(1, 30.0).await;
        let s2 = run_mock_server(1, 30.0).await;
        let s3 = run_mock_server(1, 30.0).await;
        let verifier = NtpVerifier::new(vec![s1, s2, s3], 3, 5000.0, 5000.0);
        let result = verifier.verify().await;
        assert!(!result.passed);
        assert!(result.error.unwrap().contains("offset"));
    }
}
