//! Proof server client.
//!
//! Talks to an external proof server over HTTP: push zk-inputs, poll status,
//! fetch the proof once it is ready. Big integers cross the wire as decimal
//! strings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::ZkInputs;

/// Serde helpers for big integers encoded as decimal strings.
pub mod decimals {
    use num_bigint::BigUint;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(s: &str) -> Option<BigUint> {
        BigUint::parse_bytes(s.as_bytes(), 10)
    }

    pub fn serialize<S: Serializer>(v: &[BigUint], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(v.iter().map(|n| n.to_str_radix(10)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<BigUint>, D::Error> {
        let raw = Vec::<String>::deserialize(d)?;
        raw.iter()
            .map(|s| parse(s).ok_or_else(|| D::Error::custom(format!("invalid decimal: {s}"))))
            .collect()
    }
}

/// Serde helpers for matrices of decimal-string big integers.
pub mod decimal_matrix {
    use num_bigint::BigUint;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[Vec<BigUint>], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(
            v.iter()
                .map(|row| row.iter().map(|n| n.to_str_radix(10)).collect::<Vec<_>>()),
        )
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<BigUint>>, D::Error> {
        let raw = Vec::<Vec<String>>::deserialize(d)?;
        raw.iter()
            .map(|row| {
                row.iter()
                    .map(|s| {
                        super::decimals::parse(s)
                            .ok_or_else(|| D::Error::custom(format!("invalid decimal: {s}")))
                    })
                    .collect()
            })
            .collect()
    }
}

/// A Groth16-shaped proof as returned by the proof server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Proof {
    #[serde(rename = "pi_a", with = "decimals")]
    pub pi_a: Vec<BigUint>,
    #[serde(rename = "pi_b", with = "decimal_matrix")]
    pub pi_b: Vec<Vec<BigUint>>,
    #[serde(rename = "pi_c", with = "decimals")]
    pub pi_c: Vec<BigUint>,
    #[serde(default)]
    pub protocol: String,
}

impl Proof {
    /// Checks the projective tail coordinates the server must emit:
    /// `pi_a[2] == 1`, `pi_b[2] == [1, 0]`, `pi_c[2] == 1`.
    pub fn validate(&self) -> Result<()> {
        let one = BigUint::from(1u8);
        let zero = BigUint::from(0u8);
        if self.pi_a.len() != 3 || self.pi_a[2] != one {
            bail!("invalid proof: pi_a last coordinate is not 1");
        }
        if self.pi_b.len() != 3 || self.pi_b[2] != vec![one.clone(), zero] {
            bail!("invalid proof: pi_b last row is not [1, 0]");
        }
        if self.pi_c.len() != 3 || self.pi_c[2] != one {
            bail!("invalid proof: pi_c last coordinate is not 1");
        }
        Ok(())
    }
}

/// Public inputs that accompany a proof.
pub type PublicInputs = Vec<BigUint>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCode {
    Aborted,
    Busy,
    Failed,
    Success,
    Unverified,
    Uninitialized,
    Undefined,
    Initializing,
    Ready,
}

impl StatusCode {
    /// The server can accept new inputs.
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            Self::Aborted | Self::Failed | Self::Success | Self::Unverified | Self::Ready
        )
    }

    /// The server has finished initializing.
    pub fn is_initialized(&self) -> bool {
        !matches!(self, Self::Uninitialized | Self::Undefined | Self::Initializing)
    }
}

/// Response of the proof server's status endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ProverStatus {
    pub status: StatusCode,
    #[serde(default)]
    pub proof: String,
    #[serde(default, rename = "pubData")]
    pub pub_data: String,
}

/// Client of one proof server.
#[async_trait]
pub trait ProverClient: Send + Sync {
    /// Blocks until the server can accept new inputs.
    async fn wait_ready(&self) -> Result<()>;
    /// Starts a proof computation over the given inputs.
    async fn calculate_proof(&self, zk_inputs: &ZkInputs) -> Result<()>;
    /// Blocks until the running computation completes and returns its proof.
    async fn get_proof(&self) -> Result<(Proof, PublicInputs)>;
    /// Aborts the running computation.
    async fn cancel(&self) -> Result<()>;
    fn url(&self) -> &str;
}

/// HTTP implementation of [`ProverClient`].
pub struct HttpProverClient {
    url: String,
    client: reqwest::Client,
    poll_interval: Duration,
}

impl HttpProverClient {
    pub fn new(url: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            poll_interval,
        }
    }

    async fn status(&self) -> Result<ProverStatus> {
        let resp = self
            .client
            .get(format!("{}/status", self.url))
            .send()
            .await
            .with_context(|| format!("prover {} status request failed", self.url))?
            .error_for_status()
            .with_context(|| format!("prover {} status error", self.url))?;
        resp.json()
            .await
            .with_context(|| format!("prover {} returned invalid status", self.url))
    }
}

#[async_trait]
impl ProverClient for HttpProverClient {
    async fn wait_ready(&self) -> Result<()> {
        loop {
            let status = self.status().await?;
            if !status.status.is_initialized() {
                bail!("prover {} is not initialized", self.url);
            }
            if status.status.is_ready() {
                return Ok(());
            }
            debug!(url = %self.url, status = ?status.status, "waiting for prover");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn calculate_proof(&self, zk_inputs: &ZkInputs) -> Result<()> {
        self.client
            .post(format!("{}/input", self.url))
            .json(zk_inputs)
            .send()
            .await
            .with_context(|| format!("prover {} input request failed", self.url))?
            .error_for_status()
            .with_context(|| format!("prover {} rejected inputs", self.url))?;
        Ok(())
    }

    async fn get_proof(&self) -> Result<(Proof, PublicInputs)> {
        self.wait_ready().await?;
        let status = self.status().await?;
        if status.status != StatusCode::Success {
            return Err(anyhow!(
                "prover {} finished with status {:?}",
                self.url,
                status.status
            ));
        }
        let proof: Proof = serde_json::from_str(&status.proof)
            .with_context(|| format!("prover {} returned invalid proof", self.url))?;
        proof.validate()?;
        let raw: Vec<String> = serde_json::from_str(&status.pub_data)
            .with_context(|| format!("prover {} returned invalid public inputs", self.url))?;
        let public_inputs = raw
            .iter()
            .map(|s| decimals::parse(s).ok_or_else(|| anyhow!("invalid decimal: {s}")))
            .collect::<Result<Vec<_>>>()?;
        Ok((proof, public_inputs))
    }

    async fn cancel(&self) -> Result<()> {
        self.client
            .post(format!("{}/cancel", self.url))
            .send()
            .await
            .with_context(|| format!("prover {} cancel request failed", self.url))?
            .error_for_status()
            .with_context(|| format!("prover {} cancel error", self.url))?;
        Ok(())
    }

    fn url(&self) -> &str {
        &self.url
    }
}

/// Deterministic in-process prover for tests and local runs.
pub struct MockProverClient {
    url: String,
    counter: AtomicU64,
    pub delay: Duration,
}

impl MockProverClient {
    pub fn new(url: impl Into<String>, delay: Duration) -> Self {
        Self {
            url: url.into(),
            counter: AtomicU64::new(0),
            delay,
        }
    }
}

#[async_trait]
impl ProverClient for MockProverClient {
    async fn wait_ready(&self) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }

    async fn calculate_proof(&self, _zk_inputs: &ZkInputs) -> Result<()> {
        Ok(())
    }

    async fn get_proof(&self) -> Result<(Proof, PublicInputs)> {
        tokio::time::sleep(self.delay).await;
        let i = self.counter.fetch_add(1, Ordering::SeqCst) * 100;
        let big = |n: u64| BigUint::from(n);
        let proof = Proof {
            pi_a: vec![big(i), big(i + 1), big(1)],
            pi_b: vec![
                vec![big(i + 2), big(i + 3)],
                vec![big(i + 4), big(i + 5)],
                vec![big(1), big(0)],
            ],
            pi_c: vec![big(i + 6), big(i + 7), big(1)],
            protocol: "groth".into(),
        };
        Ok((proof, vec![big(i + 42)]))
    }

    async fn cancel(&self) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(80)).await;
        Ok(())
    }

    fn url(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proof_decimal_round_trip() {
        let json = r#"{
            "pi_a": ["123456789012345678901234567890", "2", "1"],
            "pi_b": [["3", "4"], ["5", "6"], ["1", "0"]],
            "pi_c": ["7", "8", "1"],
            "protocol": "groth"
        }"#;
        let proof: Proof = serde_json::from_str(json).unwrap();
        proof.validate().unwrap();
        assert_eq!(
            proof.pi_a[0].to_str_radix(10),
            "123456789012345678901234567890"
        );
        let back = serde_json::to_string(&proof).unwrap();
        assert!(back.contains("\"123456789012345678901234567890\""));
    }

    #[test]
    fn test_proof_validation_rejects_bad_tail() {
        let json = r#"{
            "pi_a": ["1", "2", "9"],
            "pi_b": [["3", "4"], ["5", "6"], ["1", "0"]],
            "pi_c": ["7", "8", "1"],
            "protocol": "groth"
        }"#;
        let proof: Proof = serde_json::from_str(json).unwrap();
        assert!(proof.validate().is_err());
    }

    #[test]
    fn test_status_codes() {
        let s: StatusCode = serde_json::from_str("\"initializing\"").unwrap();
        assert!(!s.is_initialized());
        assert!(!s.is_ready());
        let s: StatusCode = serde_json::from_str("\"busy\"").unwrap();
        assert!(s.is_initialized());
        assert!(!s.is_ready());
        let s: StatusCode = serde_json::from_str("\"success\"").unwrap();
        assert!(s.is_ready());
    }

    #[tokio::test]
    async fn test_mock_prover_sequence() {
        let prover = MockProverClient::new("mock://0", Duration::from_millis(1));
        let (p1, pub1) = prover.get_proof().await.unwrap();
        p1.validate().unwrap();
        assert_eq!(pub1, vec![BigUint::from(42u64)]);
        let (p2, _) = prover.get_proof().await.unwrap();
        assert_eq!(p2.pi_a[0], BigUint::from(100u64));
    }
}
