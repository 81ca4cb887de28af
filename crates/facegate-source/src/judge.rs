//! Remote judge backend — delegates validation and 1:1 comparison to a
//! multimodal vision service over HTTPS.
//!
//! The judge never exposes a raw distance; it answers with a boolean
//! match and a qualitative confidence tier. The service is treated as
//! untrusted and unreliable: timeouts, transport failures, unexpected
//! statuses, and malformed bodies all surface as errors that the gate
//! resolves to denial.

use async_trait::async_trait;
use facegate_core::{Tier, Verdict};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Artifact, Capture, DescriptorSource, SourceError};

const METHOD: &str = "judge-1to1";

#[derive(Debug, Clone)]
pub struct JudgeConfig {
    /// Base URL of the judge service, e.g. `https://judge.example.com`.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

pub struct JudgeSource {
    client: reqwest::Client,
    cfg: JudgeConfig,
}

#[derive(Serialize)]
struct JudgeRequest<'a> {
    model: &'a str,
    task: &'a str,
    /// Base64-encoded JPEG payloads. For `compare`, the live capture
    /// comes first, the enrolled reference second.
    images: Vec<String>,
}

#[derive(Deserialize)]
struct ValidateResponse {
    #[serde(default)]
    is_valid: bool,
    #[serde(default)]
    reason: String,
}

/// Missing fields deserialize to their deny-side defaults; a judge that
/// answers without `matched` or `face_detected` has denied.
#[derive(Deserialize)]
struct CompareResponse {
    #[serde(default)]
    matched: bool,
    #[serde(default)]
    face_detected: bool,
    confidence: Option<String>,
}

impl JudgeSource {
    pub fn new(cfg: JudgeConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| SourceError::Unavailable(format!("build http client: {e}")))?;
        Ok(Self { client, cfg })
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        request: &JudgeRequest<'_>,
    ) -> Result<T, SourceError> {
        let response = self
            .client
            .post(format!("{}/v1/verdicts", self.cfg.endpoint))
            .header("x-api-key", &self.cfg.api_key)
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SourceError::Unavailable(format!(
                        "judge timed out after {}s",
                        self.cfg.timeout.as_secs()
                    ))
                } else {
                    SourceError::Unavailable(format!("judge request failed: {e}"))
                }
            })?;

        match response.status() {
            StatusCode::OK => response
                .json::<T>()
                .await
                .map_err(|e| SourceError::Unavailable(format!("malformed judge response: {e}"))),
            StatusCode::TOO_MANY_REQUESTS => {
                Err(SourceError::Unavailable("judge rate limited".into()))
            }
            StatusCode::UNAUTHORIZED => {
                Err(SourceError::Unavailable("judge rejected the API key".into()))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(SourceError::Unavailable(format!(
                    "judge error (status {status}): {body}"
                )))
            }
        }
    }
}

#[async_trait]
impl DescriptorSource for JudgeSource {
    fn method(&self) -> &str {
        METHOD
    }

    async fn enroll(&self, capture: &Capture) -> Result<Artifact, SourceError> {
        let request = JudgeRequest {
            model: &self.cfg.model,
            task: "validate",
            images: vec![capture.to_base64()],
        };
        let verdict: ValidateResponse = self.post(&request).await?;

        if !verdict.is_valid {
            let reason = if verdict.reason.is_empty() {
                "judge rejected the enrollment capture".to_string()
            } else {
                verdict.reason
            };
            return Err(SourceError::Rejected(reason));
        }

        tracing::info!("judge accepted enrollment capture");
        Ok(Artifact::Reference {
            jpeg: capture.as_bytes().to_vec(),
        })
    }

    async fn verify(&self, live: &Capture, enrolled: &Artifact) -> Result<Verdict, SourceError> {
        let reference = match enrolled {
            Artifact::Reference { jpeg } => jpeg,
            Artifact::Descriptor(_) => {
                return Err(SourceError::Incompatible(
                    "stored artifact is a descriptor; this backend compares reference images".into(),
                ))
            }
        };

        let request = JudgeRequest {
            model: &self.cfg.model,
            task: "compare",
            images: vec![
                live.to_base64(),
                Capture::from_jpeg(reference.clone()).to_base64(),
            ],
        };
        let answer: CompareResponse = self.post(&request).await?;

        if !answer.face_detected {
            return Ok(Verdict::no_face());
        }

        if !answer.matched {
            tracing::debug!(confidence = ?answer.confidence, "judge reports non-match");
            return Ok(Verdict {
                matched: false,
                face_detected: true,
                tier: Tier::NoMatch,
                distance: None,
            });
        }

        // A positive match must carry a usable confidence tier; a claim
        // of "matched" with no tier is a malformed answer, not a grant.
        let tier = answer
            .confidence
            .as_deref()
            .and_then(Tier::from_str)
            .filter(|t| t.is_match())
            .ok_or_else(|| {
                SourceError::Unavailable(format!(
                    "judge matched without a valid confidence tier: {:?}",
                    answer.confidence
                ))
            })?;

        Ok(Verdict {
            matched: true,
            face_detected: true,
            tier,
            distance: None,
        })
    }
}
