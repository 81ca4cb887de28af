//! Descriptor sources — the two interchangeable biometric backends.
//!
//! Both the local ONNX embedding pipeline ([`LocalSource`]) and the remote
//! multimodal judge ([`JudgeSource`]) sit behind [`DescriptorSource`], so
//! the gate orchestrator never special-cases either. The backend is picked
//! once, at configuration time.

pub mod judge;
pub mod local;

use async_trait::async_trait;
use base64::Engine as _;
use facegate_core::{Descriptor, GateError, Verdict};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use judge::{JudgeConfig, JudgeSource};
pub use local::{LocalConfig, LocalSource};

/// An opaque still-image payload (JPEG bytes). The core never inspects
/// the pixels; only the backends report whether a face is present.
#[derive(Debug, Clone)]
pub struct Capture(Vec<u8>);

impl Capture {
    pub fn from_jpeg(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Decode a base64 payload, tolerating a `data:image/...;base64,`
    /// prefix as produced by browser capture widgets.
    pub fn from_base64(encoded: &str) -> Result<Self, SourceError> {
        let raw = match encoded.split_once(',') {
            Some((head, rest)) if head.starts_with("data:") => rest,
            _ => encoded,
        };
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(raw.trim())
            .map_err(|e| SourceError::ImageDecode(format!("base64: {e}")))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.0)
    }
}

/// What enrollment binds to a ticket. The local pipeline stores the
/// extracted descriptor; the judge keeps the validated reference image
/// because it never exposes a raw descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    Descriptor(Descriptor),
    Reference {
        #[serde(with = "jpeg_base64")]
        jpeg: Vec<u8>,
    },
}

impl Artifact {
    pub fn kind(&self) -> &'static str {
        match self {
            Artifact::Descriptor(_) => "descriptor",
            Artifact::Reference { .. } => "reference",
        }
    }
}

mod jpeg_base64 {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("no usable face detected")]
    NoFaceDetected,
    #[error("capture rejected: {0}")]
    Rejected(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("artifact incompatible with this backend: {0}")]
    Incompatible(String),
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("image decode failed: {0}")]
    ImageDecode(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Fold backend failures into the denial taxonomy. Anything the backend
/// cannot answer for resolves to a deniable kind, never an approval.
impl From<SourceError> for GateError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::NoFaceDetected => GateError::NoFaceDetected,
            SourceError::Rejected(reason) => GateError::DescriptorInvalid(reason),
            SourceError::Incompatible(reason) => GateError::IncompatibleDescriptor(reason),
            // An undecodable capture has no detectable face in it.
            SourceError::ImageDecode(_) => GateError::NoFaceDetected,
            SourceError::Unavailable(reason) => GateError::ServiceUnavailable(reason),
            SourceError::ModelNotFound(path) => {
                GateError::ServiceUnavailable(format!("model not found: {path}"))
            }
            SourceError::Inference(reason) => GateError::ServiceUnavailable(reason),
            SourceError::Ort(e) => GateError::ServiceUnavailable(format!("inference: {e}")),
        }
    }
}

/// The polymorphic descriptor/verdict capability (one interface, two
/// strategies).
///
/// `enroll` validates a registration capture and produces the artifact to
/// bind to the ticket; a capture without a usable face is an error here
/// because it blocks the transition. `verify` compares a live capture
/// against the enrolled artifact; "no face in the live capture" is a
/// normal verdict (`face_detected == false`), not an error.
#[async_trait]
pub trait DescriptorSource: Send + Sync {
    /// Name of the extraction method, recorded next to stored artifacts.
    fn method(&self) -> &str;

    async fn enroll(&self, capture: &Capture) -> Result<Artifact, SourceError>;

    async fn verify(&self, live: &Capture, enrolled: &Artifact) -> Result<Verdict, SourceError>;
}
