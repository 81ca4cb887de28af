use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::GateError;

/// Face descriptor: a fixed-length feature vector tagged with the
/// extraction method that produced it (e.g. "facenet-128").
///
/// Two descriptors are comparable only when both the method and the
/// vector length agree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
    pub method: String,
}

impl Descriptor {
    pub fn new(values: Vec<f32>, method: impl Into<String>) -> Self {
        Self {
            values,
            method: method.into(),
        }
    }

    /// Compute the Euclidean distance to another descriptor.
    ///
    /// Non-negative; 0 means identical vectors. Fails with
    /// [`GateError::IncompatibleDescriptor`] when the descriptors were
    /// produced by different methods or differ in length.
    pub fn distance(&self, other: &Descriptor) -> Result<f32, GateError> {
        if self.method != other.method {
            return Err(GateError::IncompatibleDescriptor(format!(
                "extraction method mismatch: {} vs {}",
                self.method, other.method
            )));
        }
        if self.values.len() != other.values.len() {
            return Err(GateError::IncompatibleDescriptor(format!(
                "vector length mismatch: {} vs {}",
                self.values.len(),
                other.values.len()
            )));
        }

        let sum: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        Ok(sum.sqrt())
    }
}

/// Confidence tier of a comparison, strongest first.
///
/// The derived order makes `High < Medium < Low < NoMatch`, so a smaller
/// tier is a stronger match. Every tier except [`Tier::NoMatch`] counts
/// as a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    High,
    Medium,
    Low,
    NoMatch,
}

impl Tier {
    pub fn is_match(self) -> bool {
        self != Tier::NoMatch
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::High => "High",
            Tier::Medium => "Medium",
            Tier::Low => "Low",
            Tier::NoMatch => "No Match",
        }
    }

    pub fn from_str(s: &str) -> Option<Tier> {
        match s {
            "High" => Some(Tier::High),
            "Medium" => Some(Tier::Medium),
            "Low" => Some(Tier::Low),
            "No Match" => Some(Tier::NoMatch),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("tier bounds must satisfy 0 < high <= medium <= low (got {high}, {medium}, {low})")]
    Unordered { high: f32, medium: f32, low: f32 },
}

/// Distance thresholds for the confidence tiers. Strict upper bounds:
/// a distance must be *less than* the bound to qualify.
///
/// Accepting Low-tier matches favors throughput over strictness; the
/// bounds are policy, loaded from configuration, not constants of the
/// comparison itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MatchPolicy {
    pub high: f32,
    pub medium: f32,
    pub low: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            high: 0.40,
            medium: 0.50,
            low: 0.60,
        }
    }
}

impl MatchPolicy {
    pub fn new(high: f32, medium: f32, low: f32) -> Result<Self, PolicyError> {
        if !(high > 0.0 && high <= medium && medium <= low) {
            return Err(PolicyError::Unordered { high, medium, low });
        }
        Ok(Self { high, medium, low })
    }

    /// Classify a distance into a tier. Total and monotonic: a smaller
    /// distance never yields a weaker tier.
    pub fn classify(&self, distance: f32) -> Tier {
        if distance < self.high {
            Tier::High
        } else if distance < self.medium {
            Tier::Medium
        } else if distance < self.low {
            Tier::Low
        } else {
            Tier::NoMatch
        }
    }
}

/// Outcome of one biometric comparison, produced by either backend.
///
/// `distance` is only present when the backend exposes a raw distance
/// (the local embedding pipeline); the remote judge reports a tier only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub matched: bool,
    pub face_detected: bool,
    pub tier: Tier,
    pub distance: Option<f32>,
}

impl Verdict {
    /// A no-face verdict: nothing to compare, never a match.
    pub fn no_face() -> Self {
        Self {
            matched: false,
            face_detected: false,
            tier: Tier::NoMatch,
            distance: None,
        }
    }
}
