use anyhow::{bail, Context, Result};
use facegate_core::{MatchPolicy, Role};
use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration: a TOML file (path from `FACEGATE_CONFIG`) with
/// `FACEGATE_*` environment overrides on top. Every knob has a default
/// except the sealing key and, for the judge backend, the API key.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub store: StoreSection,
    pub source: SourceSection,
    pub policy: PolicySection,
    pub session: SessionSection,
    pub operators: Vec<OperatorAccount>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSection {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// 64-hex-char AES-256 key for sealing biometric artifacts.
    pub key_hex: Option<String>,
    /// Alternative to `key_hex`: derive the key from a passphrase.
    pub key_passphrase: Option<String>,
}

impl Default for StoreSection {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facegate");
        Self {
            db_path: data_dir.join("facegate.db"),
            key_hex: None,
            key_passphrase: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Local,
    Judge,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceSection {
    pub backend: Backend,
    /// Directory containing the ONNX model files (local backend).
    pub model_dir: PathBuf,
    /// Base URL of the judge service (judge backend).
    pub judge_endpoint: String,
    pub judge_api_key: String,
    pub judge_model: String,
    /// Timeout in seconds for any remote verification call.
    pub timeout_secs: u64,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            backend: Backend::Local,
            model_dir: PathBuf::from("/usr/share/facegate/models"),
            judge_endpoint: "https://judge.facegate.dev".to_string(),
            judge_api_key: String::new(),
            judge_model: "judge-vision-1".to_string(),
            timeout_secs: 10,
        }
    }
}

impl SourceSection {
    /// Path to the face detection model.
    pub fn detect_model_path(&self) -> String {
        self.model_dir.join("det_tiny.onnx").to_string_lossy().into_owned()
    }

    /// Path to the descriptor extraction model.
    pub fn embed_model_path(&self) -> String {
        self.model_dir
            .join("facenet_128.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicySection {
    /// Strict upper distance bounds for the confidence tiers.
    pub tier_high: f32,
    pub tier_medium: f32,
    pub tier_low: f32,
    /// Minimum detection confidence for an enrollment capture.
    pub min_enroll_confidence: f32,
    /// Reject issuance once an event is at capacity. Soft mode only
    /// warns when the counter passes the declared maximum.
    pub enforce_capacity: bool,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            tier_high: 0.40,
            tier_medium: 0.50,
            tier_low: 0.60,
            min_enroll_confidence: 0.7,
            enforce_capacity: true,
        }
    }
}

impl PolicySection {
    pub fn match_policy(&self) -> Result<MatchPolicy> {
        MatchPolicy::new(self.tier_high, self.tier_medium, self.tier_low)
            .context("invalid [policy] tier bounds")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSection {
    /// Operator session lifetime.
    pub ttl_hours: i64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self { ttl_hours: 24 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperatorAccount {
    pub email: String,
    /// Hex SHA-256 digest of the password.
    pub password_sha256: String,
    pub role: Role,
}

impl Config {
    /// Load from `FACEGATE_CONFIG` (default `/etc/facegate/facegated.toml`;
    /// a missing file means defaults) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("FACEGATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/etc/facegate/facegated.toml"));

        let mut cfg = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read config {}", path.display()))?;
            Self::from_toml_str(&raw)
                .with_context(|| format!("parse config {}", path.display()))?
        } else {
            tracing::info!(path = %path.display(), "no config file; using defaults");
            Self::default()
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FACEGATE_DB_PATH") {
            self.store.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FACEGATE_KEY_HEX") {
            self.store.key_hex = Some(v);
        }
        if let Ok(v) = std::env::var("FACEGATE_KEY_PASSPHRASE") {
            self.store.key_passphrase = Some(v);
        }
        if let Ok(v) = std::env::var("FACEGATE_BACKEND") {
            match v.as_str() {
                "local" => self.source.backend = Backend::Local,
                "judge" => self.source.backend = Backend::Judge,
                other => tracing::warn!(backend = other, "unknown FACEGATE_BACKEND; keeping configured value"),
            }
        }
        if let Ok(v) = std::env::var("FACEGATE_MODEL_DIR") {
            self.source.model_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FACEGATE_JUDGE_ENDPOINT") {
            self.source.judge_endpoint = v;
        }
        if let Ok(v) = std::env::var("FACEGATE_JUDGE_API_KEY") {
            self.source.judge_api_key = v;
        }
        if let Ok(v) = std::env::var("FACEGATE_JUDGE_MODEL") {
            self.source.judge_model = v;
        }
        self.source.timeout_secs = env_u64("FACEGATE_TIMEOUT_SECS", self.source.timeout_secs);
        self.policy.min_enroll_confidence =
            env_f32("FACEGATE_MIN_ENROLL_CONFIDENCE", self.policy.min_enroll_confidence);
        if let Ok(v) = std::env::var("FACEGATE_ENFORCE_CAPACITY") {
            self.policy.enforce_capacity = v != "0";
        }
        self.session.ttl_hours = env_i64("FACEGATE_SESSION_TTL_HOURS", self.session.ttl_hours);
    }

    fn validate(&self) -> Result<()> {
        self.policy.match_policy()?;
        if self.store.key_hex.is_none() && self.store.key_passphrase.is_none() {
            bail!("no sealing key: set store.key_hex or store.key_passphrase (or the FACEGATE_KEY_* variables)");
        }
        if self.session.ttl_hours <= 0 {
            bail!("session.ttl_hours must be positive");
        }
        Ok(())
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_strict_and_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.source.backend, Backend::Local);
        assert!(cfg.policy.enforce_capacity);
        assert_eq!(cfg.session.ttl_hours, 24);
        assert_eq!(cfg.source.timeout_secs, 10);
        assert!(cfg.policy.match_policy().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let cfg = Config::from_toml_str(
            r#"
            [store]
            db_path = "/var/lib/facegate/facegate.db"
            key_passphrase = "dev only"

            [source]
            backend = "judge"
            judge_endpoint = "https://judge.internal"
            judge_api_key = "secret"
            judge_model = "judge-vision-2"
            timeout_secs = 5

            [policy]
            tier_high = 0.35
            tier_medium = 0.45
            tier_low = 0.55
            enforce_capacity = false

            [session]
            ttl_hours = 8

            [[operators]]
            email = "gate@venue.example"
            password_sha256 = "aa" # not a real digest, parsing only
            role = "operator"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.source.backend, Backend::Judge);
        assert_eq!(cfg.source.judge_endpoint, "https://judge.internal");
        assert!(!cfg.policy.enforce_capacity);
        assert_eq!(cfg.session.ttl_hours, 8);
        assert_eq!(cfg.operators.len(), 1);
        assert_eq!(cfg.operators[0].role, Role::Operator);
        let policy = cfg.policy.match_policy().unwrap();
        assert_eq!(policy.high, 0.35);
    }

    #[test]
    fn test_unordered_tier_bounds_rejected() {
        let cfg = Config::from_toml_str(
            r#"
            [policy]
            tier_high = 0.6
            tier_medium = 0.5
            tier_low = 0.4
            "#,
        )
        .unwrap();
        assert!(cfg.policy.match_policy().is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(Config::from_toml_str("[policy]\nthreshold = 0.5\n").is_err());
    }

    #[test]
    fn test_model_paths_derive_from_model_dir() {
        let mut cfg = Config::default();
        cfg.source.model_dir = PathBuf::from("/opt/models");
        assert_eq!(cfg.source.detect_model_path(), "/opt/models/det_tiny.onnx");
        assert_eq!(cfg.source.embed_model_path(), "/opt/models/facenet_128.onnx");
    }
}
