//! Runtime configuration.
//!
//! Configuration is resolved in layers, later wins:
//!
//! 1. Compiled defaults (conservative limits, 30 s deadline)
//! 2. An optional config file (TOML or JSON)
//! 3. `VERITAS_*` environment variables
//!
//! Secrets (API keys, HMAC material) are never part of this struct; they are
//! provided to the surface layer externally.

use std::path::{Path, PathBuf};
use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::RequestLimits;
use crate::types::StageName;

/// Errors raised while resolving configuration.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    #[diagnostic(code(veritas::config::file_read))]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {format} config: {message}")]
    #[diagnostic(code(veritas::config::parse))]
    Parse { format: &'static str, message: String },

    #[error("unsupported config file format: {message}")]
    #[diagnostic(
        code(veritas::config::unsupported_format),
        help("Use a .toml or .json file.")
    )]
    UnsupportedFormat { message: String },

    #[error("failed to parse environment variable {key}: {message}")]
    #[diagnostic(code(veritas::config::env_parse))]
    EnvParse { key: &'static str, message: String },
}

/// Per-stage latency budgets.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StageBudgets {
    /// Evidence gathering (I/O-bound), milliseconds.
    pub evidence_ms: u64,
    /// Debate (may consult the LLM), milliseconds.
    pub debate_ms: u64,
    /// Planner, milliseconds.
    pub planner_ms: u64,
    /// FUJI gate, milliseconds.
    pub fuji_ms: u64,
    /// Everything else, milliseconds.
    pub default_ms: u64,
}

impl Default for StageBudgets {
    fn default() -> Self {
        Self {
            evidence_ms: 5_000,
            debate_ms: 15_000,
            planner_ms: 5_000,
            fuji_ms: 3_000,
            default_ms: 5_000,
        }
    }
}

impl StageBudgets {
    /// The budget for a given stage.
    #[must_use]
    pub fn for_stage(&self, stage: StageName) -> Duration {
        let ms = match stage {
            StageName::GatherEvidence => self.evidence_ms,
            StageName::RunDebate => self.debate_ms,
            StageName::RunPlanner => self.planner_ms,
            StageName::FujiGate => self.fuji_ms,
            _ => self.default_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Full runtime configuration for the pipeline, gate, and trust log.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VeritasConfig {
    /// Directory holding the trust log, value stats, and world state.
    pub log_dir: PathBuf,
    /// Path to the gate policy document, if any.
    pub policy_path: Option<PathBuf>,

    /// Entry-point limits (body, query, depth, options).
    #[serde(skip)]
    pub limits: RequestLimits,
    /// Serialized limit override: max body bytes.
    pub max_body_bytes: Option<usize>,

    /// Overall request deadline, milliseconds.
    pub deadline_ms: u64,
    /// Grace period for the seal attempt after a post-gate timeout, ms.
    pub seal_grace_ms: u64,
    /// Per-stage budgets.
    pub budgets: StageBudgets,

    /// Evidence cap per decision.
    pub max_evidence: usize,
    /// Minimum evidence before the critique/evidence-gate layers object.
    pub min_evidence: usize,
    /// Critique cap per decision.
    pub max_critiques: usize,
    /// Plan step cap.
    pub max_plan_steps: usize,

    /// Trust-log rotation threshold in bytes.
    pub trust_log_max_segment_bytes: u64,
    /// Bounded mirror size in records.
    pub trust_log_mirror_cap: usize,

    /// EMA smoothing factor for value stats.
    pub value_ema_alpha: f64,

    /// Allowed origins for the (external) network surface.
    pub cors_allowlist: Vec<String>,
}

impl Default for VeritasConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("veritas-data"),
            policy_path: None,
            limits: RequestLimits::default(),
            max_body_bytes: None,
            deadline_ms: 30_000,
            seal_grace_ms: 2_000,
            budgets: StageBudgets::default(),
            max_evidence: 32,
            min_evidence: 2,
            max_critiques: 64,
            max_plan_steps: 32,
            trust_log_max_segment_bytes: 8 * 1024 * 1024,
            trust_log_mirror_cap: 2_000,
            value_ema_alpha: 0.1,
            cors_allowlist: Vec::new(),
        }
    }
}

impl VeritasConfig {
    /// Start building a config from compiled defaults.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// The overall request deadline.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    /// The post-gate seal grace period.
    #[must_use]
    pub fn seal_grace(&self) -> Duration {
        Duration::from_millis(self.seal_grace_ms)
    }

    /// Apply the serialized body-size override onto the entry limits.
    fn reconcile(&mut self) {
        if let Some(max) = self.max_body_bytes {
            self.limits.max_body_bytes = max;
        }
    }
}

/// Builder resolving defaults → file → environment.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    base: VeritasConfig,
    use_env: bool,
}

impl ConfigBuilder {
    /// Load overrides from a TOML or JSON file.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;

        self.base = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content).map_err(|e| ConfigError::Parse {
                format: "TOML",
                message: e.to_string(),
            })?,
            Some("json") => serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                format: "JSON",
                message: e.to_string(),
            })?,
            _ => {
                return Err(ConfigError::UnsupportedFormat {
                    message: "file extension must be .toml or .json".to_string(),
                });
            }
        };
        Ok(self)
    }

    /// Enable `VERITAS_*` environment overrides.
    #[must_use]
    pub fn with_env(mut self) -> Self {
        self.use_env = true;
        self
    }

    /// Resolve the final configuration.
    pub fn build(mut self) -> Result<VeritasConfig, ConfigError> {
        if self.use_env {
            dotenvy::dotenv().ok();

            if let Ok(dir) = std::env::var("VERITAS_LOG_DIR") {
                self.base.log_dir = PathBuf::from(dir);
            }
            if let Ok(path) = std::env::var("VERITAS_POLICY_PATH") {
                self.base.policy_path = Some(PathBuf::from(path));
            }
            if let Ok(raw) = std::env::var("VERITAS_MAX_BODY") {
                let bytes = raw.parse::<usize>().map_err(|_| ConfigError::EnvParse {
                    key: "VERITAS_MAX_BODY",
                    message: "must be a byte count".to_string(),
                })?;
                self.base.max_body_bytes = Some(bytes);
            }
            if let Ok(raw) = std::env::var("VERITAS_DEADLINE_MS") {
                self.base.deadline_ms = raw.parse().map_err(|_| ConfigError::EnvParse {
                    key: "VERITAS_DEADLINE_MS",
                    message: "must be milliseconds".to_string(),
                })?;
            }
            if let Ok(raw) = std::env::var("VERITAS_CORS_ALLOWLIST") {
                self.base.cors_allowlist = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
        }

        self.base.reconcile();
        Ok(self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_limits() {
        let config = VeritasConfig::default();
        assert_eq!(config.deadline(), Duration::from_secs(30));
        assert_eq!(config.max_evidence, 32);
        assert_eq!(config.min_evidence, 2);
        assert_eq!(config.trust_log_mirror_cap, 2_000);
        assert_eq!(
            config.budgets.for_stage(StageName::RunDebate),
            Duration::from_secs(15)
        );
        assert_eq!(
            config.budgets.for_stage(StageName::FujiGate),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn file_overrides_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veritas.toml");
        std::fs::write(&path, "deadline_ms = 5000\nmax_evidence = 8\n").unwrap();

        let config = VeritasConfig::builder()
            .with_file(&path)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(config.deadline_ms, 5_000);
        assert_eq!(config.max_evidence, 8);
        // Untouched fields keep defaults.
        assert_eq!(config.min_evidence, 2);
    }

    #[test]
    fn body_override_reconciles_into_limits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veritas.json");
        std::fs::write(&path, r#"{ "max_body_bytes": 1024 }"#).unwrap();

        let config = VeritasConfig::builder()
            .with_file(&path)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(config.limits.max_body_bytes, 1024);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veritas.yaml");
        std::fs::write(&path, "deadline_ms: 5000").unwrap();
        let err = VeritasConfig::builder().with_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat { .. }));
    }
}
