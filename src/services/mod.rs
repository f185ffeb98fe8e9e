//! External collaborators as explicit dependencies.
//!
//! The pipeline never reaches for globals: everything it talks to — memory,
//! world model, LLM, safety-head classifier, PII sanitizer — is handed in as
//! a [`Services`] value. Tests substitute fakes.
//!
//! A collaborator may be absent at runtime (subsystem failed to start,
//! adapter not configured). That is modeled with [`Service`]: stages check
//! availability and downgrade to a best-effort outcome instead of erroring,
//! so a partial deployment still answers requests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio::time::Instant;

use crate::request::{CandidateOption, EvidenceItem};
use crate::types::EvidenceKind;

// ============================================================================
// Availability
// ============================================================================

/// A collaborator that may or may not be reachable.
///
/// Mirrors the "lazy service resolution" seam: a stage that depends on an
/// unavailable service records a degraded outcome rather than failing the
/// pipeline.
#[derive(Clone)]
pub enum Service<T> {
    Available(T),
    Unavailable { reason: String },
}

impl<T> Service<T> {
    /// Wrap a live handle.
    pub fn available(value: T) -> Self {
        Self::Available(value)
    }

    /// Mark the service absent with a reason for diagnostics.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// The handle, if the service is live.
    pub fn get(&self) -> Option<&T> {
        match self {
            Self::Available(value) => Some(value),
            Self::Unavailable { .. } => None,
        }
    }

    /// The unavailability reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Available(_) => None,
            Self::Unavailable { reason } => Some(reason),
        }
    }
}

impl<T> std::fmt::Debug for Service<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available(_) => f.write_str("Service::Available"),
            Self::Unavailable { reason } => write!(f, "Service::Unavailable({reason})"),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failure of an external collaborator call.
#[derive(Debug, Error, Diagnostic)]
pub enum ServiceError {
    #[error("{service} call timed out after {timeout:?}")]
    #[diagnostic(code(veritas::service::timeout))]
    Timeout { service: &'static str, timeout: Duration },

    #[error("{service} backend error: {message}")]
    #[diagnostic(code(veritas::service::backend))]
    Backend { service: &'static str, message: String },

    #[error("{service} exhausted {attempts} attempts: {last}")]
    #[diagnostic(
        code(veritas::service::retries_exhausted),
        help("The collaborator kept failing within the request deadline.")
    )]
    RetriesExhausted {
        service: &'static str,
        attempts: u32,
        last: String,
    },
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// Episodic/semantic memory lookup.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Recall up to `limit` items of the given kind relevant to `query`.
    async fn recall(
        &self,
        query: &str,
        kind: EvidenceKind,
        limit: usize,
    ) -> Result<Vec<EvidenceItem>, ServiceError>;
}

/// Read-only view of world-model state.
#[async_trait]
pub trait WorldModel: Send + Sync {
    /// Observations relevant to `query`.
    async fn observe(&self, query: &str) -> Result<Vec<EvidenceItem>, ServiceError>;
}

/// The opaque LLM behind the decision OS.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Propose up to `max` candidate options for the query.
    async fn propose_options(
        &self,
        query: &str,
        goals: &[String],
        max: usize,
    ) -> Result<Vec<CandidateOption>, ServiceError>;
}

/// Structured verdict returned by the safety-head classifier.
#[derive(Clone, Debug, PartialEq)]
pub struct SafetyVerdict {
    /// Overall risk in [0, 1].
    pub risk: f64,
    /// Per-category risks, e.g. `("self_harm", 0.9)`.
    pub categories: Vec<(String, f64)>,
}

/// External LLM safety classifier. Optional; the gate degrades to a
/// documented baseline when it cannot be reached.
#[async_trait]
pub trait SafetyHead: Send + Sync {
    async fn classify(&self, text: &str) -> Result<SafetyVerdict, ServiceError>;
}

/// A confirmed or suspected PII finding in a piece of text.
#[derive(Clone, Debug, PartialEq)]
pub struct PiiFinding {
    /// Category, e.g. `email`, `phone`.
    pub kind: String,
    /// The matched text, verbatim.
    pub matched: String,
    /// Replacement token, e.g. `[REDACTED:email]`.
    pub replacement: String,
    /// Detector confidence in [0, 1].
    pub confidence: f64,
}

/// PII detection as a pure transform; no I/O, no suspension.
pub trait PiiSanitizer: Send + Sync {
    fn scan(&self, text: &str) -> Vec<PiiFinding>;
}

// ============================================================================
// Default PII sanitizer
// ============================================================================

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap()
});
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\+?\d[\d\s().-]{7,}\d").unwrap()
});

/// Regex-based sanitizer covering the high-signal categories (email, phone).
///
/// Confidence is fixed per pattern: addresses are near-certain, phone-shaped
/// digit runs less so.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegexPiiSanitizer;

impl PiiSanitizer for RegexPiiSanitizer {
    fn scan(&self, text: &str) -> Vec<PiiFinding> {
        let mut findings = Vec::new();
        for m in EMAIL_RE.find_iter(text) {
            findings.push(PiiFinding {
                kind: "email".to_string(),
                matched: m.as_str().to_string(),
                replacement: "[REDACTED:email]".to_string(),
                confidence: 0.95,
            });
        }
        for m in PHONE_RE.find_iter(text) {
            findings.push(PiiFinding {
                kind: "phone".to_string(),
                matched: m.as_str().to_string(),
                replacement: "[REDACTED:phone]".to_string(),
                confidence: 0.85,
            });
        }
        findings
    }
}

// ============================================================================
// Services container
// ============================================================================

/// The full collaborator set passed into the orchestrator.
#[derive(Clone)]
pub struct Services {
    pub memory: Service<Arc<dyn MemoryStore>>,
    pub world: Service<Arc<dyn WorldModel>>,
    pub llm: Service<Arc<dyn LlmClient>>,
    pub safety_head: Service<Arc<dyn SafetyHead>>,
    /// Always present: PII scanning is a pure transform with a local default.
    pub pii: Arc<dyn PiiSanitizer>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            memory: Service::unavailable("memory store not configured"),
            world: Service::unavailable("world model not configured"),
            llm: Service::unavailable("llm client not configured"),
            safety_head: Service::unavailable("safety head not configured"),
            pii: Arc::new(RegexPiiSanitizer),
        }
    }
}

impl Services {
    /// Start building a services set; unset collaborators stay unavailable.
    #[must_use]
    pub fn builder() -> ServicesBuilder {
        ServicesBuilder::default()
    }
}

/// Builder for [`Services`].
#[derive(Default)]
pub struct ServicesBuilder {
    memory: Option<Arc<dyn MemoryStore>>,
    world: Option<Arc<dyn WorldModel>>,
    llm: Option<Arc<dyn LlmClient>>,
    safety_head: Option<Arc<dyn SafetyHead>>,
    pii: Option<Arc<dyn PiiSanitizer>>,
}

impl ServicesBuilder {
    #[must_use]
    pub fn memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    #[must_use]
    pub fn world(mut self, world: Arc<dyn WorldModel>) -> Self {
        self.world = Some(world);
        self
    }

    #[must_use]
    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    #[must_use]
    pub fn safety_head(mut self, safety_head: Arc<dyn SafetyHead>) -> Self {
        self.safety_head = Some(safety_head);
        self
    }

    #[must_use]
    pub fn pii(mut self, pii: Arc<dyn PiiSanitizer>) -> Self {
        self.pii = Some(pii);
        self
    }

    #[must_use]
    pub fn build(self) -> Services {
        let defaults = Services::default();
        Services {
            memory: self.memory.map_or(defaults.memory, Service::available),
            world: self.world.map_or(defaults.world, Service::available),
            llm: self.llm.map_or(defaults.llm, Service::available),
            safety_head: self
                .safety_head
                .map_or(defaults.safety_head, Service::available),
            pii: self.pii.unwrap_or(defaults.pii),
        }
    }
}

// ============================================================================
// Retry helper
// ============================================================================

/// Run `op` with bounded retries and exponential backoff plus jitter.
///
/// Total attempts never outlive `deadline`; a timed-out attempt counts as a
/// failure. Used for LLM and safety-head calls.
pub async fn retry_with_backoff<T, F, Fut>(
    service: &'static str,
    attempts: u32,
    base_delay: Duration,
    per_call_timeout: Duration,
    deadline: Instant,
    mut op: F,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ServiceError>>,
{
    let mut last = String::from("no attempts made");
    for attempt in 0..attempts {
        if Instant::now() >= deadline {
            break;
        }
        let call_budget = per_call_timeout.min(deadline.saturating_duration_since(Instant::now()));
        match tokio::time::timeout(call_budget, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => last = err.to_string(),
            Err(_) => {
                last = ServiceError::Timeout {
                    service,
                    timeout: call_budget,
                }
                .to_string();
            }
        }

        // Exponential backoff with jitter, capped by the remaining deadline.
        let backoff = base_delay * 2u32.saturating_pow(attempt);
        let jitter = backoff.mul_f64(rand::random::<f64>() * 0.5);
        let sleep = (backoff + jitter).min(deadline.saturating_duration_since(Instant::now()));
        if !sleep.is_zero() {
            tokio::time::sleep(sleep).await;
        }
    }
    Err(ServiceError::RetriesExhausted {
        service,
        attempts,
        last,
    })
}
