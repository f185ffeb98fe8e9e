//! Request model and entry-point validation.
//!
//! A [`Request`] is the unit of work the pipeline accepts: the user's query,
//! a free-form context map, and optionally a set of pre-supplied candidate
//! options. Validation happens once at the entry point; the `request_id` is
//! generated exactly once here and propagated unchanged through every stage
//! and into the trust log.
//!
//! # Examples
//!
//! ```rust
//! use veritas::request::{CandidateOption, Request};
//! use serde_json::json;
//!
//! let request = Request::builder()
//!     .query("Should I check tomorrow's weather?")
//!     .context("user_id", json!("u1"))
//!     .context("goals", json!(["health"]))
//!     .option(CandidateOption::new("o1", "check weather app").with_score(0.9))
//!     .build();
//!
//! assert_eq!(request.options.len(), 1);
//! ```

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{EvidenceKind, Severity, Verdict};

/// Context key under which the caller may pre-supply a request id.
pub const CONTEXT_REQUEST_ID: &str = "request_id";
/// Context key naming stages whose outputs the caller pre-filled.
pub const CONTEXT_SKIP_REASONS: &str = "skip_reasons";

/// A decide request: query, context map, and optional candidate options.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Request {
    /// The user intent, free text.
    pub query: String,
    /// User id, goals, constraints, affect hints, request_id, skip flags.
    #[serde(default)]
    pub context: FxHashMap<String, Value>,
    /// Pre-supplied candidate options; may be empty.
    #[serde(default)]
    pub options: Vec<CandidateOption>,
}

impl Request {
    /// Start building a request.
    #[must_use]
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    /// The user id from context, if present.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.context.get("user_id").and_then(Value::as_str)
    }

    /// The goals list from context; empty when absent.
    #[must_use]
    pub fn goals(&self) -> Vec<String> {
        self.context
            .get("goals")
            .and_then(Value::as_array)
            .map(|goals| {
                goals
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stage names the caller marked as pre-filled via `skip_reasons`.
    #[must_use]
    pub fn skip_reasons(&self) -> Vec<String> {
        self.context
            .get(CONTEXT_SKIP_REASONS)
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolve the request id: the context-supplied token, or a fresh UUID.
    ///
    /// The orchestrator calls this once at entry and writes the result back
    /// into the context so every later reader observes the same token.
    #[must_use]
    pub fn resolve_request_id(&mut self) -> String {
        if let Some(id) = self
            .context
            .get(CONTEXT_REQUEST_ID)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
        {
            return id.to_string();
        }
        let id = Uuid::new_v4().to_string();
        self.context
            .insert(CONTEXT_REQUEST_ID.to_string(), Value::String(id.clone()));
        id
    }

    /// A numeric threshold override from context, e.g. `risk_threshold`.
    #[must_use]
    pub fn threshold(&self, key: &str) -> Option<f64> {
        self.context.get(key).and_then(Value::as_f64)
    }
}

/// Builder for [`Request`], mirroring the state-builder idiom used elsewhere.
#[derive(Debug, Default)]
pub struct RequestBuilder {
    query: String,
    context: FxHashMap<String, Value>,
    options: Vec<CandidateOption>,
}

impl RequestBuilder {
    /// Set the query text.
    #[must_use]
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    /// Add a context entry.
    #[must_use]
    pub fn context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Add a candidate option.
    #[must_use]
    pub fn option(mut self, option: CandidateOption) -> Self {
        self.options.push(option);
        self
    }

    /// Build the request.
    #[must_use]
    pub fn build(self) -> Request {
        Request {
            query: self.query,
            context: self.context,
            options: self.options,
        }
    }
}

/// A candidate course of action, enriched as it flows through stages.
///
/// `id` is stable: stages may rewrite every other field but never the id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CandidateOption {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complexity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feasibility: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeline_days: Option<u32>,
}

impl CandidateOption {
    /// Create an option with just an id and title.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            score: None,
            verdict: None,
            rationale: None,
            risk: None,
            complexity: None,
            value: None,
            feasibility: None,
            timeline_days: None,
        }
    }

    #[must_use]
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    #[must_use]
    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    #[must_use]
    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    #[must_use]
    pub fn with_risk(mut self, risk: f64) -> Self {
        self.risk = Some(risk);
        self
    }

    #[must_use]
    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.complexity = Some(complexity);
        self
    }

    #[must_use]
    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    #[must_use]
    pub fn with_feasibility(mut self, feasibility: f64) -> Self {
        self.feasibility = Some(feasibility);
        self
    }

    #[must_use]
    pub fn with_timeline_days(mut self, days: u32) -> Self {
        self.timeline_days = Some(days);
        self
    }
}

/// One piece of supporting evidence gathered for a decision.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EvidenceItem {
    pub source: String,
    pub text: String,
    pub confidence: f64,
    pub kind: EvidenceKind,
}

impl EvidenceItem {
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        text: impl Into<String>,
        confidence: f64,
        kind: EvidenceKind,
    ) -> Self {
        Self {
            source: source.into(),
            text: text.into(),
            confidence,
            kind,
        }
    }
}

/// A critique raised against the current decision draft.
///
/// Critiques form a set keyed by `issue`; high severity is a blocker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Critique {
    pub issue: String,
    pub severity: Severity,
    pub fix: String,
    #[serde(default)]
    pub details: Value,
}

impl Critique {
    #[must_use]
    pub fn new(issue: impl Into<String>, severity: Severity, fix: impl Into<String>) -> Self {
        Self {
            issue: issue.into(),
            severity,
            fix: fix.into(),
            details: Value::Null,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Hard limits enforced at the entry point.
#[derive(Clone, Copy, Debug)]
pub struct RequestLimits {
    /// Maximum serialized body size in bytes.
    pub max_body_bytes: usize,
    /// Maximum query length in characters.
    pub max_query_chars: usize,
    /// Maximum context nesting depth.
    pub max_context_depth: usize,
    /// Maximum number of candidate options.
    pub max_options: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: 10 * 1024 * 1024,
            max_query_chars: 10_000,
            max_context_depth: 8,
            max_options: 16,
        }
    }
}

/// Validation failures surfaced synchronously with 4xx semantics.
#[derive(Debug, Error, Diagnostic)]
pub enum RequestError {
    #[error("query is empty")]
    #[diagnostic(code(veritas::request::empty_query))]
    EmptyQuery,

    #[error("query length {len} exceeds the {max}-character limit")]
    #[diagnostic(code(veritas::request::query_too_long))]
    QueryTooLong { len: usize, max: usize },

    #[error("request body of {len} bytes exceeds the {max}-byte limit")]
    #[diagnostic(code(veritas::request::body_too_large))]
    BodyTooLarge { len: usize, max: usize },

    #[error("context nesting depth {depth} exceeds the limit of {max}")]
    #[diagnostic(
        code(veritas::request::context_too_deep),
        help("Flatten deeply nested context values before submitting.")
    )]
    ContextTooDeep { depth: usize, max: usize },

    #[error("{count} options exceed the limit of {max}")]
    #[diagnostic(code(veritas::request::too_many_options))]
    TooManyOptions { count: usize, max: usize },

    #[error("option {index} has an empty id")]
    #[diagnostic(code(veritas::request::empty_option_id))]
    EmptyOptionId { index: usize },

    #[error("duplicate option id: {id}")]
    #[diagnostic(code(veritas::request::duplicate_option_id))]
    DuplicateOptionId { id: String },
}

/// Validate a request against the configured limits.
///
/// Body size is measured on the serialized form, matching what a network
/// surface would have received.
pub fn validate(request: &Request, limits: &RequestLimits) -> Result<(), RequestError> {
    if request.query.trim().is_empty() {
        return Err(RequestError::EmptyQuery);
    }
    let query_chars = request.query.chars().count();
    if query_chars > limits.max_query_chars {
        return Err(RequestError::QueryTooLong {
            len: query_chars,
            max: limits.max_query_chars,
        });
    }

    let body_len = serde_json::to_vec(request).map(|b| b.len()).unwrap_or(0);
    if body_len > limits.max_body_bytes {
        return Err(RequestError::BodyTooLarge {
            len: body_len,
            max: limits.max_body_bytes,
        });
    }

    for value in request.context.values() {
        let depth = value_depth(value);
        if depth > limits.max_context_depth {
            return Err(RequestError::ContextTooDeep {
                depth,
                max: limits.max_context_depth,
            });
        }
    }

    if request.options.len() > limits.max_options {
        return Err(RequestError::TooManyOptions {
            count: request.options.len(),
            max: limits.max_options,
        });
    }
    let mut seen = rustc_hash::FxHashSet::default();
    for (index, option) in request.options.iter().enumerate() {
        if option.id.is_empty() {
            return Err(RequestError::EmptyOptionId { index });
        }
        if !seen.insert(option.id.as_str()) {
            return Err(RequestError::DuplicateOptionId {
                id: option.id.clone(),
            });
        }
    }

    Ok(())
}

fn value_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(value_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(value_depth).max().unwrap_or(0),
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small_request() -> Request {
        Request::builder()
            .query("Should I check tomorrow's weather?")
            .context("user_id", json!("u1"))
            .option(CandidateOption::new("o1", "check weather app").with_score(0.9))
            .build()
    }

    #[test]
    fn request_id_generated_once() {
        let mut request = small_request();
        let first = request.resolve_request_id();
        let second = request.resolve_request_id();
        assert_eq!(first, second);
        assert_eq!(
            request.context.get(CONTEXT_REQUEST_ID),
            Some(&Value::String(first))
        );
    }

    #[test]
    fn caller_supplied_request_id_wins() {
        let mut request = small_request();
        request
            .context
            .insert(CONTEXT_REQUEST_ID.into(), json!("req-abc"));
        assert_eq!(request.resolve_request_id(), "req-abc");
    }

    #[test]
    fn validate_accepts_small_request() {
        assert!(validate(&small_request(), &RequestLimits::default()).is_ok());
    }

    #[test]
    fn validate_rejects_long_query() {
        let mut request = small_request();
        request.query = "x".repeat(10_001);
        let err = validate(&request, &RequestLimits::default()).unwrap_err();
        assert!(matches!(err, RequestError::QueryTooLong { .. }));
    }

    #[test]
    fn validate_rejects_deep_context() {
        let mut request = small_request();
        let mut nested = json!("leaf");
        for _ in 0..9 {
            nested = json!({ "inner": nested });
        }
        request.context.insert("deep".into(), nested);
        let err = validate(&request, &RequestLimits::default()).unwrap_err();
        assert!(matches!(err, RequestError::ContextTooDeep { .. }));
    }

    #[test]
    fn validate_rejects_duplicate_option_ids() {
        let mut request = small_request();
        request
            .options
            .push(CandidateOption::new("o1", "again"));
        let err = validate(&request, &RequestLimits::default()).unwrap_err();
        assert!(matches!(err, RequestError::DuplicateOptionId { .. }));
    }

    #[test]
    fn skip_reasons_parse() {
        let mut request = small_request();
        request
            .context
            .insert(CONTEXT_SKIP_REASONS.into(), json!(["gather_evidence"]));
        assert_eq!(request.skip_reasons(), vec!["gather_evidence".to_string()]);
    }
}
