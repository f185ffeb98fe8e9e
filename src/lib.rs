//! # VERITAS: Auditable Decision Pipeline
//!
//! VERITAS turns a request (query + context) into a structured decision
//! record while enforcing a deterministic multi-stage pipeline, a layered
//! safety gate, and a tamper-evident audit log.
//!
//! ## Core Components
//!
//! - **Pipeline**: a fixed ordered sequence of stages with per-stage
//!   metrics, skip flags, and partial-failure recovery
//! - **FUJI gate**: a multi-layer admission controller classifying each
//!   draft decision as allow / modify / hold / deny
//! - **TrustLog**: an append-only, hash-chained, rotation-safe audit log
//!   with verifiable chain continuity
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use veritas::config::VeritasConfig;
//! use veritas::pipeline::DecisionPipeline;
//! use veritas::request::{CandidateOption, Request};
//! use veritas::services::Services;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = DecisionPipeline::open(VeritasConfig::default(), Services::default())?;
//!
//! let request = Request::builder()
//!     .query("Should I check tomorrow's weather?")
//!     .context("user_id", json!("u1"))
//!     .option(CandidateOption::new("o1", "check weather app").with_score(0.9))
//!     .build();
//!
//! let response = pipeline.decide(request).await?;
//! println!("{} -> {}", response.request_id, response.decision_status);
//!
//! // Every decision is sealed into the hash chain.
//! assert!(response.trust_log.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! Request -> normalize -> options -> evidence -> critique -> debate
//!         -> planner -> values -> FUJI gate -> seal(TrustLog) -> Response
//! ```
//!
//! Each stage receives an immutable snapshot of the accumulated state and
//! returns a patch; the orchestrator owns the state and the failure policy.
//! Skip flags let a gateway pre-fill a stage's output to avoid double
//! execution.
//!
//! ## Module Guide
//!
//! - [`request`] - Request model, candidate options, entry validation
//! - [`state`] - Accumulated per-request state and snapshots
//! - [`stage`] - The stage trait, patches, metrics, and errors
//! - [`pipeline`] - The orchestrator and the seven stage adapters
//! - [`fuji`] - The layered safety gate, policy, and patches
//! - [`trustlog`] - The hash-chained audit log
//! - [`services`] - External collaborators as explicit dependencies
//! - [`guard`] - Replay protection and rate limiting
//! - [`config`] - Layered runtime configuration

pub mod config;
pub mod fuji;
pub mod guard;
pub mod pipeline;
pub mod request;
pub mod services;
pub mod stage;
pub mod state;
pub mod telemetry;
pub mod trustlog;
pub mod types;
pub mod utils;
