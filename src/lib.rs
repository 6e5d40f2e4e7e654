//! autobuild: an autonomous feature-build orchestrator.
//!
//! Given a repository and an approved feature suggestion, a run clones the
//! repo into an isolated sandbox, generates a plan and failing-first tests,
//! drives a headless coding agent to implement the plan, verifies the result
//! with the repository's own declared checks, retries on failure up to a
//! bounded iteration count, and publishes the outcome as a change request.

pub mod agent;
pub mod api;
pub mod config;
pub mod errors;
pub mod generator;
pub mod logstream;
pub mod models;
pub mod pipeline;
pub mod publish;
pub mod sandbox;
pub mod scope;
pub mod server;
pub mod store;
pub mod stream;
pub mod verify;
