//! `issueflow-core`: identifiers and the domain error model shared by the worker.
//!
//! This crate contains **no infrastructure** (no database, network or filesystem access).

pub mod error;
pub mod id;

pub use error::DomainError;
pub use id::{JobId, PipelineRunId, ProjectId, WorkerId};
