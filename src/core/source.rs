//! The contract every upstream adapter implements.

use crate::core::quote::{FetchRequest, Fetched, SourceId};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt::Display;
use thiserror::Error;

/// Why a single source could not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FetchError {
    /// Network failure, timeout or a non-success HTTP status.
    #[error("unreachable: {0}")]
    Unreachable(String),
    /// The response no longer has the shape the adapter expects.
    #[error("unparseable: {0}")]
    Unparseable(String),
    /// A well-formed response with no usable data.
    #[error("empty: {0}")]
    Empty(String),
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    fn id(&self) -> SourceId;

    /// Whether this source can serve the request at all.
    fn supports(&self, request: &FetchRequest) -> bool;

    /// Performs one fetch. Implementations never retry and never panic on bad input;
    /// every failure comes back as a `FetchError`.
    async fn fetch(&self, request: &FetchRequest) -> Result<Fetched, FetchError>;
}

/// A failure recorded against the source that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source: SourceId,
    pub error: FetchError,
}

impl Display for SourceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.source, self.error)
    }
}

/// Successful resolution with provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolved {
    pub data: Fetched,
    pub source: SourceId,
    /// Failures of the preferred sources tried before `source`.
    pub skipped: Vec<SourceFailure>,
}

/// Every configured source for a request failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("all sources failed for {request}: {}", format_failures(.failures))]
pub struct AllSourcesFailed {
    pub request: FetchRequest,
    pub failures: Vec<SourceFailure>,
}

fn format_failures(failures: &[SourceFailure]) -> String {
    if failures.is_empty() {
        return "no sources configured".to_string();
    }
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
