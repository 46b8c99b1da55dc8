//! Ordered, authoritative-first source fallback.

use crate::core::quote::FetchRequest;
use crate::core::source::{AllSourcesFailed, FetchError, Resolved, SourceClient, SourceFailure};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, debug_span, warn};

/// Tries sources in their configured order and returns the first success.
///
/// Earlier sources always win, even when a later one would have fresher data.
/// There are no retries within one pass; the next refresh cycle is the retry.
#[derive(Debug, Clone)]
pub struct FallbackResolver {
    timeout: Duration,
}

impl FallbackResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn resolve(
        &self,
        request: FetchRequest,
        sources: &[Arc<dyn SourceClient>],
    ) -> Result<Resolved, AllSourcesFailed> {
        let mut failures = Vec::new();

        for source in sources {
            let id = source.id();
            let span = debug_span!("resolve", %request, source = %id);
            // Dropping the timed-out future discards any late response.
            let attempt = tokio::time::timeout(self.timeout, source.fetch(&request))
                .instrument(span)
                .await;

            let outcome = match attempt {
                Ok(result) => result,
                Err(_) => Err(FetchError::Unreachable(format!(
                    "timed out after {}ms",
                    self.timeout.as_millis()
                ))),
            };

            match outcome {
                Ok(data) => {
                    debug!("Resolved {} from {}", request, id);
                    return Ok(Resolved {
                        data,
                        source: id,
                        skipped: failures,
                    });
                }
                Err(error) => {
                    warn!("Source {} failed for {}: {}", id, request, error);
                    failures.push(SourceFailure { source: id, error });
                }
            }
        }

        Err(AllSourcesFailed { request, failures })
    }
}
