//! Fallback resolution for failed steps.
//!
//! Tried in order, first hit wins:
//! 1. The step's own fallback
//! 2. The step's last cached genuine result
//! 3. The static default for the step's result kind
//!
//! Resolution never fails and never writes to the cache.

use crate::cache::ResultCache;
use crate::steps::Step;
use cadence_core::{FallbackSource, StepError};
use serde_json::Value;
use std::sync::Arc;

/// A substitute value and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFallback {
    pub value: Value,
    pub source: FallbackSource,
}

/// Produces substitute results for failed steps.
#[derive(Clone)]
pub struct FallbackResolver {
    cache: Arc<ResultCache>,
}

impl FallbackResolver {
    pub fn new(cache: Arc<ResultCache>) -> Self {
        Self { cache }
    }

    pub async fn resolve(&self, step: &Step, reason: &StepError) -> ResolvedFallback {
        if let Some(value) = step.fallback().and_then(|f| f.produce(reason)) {
            tracing::debug!(step = %step.name(), reason = %reason, "Using custom fallback");
            return ResolvedFallback {
                value,
                source: FallbackSource::Custom,
            };
        }

        if let Some(cached) = self.cache.get(step.name()).await {
            tracing::debug!(
                step = %step.name(),
                reason = %reason,
                cycle = cached.cycle,
                "Using cached result"
            );
            return ResolvedFallback {
                value: cached.value,
                source: FallbackSource::Cache {
                    cycle: cached.cycle,
                },
            };
        }

        tracing::debug!(step = %step.name(), reason = %reason, "Using static default");
        ResolvedFallback {
            value: step.result_kind().default_value(),
            source: FallbackSource::Default,
        }
    }
}
