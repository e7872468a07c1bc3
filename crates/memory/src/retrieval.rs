//! Tiered retrieval: primary under a deadline, then the fallback tier.
//!
//! The adapter never raises. Whatever goes wrong below it ends up as an
//! empty or fallback result with the reasons attached as degradations.

use chrono::Utc;
use homunculus_core::event::{DomainEvent, EventBus};
use homunculus_core::memory::{Degradation, MemoryRecord, RetrievalBackend, RetrievalMode, RetrievalResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

pub struct MemoryRetrievalAdapter {
    backend: Arc<dyn RetrievalBackend>,
    primary_timeout: Duration,
    max_query_chars: usize,
    top_k: usize,
    events: Option<Arc<EventBus>>,
}

impl MemoryRetrievalAdapter {
    pub fn new(backend: Arc<dyn RetrievalBackend>, primary_timeout: Duration) -> Self {
        Self {
            backend,
            primary_timeout,
            max_query_chars: 600,
            top_k: 10,
            events: None,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_max_query_chars(mut self, max: usize) -> Self {
        self.max_query_chars = max;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn backend(&self) -> &Arc<dyn RetrievalBackend> {
        &self.backend
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Retrieve ranked records for `text` from `namespace`.
    ///
    /// Waits at most `primary_timeout` for the primary tier, then however long
    /// the fallback tier takes.
    pub async fn retrieve(&self, namespace: &str, text: &str) -> RetrievalResult {
        let started = Instant::now();
        let query = normalize_query(text, self.max_query_chars);
        if query.is_empty() {
            let mut result = RetrievalResult::empty(None, started.elapsed());
            result.degradations.push(Degradation::InvalidQuery);
            warn!(namespace, "Empty retrieval query, skipping search");
            return result;
        }

        let mut degradations = Vec::new();
        let primary = tokio::time::timeout(
            self.primary_timeout,
            self.backend
                .query(namespace, &query, self.top_k, RetrievalMode::Primary),
        )
        .await;

        let (mode, records) = match primary {
            Ok(Ok(records)) => (Some(RetrievalMode::Primary), records),
            Ok(Err(e)) => {
                degradations.push(Degradation::PrimaryFailed {
                    reason: e.to_string(),
                });
                self.fallback(namespace, &query, &mut degradations).await
            }
            Err(_) => {
                degradations.push(Degradation::PrimaryTimedOut {
                    after_ms: self.primary_timeout.as_millis() as u64,
                });
                self.fallback(namespace, &query, &mut degradations).await
            }
        };

        let result = RetrievalResult {
            records: rank(records, self.top_k),
            mode,
            elapsed: started.elapsed(),
            degradations,
        };

        info!(
            namespace,
            backend = self.backend.name(),
            mode = result.mode.map(|m| m.as_str()).unwrap_or("none"),
            used_fallback = result.used_fallback(),
            latency_ms = result.elapsed.as_millis() as u64,
            records = result.records.len(),
            "Memory retrieval finished"
        );

        if result.is_degraded() {
            if let Some(events) = &self.events {
                events.publish(DomainEvent::RetrievalDegraded {
                    namespace: namespace.to_string(),
                    used_fallback: result.used_fallback(),
                    reason: describe(&result.degradations),
                    timestamp: Utc::now(),
                });
            }
        }

        result
    }

    async fn fallback(
        &self,
        namespace: &str,
        query: &str,
        degradations: &mut Vec<Degradation>,
    ) -> (Option<RetrievalMode>, Vec<MemoryRecord>) {
        warn!(namespace, reason = ?degradations.last(), "Primary retrieval unavailable, using fallback");
        match self
            .backend
            .query(namespace, query, self.top_k, RetrievalMode::Fallback)
            .await
        {
            Ok(records) => (Some(RetrievalMode::Fallback), records),
            Err(e) => {
                warn!(namespace, error = %e, "Fallback retrieval failed");
                degradations.push(Degradation::FallbackFailed {
                    reason: e.to_string(),
                });
                (None, Vec::new())
            }
        }
    }
}

/// Collapse whitespace and cap the query at `max_chars` characters.
pub fn normalize_query(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(max_chars).collect::<String>().trim_end().to_string()
}

fn rank(mut records: Vec<MemoryRecord>, top_k: usize) -> Vec<MemoryRecord> {
    records.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    records.truncate(top_k);
    records
}

fn describe(degradations: &[Degradation]) -> String {
    degradations
        .iter()
        .map(|d| match d {
            Degradation::InvalidQuery => "invalid_query".to_string(),
            Degradation::PrimaryTimedOut { after_ms } => format!("primary_timed_out({after_ms}ms)"),
            Degradation::PrimaryFailed { reason } => format!("primary_failed: {reason}"),
            Degradation::FallbackFailed { reason } => format!("fallback_failed: {reason}"),
        })
        .collect::<Vec<_>>()
        .join("; ")
}
