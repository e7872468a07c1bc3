//! Memory contracts: durable per-namespace logs and tiered retrieval.
//!
//! Every identity owns one namespace. The durable log is append-only and is
//! the source of truth; a retrieval backend indexes it on a maintenance
//! schedule, so a freshly appended fact becomes searchable only after the next
//! reindex cycle.
//!
//! Retrieval has two modes:
//! - Primary (lexical + semantic + re-ranked, slower)
//! - Fallback (lexical only, near-instant)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::error::MemoryError;

/// A handle on one provisioning of a namespace.
///
/// The generation increments every time the namespace is provisioned or
/// retired, so a writer holding a stale handle can never land a write in a
/// namespace that has since been archived and re-created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    pub generation: u64,
}

impl Namespace {
    pub fn new(name: impl Into<String>, generation: u64) -> Self {
        Self {
            name: name.into(),
            generation,
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Namespace names: `[a-z0-9][a-z0-9_-]{0,63}`.
pub fn is_valid_namespace_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 64 {
        return false;
    }
    let first_ok = bytes[0].is_ascii_lowercase() || bytes[0].is_ascii_digit();
    first_ok
        && bytes[1..]
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'_' || *b == b'-')
}

/// A single remembered fact. Never mutated after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// The fact text
    pub text: String,

    /// Where the fact lives (daily log path, index document id)
    pub source: String,

    /// When the fact was written, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Owning namespace name
    pub namespace: String,

    /// Relevance score (set by retrieval)
    #[serde(default)]
    pub score: f32,
}

/// Which retrieval tier answered a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Primary,
    Fallback,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a retrieval result carries less than the primary tier would give.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    /// The query was empty after normalisation; nothing was searched.
    InvalidQuery,
    PrimaryTimedOut { after_ms: u64 },
    PrimaryFailed { reason: String },
    FallbackFailed { reason: String },
}

/// The ranked output of one retrieval call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    /// Highest score first
    pub records: Vec<MemoryRecord>,

    /// The tier that produced `records`, `None` if no tier answered
    pub mode: Option<RetrievalMode>,

    #[serde(with = "duration_ms")]
    pub elapsed: Duration,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degradations: Vec<Degradation>,
}

impl RetrievalResult {
    pub fn empty(mode: Option<RetrievalMode>, elapsed: Duration) -> Self {
        Self {
            records: Vec::new(),
            mode,
            elapsed,
            degradations: Vec::new(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }

    /// Whether the fallback tier was tried, even if it failed too.
    pub fn used_fallback(&self) -> bool {
        self.mode == Some(RetrievalMode::Fallback)
            || self
                .degradations
                .iter()
                .any(|d| matches!(d, Degradation::FallbackFailed { .. }))
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// The retrieval capability.
///
/// Implementations: qmd subprocess, in-process keyword/cosine index.
#[async_trait]
pub trait RetrievalBackend: Send + Sync {
    /// The backend name (e.g., "qmd", "builtin").
    fn name(&self) -> &str;

    /// Ranked records for `text` in `namespace`, highest score first.
    async fn query(
        &self,
        namespace: &str,
        text: &str,
        top_k: usize,
        mode: RetrievalMode,
    ) -> std::result::Result<Vec<MemoryRecord>, MemoryError>;

    /// Bring the index up to date with the namespace's durable log.
    async fn reindex(&self, namespace: &str) -> std::result::Result<(), MemoryError>;

    /// Drop whatever the backend holds for `namespace` outside the
    /// namespace's own directory. Called when the namespace is archived, so
    /// a later binding of the same name starts from an empty index.
    async fn forget(&self, _namespace: &str) {}
}

/// Where an archived namespace ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveReceipt {
    pub namespace: String,
    pub path: std::path::PathBuf,
    pub files: usize,
}

/// The durable, append-only memory store.
#[async_trait]
pub trait DurableMemoryStore: Send + Sync {
    /// Create the namespace's layout (idempotent for existing content) and
    /// return a handle for its newest generation.
    async fn provision(&self, name: &str) -> std::result::Result<Namespace, MemoryError>;

    /// Append a fact to the namespace's current-period log.
    async fn append(
        &self,
        namespace: &Namespace,
        text: &str,
    ) -> std::result::Result<MemoryRecord, MemoryError>;

    /// Every fact in the namespace, oldest first.
    async fn read_all(&self, name: &str) -> std::result::Result<Vec<MemoryRecord>, MemoryError>;

    /// Move the namespace's complete state under a timestamped read-only
    /// archive and retire its handle. `None` when there was nothing on disk.
    async fn archive(
        &self,
        namespace: &Namespace,
    ) -> std::result::Result<Option<ArchiveReceipt>, MemoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_name_rules() {
        assert!(is_valid_namespace_name("kovach"));
        assert!(is_valid_namespace_name("npc_2-b"));
        assert!(is_valid_namespace_name("7"));
        assert!(!is_valid_namespace_name(""));
        assert!(!is_valid_namespace_name("-lead"));
        assert!(!is_valid_namespace_name("Kovach"));
        assert!(!is_valid_namespace_name("a/b"));
        assert!(!is_valid_namespace_name(&"a".repeat(65)));
    }

    #[test]
    fn retrieval_result_flags() {
        let mut result = RetrievalResult::empty(Some(RetrievalMode::Fallback), Duration::from_millis(3));
        assert!(result.used_fallback());
        assert!(!result.is_degraded());
        result.degradations.push(Degradation::PrimaryTimedOut { after_ms: 8000 });
        assert!(result.is_degraded());

        let mut exhausted = RetrievalResult::empty(None, Duration::from_millis(3));
        assert!(!exhausted.used_fallback());
        exhausted.degradations.push(Degradation::FallbackFailed { reason: "binary missing".into() });
        assert!(exhausted.used_fallback());

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"elapsed\":3"));
        assert!(json.contains("primary_timed_out"));
    }
}
