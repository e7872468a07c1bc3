//! Error types for the Homunculus domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all Homunculus operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Channel errors ---
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Identity errors ---
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Swap error: {0}")]
    Swap(#[from] SwapError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider returned an empty completion")]
    EmptyCompletion,
}

/// The three completion failure classes a turn can end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionFailureKind {
    Unavailable,
    RateLimited,
    InvalidRequest,
}

impl std::fmt::Display for CompletionFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unavailable => "unavailable",
            Self::RateLimited => "rate_limited",
            Self::InvalidRequest => "invalid_request",
        };
        f.write_str(s)
    }
}

impl ProviderError {
    /// Collapse a transport-level error into the completion failure taxonomy.
    pub fn failure_kind(&self) -> CompletionFailureKind {
        match self {
            Self::RateLimited { .. } => CompletionFailureKind::RateLimited,
            Self::ApiError { status_code, .. } if (400..500).contains(status_code) => {
                CompletionFailureKind::InvalidRequest
            }
            Self::AuthenticationFailed(_) | Self::InvalidRequest(_) => {
                CompletionFailureKind::InvalidRequest
            }
            Self::ApiError { .. }
            | Self::NotConfigured(_)
            | Self::Timeout(_)
            | Self::Network(_)
            | Self::EmptyCompletion => CompletionFailureKind::Unavailable,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    #[error("Message delivery failed to {channel}: {reason}")]
    DeliveryFailed { channel: String, reason: String },

    #[error("History unavailable for {channel}: {reason}")]
    HistoryUnavailable { channel: String, reason: String },

    #[error("Channel connection lost: {0}")]
    ConnectionLost(String),

    #[error("Invalid input line: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Index maintenance failed: {0}")]
    IndexFailed(String),

    #[error("Namespace '{namespace}' was retired (generation {generation})")]
    NamespaceRetired { namespace: String, generation: u64 },

    #[error("Invalid namespace name: {0}")]
    InvalidNamespace(String),
}

impl From<std::io::Error> for MemoryError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// A single problem found while validating a character card.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]: {}", self.field, self.code, self.message)
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Character card not found: {0}")]
    NotFound(String),

    #[error("Failed to read character card {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("Character card {path} is not valid JSON: {reason}")]
    Malformed { path: String, reason: String },

    #[error("Character card failed validation: {}", render_issues(.0))]
    Invalid(Vec<ValidationIssue>),
}

fn render_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("No identity is bound to channel {0}")]
    NotBound(String),

    #[error("Namespace '{namespace}' is already active on channel {channel}")]
    NamespaceInUse { namespace: String, channel: String },

    #[error("Invalid NPC name '{0}': use lowercase letters, digits, '-' or '_' (2-64 chars)")]
    InvalidName(String),

    #[error("Replacement identity rejected: {0}")]
    Identity(#[from] IdentityError),

    #[error("Archive of namespace '{namespace}' failed: {source}")]
    Archive {
        namespace: String,
        #[source]
        source: MemoryError,
    },

    #[error("Provisioning namespace '{namespace}' failed: {source}")]
    Provision {
        namespace: String,
        #[source]
        source: MemoryError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn provider_errors_map_onto_completion_taxonomy() {
        let rate = ProviderError::RateLimited { retry_after_secs: 5 };
        assert_eq!(rate.failure_kind(), CompletionFailureKind::RateLimited);

        let bad = ProviderError::ApiError {
            status_code: 400,
            message: "max_tokens too large".into(),
        };
        assert_eq!(bad.failure_kind(), CompletionFailureKind::InvalidRequest);
        assert_eq!(
            ProviderError::AuthenticationFailed("bad key".into()).failure_kind(),
            CompletionFailureKind::InvalidRequest
        );

        let overloaded = ProviderError::ApiError {
            status_code: 529,
            message: "overloaded".into(),
        };
        assert_eq!(overloaded.failure_kind(), CompletionFailureKind::Unavailable);
        assert_eq!(
            ProviderError::Network("reset".into()).failure_kind(),
            CompletionFailureKind::Unavailable
        );
    }

    #[test]
    fn identity_error_lists_every_issue() {
        let err = IdentityError::Invalid(vec![
            ValidationIssue::new("stats.HP", "out_of_range", "must be 0-100"),
            ValidationIssue::new("name", "missing", "required"),
        ]);
        let text = err.to_string();
        assert!(text.contains("stats.HP [out_of_range]"));
        assert!(text.contains("name [missing]"));
    }

    #[test]
    fn issues_sort_by_field_then_code() {
        let mut issues = vec![
            ValidationIssue::new("stats", "missing", "b"),
            ValidationIssue::new("name", "type", "a"),
            ValidationIssue::new("name", "missing", "c"),
        ];
        issues.sort();
        assert_eq!(issues[0].code, "missing");
        assert_eq!(issues[0].field, "name");
        assert_eq!(issues[2].field, "stats");
    }
}
