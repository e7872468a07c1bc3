//! Channel contracts: the abstraction over the chat platform.
//!
//! The platform connection itself lives outside the pipeline. It is consumed
//! through three narrow capabilities: an inbound event source, a history
//! source for the recent-conversation window, and a reply sender.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::error::ChannelError;

/// Unique identifier for a conversational channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message observed on a channel, either as the trigger of a turn or as
/// part of the history returned by a [`HistorySource`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub channel_id: ChannelId,

    /// Platform user id of the author.
    pub author_id: u64,

    /// Display name of the author
    pub author_name: String,

    /// Whether the platform flags the author as a bot account
    #[serde(default)]
    pub author_is_bot: bool,

    /// Platform message id, unique within a channel
    pub message_id: u64,

    pub content: String,

    /// User ids explicitly mentioned by the message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentioned_user_ids: Vec<u64>,

    pub created_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn mentions(&self, user_id: u64) -> bool {
        self.mentioned_user_ids.contains(&user_id)
    }
}

/// Who spoke a conversation turn, relative to the bound identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeakerRole {
    /// The bound identity itself
    #[serde(rename = "assistant")]
    SelfIdentity,
    /// Anyone else in the channel
    #[serde(rename = "user")]
    Other,
}

impl SpeakerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelfIdentity => "assistant",
            Self::Other => "user",
        }
    }
}

/// One entry in the recent-conversation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub message_id: u64,
    pub role: SpeakerRole,
    pub author_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Inbound event source.
///
/// Implementations own the platform connection and yield events until the
/// platform disconnects, at which point the receiver closes.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Human-readable source name (e.g., "console").
    fn name(&self) -> &str;

    async fn start(
        &self,
    ) -> std::result::Result<tokio::sync::mpsc::Receiver<InboundEvent>, ChannelError>;
}

/// Delivers replies back to the triggering channel.
#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn send(&self, channel: &ChannelId, text: &str) -> std::result::Result<(), ChannelError>;

    /// Send a typing indicator (if the platform supports it).
    async fn send_typing(&self, _channel: &ChannelId) -> std::result::Result<(), ChannelError> {
        Ok(()) // No-op default
    }
}

/// Fetches recent messages for a channel.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Up to `limit` most recent messages, in any order.
    async fn recent(
        &self,
        channel: &ChannelId,
        limit: usize,
    ) -> std::result::Result<Vec<InboundEvent>, ChannelError>;
}
