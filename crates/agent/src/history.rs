//! History collector and scene query.
//!
//! The window handed to the prompt builder is oldest first, deduplicated by
//! message id, at most `limit` long, and always ends with the triggering
//! message. A failed fetch never fails the turn: the window shrinks to the
//! trigger alone and is flagged as degraded.

use homunculus_core::channel::{ConversationTurn, HistorySource, InboundEvent, SpeakerRole};
use std::collections::HashSet;
use tracing::warn;

/// Longest scene query derived from a message.
pub const MAX_SCENE_QUERY_CHARS: usize = 280;

/// Query used when a message carries nothing but mentions.
pub const DEFAULT_SCENE_QUERY: &str = "recent ttrpg conversation context";

#[derive(Debug, Clone)]
pub struct HistoryWindow {
    /// Oldest first; the last entry is the triggering message.
    pub turns: Vec<ConversationTurn>,
    /// Set when the history source failed.
    pub degraded: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct HistoryCollector {
    limit: usize,
}

impl HistoryCollector {
    pub fn new(limit: usize) -> Self {
        Self { limit: limit.max(1) }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub async fn collect(
        &self,
        source: &dyn HistorySource,
        trigger: &InboundEvent,
        self_id: u64,
    ) -> HistoryWindow {
        let (mut events, degraded) = match source.recent(&trigger.channel_id, self.limit).await {
            Ok(events) => (events, None),
            Err(e) => {
                warn!(
                    channel = %trigger.channel_id,
                    error = %e,
                    "DegradedHistory: continuing with the triggering message only"
                );
                (Vec::new(), Some(e.to_string()))
            }
        };

        events.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.message_id.cmp(&b.message_id))
        });
        let mut seen = HashSet::new();
        events.retain(|e| e.message_id != trigger.message_id && seen.insert(e.message_id));

        let skip = events.len().saturating_sub(self.limit - 1);
        let mut turns: Vec<ConversationTurn> = events
            .iter()
            .skip(skip)
            .map(|e| to_turn(e, self_id))
            .collect();
        turns.push(to_turn(trigger, self_id));

        HistoryWindow { turns, degraded }
    }
}

/// Attribute a role relative to the bound identity.
pub fn to_turn(event: &InboundEvent, self_id: u64) -> ConversationTurn {
    let role = if event.author_is_bot || event.author_id == self_id {
        SpeakerRole::SelfIdentity
    } else {
        SpeakerRole::Other
    };
    ConversationTurn {
        message_id: event.message_id,
        role,
        author_name: event.author_name.clone(),
        content: event.content.clone(),
        timestamp: event.created_at,
    }
}

/// Retrieval query for a triggering message: mentions removed, whitespace
/// collapsed, capped at [`MAX_SCENE_QUERY_CHARS`].
pub fn scene_query(content: &str) -> String {
    let stripped = strip_mentions(content);
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return DEFAULT_SCENE_QUERY.to_string();
    }
    collapsed.chars().take(MAX_SCENE_QUERY_CHARS).collect()
}

fn strip_mentions(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find("<@") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let body = after.strip_prefix('!').unwrap_or(after);
        match body.find('>') {
            Some(end) if end > 0 && body[..end].bytes().all(|b| b.is_ascii_digit()) => {
                out.push(' ');
                rest = &body[end + 1..];
            }
            _ => {
                out.push_str("<@");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
