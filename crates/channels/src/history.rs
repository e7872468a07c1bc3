//! In-process channel history: a bounded ring of recent messages per channel.

use async_trait::async_trait;
use dashmap::DashMap;
use homunculus_core::channel::{ChannelId, HistorySource, InboundEvent};
use homunculus_core::error::ChannelError;
use std::collections::VecDeque;

pub struct ChannelHistory {
    capacity: usize,
    channels: DashMap<ChannelId, VecDeque<InboundEvent>>,
}

impl ChannelHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: DashMap::new(),
        }
    }

    /// Remember `event`, evicting the oldest message once the ring is full.
    pub fn record(&self, event: InboundEvent) {
        let mut ring = self.channels.entry(event.channel_id.clone()).or_default();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    pub fn len(&self, channel: &ChannelId) -> usize {
        self.channels.get(channel).map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl HistorySource for ChannelHistory {
    async fn recent(&self, channel: &ChannelId, limit: usize) -> Result<Vec<InboundEvent>, ChannelError> {
        let Some(ring) = self.channels.get(channel) else {
            return Ok(Vec::new());
        };
        let skip = ring.len().saturating_sub(limit);
        Ok(ring.iter().skip(skip).cloned().collect())
    }
}
