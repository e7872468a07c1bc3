//! Console channel: a line-oriented stand-in for a chat platform.
//!
//! Each stdin line is one message:
//!
//! ```text
//! #tavern Ada: <@1001> what did you see at the docks?
//! Ada: lines without a channel tag go to the default channel
//! ```
//!
//! `<@id>` (or `<@!id>`) tokens are mentions. Authors get stable ids in
//! order of first appearance. Replies are printed to stdout and recorded in
//! the channel history as bot messages, so later turns see them.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use homunculus_core::channel::{ChannelId, EventSource, HistorySource, InboundEvent, ReplySender};
use homunculus_core::error::ChannelError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::history::ChannelHistory;

const FIRST_AUTHOR_ID: u64 = 10_000;

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    pub channel: Option<String>,
    pub author: String,
    pub content: String,
}

/// Parse `[#channel] author: content`. Returns `None` for lines that do not
/// carry an author.
pub fn parse_line(line: &str) -> Option<ConsoleLine> {
    let line = line.trim();
    let (channel, rest) = match line.strip_prefix('#') {
        Some(tagged) => {
            let (tag, rest) = tagged.split_once(char::is_whitespace)?;
            (Some(tag.to_string()), rest.trim_start())
        }
        None => (None, line),
    };
    let (author, content) = rest.split_once(':')?;
    let author = author.trim();
    let content = content.trim();
    if author.is_empty() || author.contains(char::is_whitespace) || content.is_empty() {
        return None;
    }
    Some(ConsoleLine {
        channel,
        author: author.to_string(),
        content: content.to_string(),
    })
}

/// User ids mentioned as `<@id>` or `<@!id>`, in order, without repeats.
pub fn parse_mentions(content: &str) -> Vec<u64> {
    let mut ids = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find("<@") {
        rest = &rest[start + 2..];
        let body = rest.strip_prefix('!').unwrap_or(rest);
        let Some(end) = body.find('>') else { break };
        if let Ok(id) = body[..end].parse::<u64>() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

struct ConsoleState {
    default_channel: ChannelId,
    history: Arc<ChannelHistory>,
    next_message_id: AtomicU64,
    next_author_id: AtomicU64,
    authors: DashMap<String, u64>,
    bots: DashMap<ChannelId, u64>,
}

impl ConsoleState {
    fn author_id(&self, name: &str) -> u64 {
        *self
            .authors
            .entry(name.to_lowercase())
            .or_insert_with(|| self.next_author_id.fetch_add(1, Ordering::Relaxed))
    }

    fn event_from(&self, parsed: ConsoleLine) -> InboundEvent {
        let channel_id = parsed
            .channel
            .map(ChannelId::new)
            .unwrap_or_else(|| self.default_channel.clone());
        InboundEvent {
            channel_id,
            author_id: self.author_id(&parsed.author),
            author_name: parsed.author,
            author_is_bot: false,
            message_id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            mentioned_user_ids: parse_mentions(&parsed.content),
            content: parsed.content,
            created_at: Utc::now(),
        }
    }
}

/// Console event source, reply sender and history in one.
#[derive(Clone)]
pub struct ConsoleChannel {
    state: Arc<ConsoleState>,
}

impl ConsoleChannel {
    pub fn new(default_channel: ChannelId, history_capacity: usize) -> Self {
        Self {
            state: Arc::new(ConsoleState {
                default_channel,
                history: Arc::new(ChannelHistory::new(history_capacity)),
                next_message_id: AtomicU64::new(1),
                next_author_id: AtomicU64::new(FIRST_AUTHOR_ID),
                authors: DashMap::new(),
                bots: DashMap::new(),
            }),
        }
    }

    /// Record that replies on `channel` are authored by `user_id`.
    pub fn bind_bot(&self, channel: ChannelId, user_id: u64) {
        self.state.bots.insert(channel, user_id);
    }

    pub fn history(&self) -> Arc<ChannelHistory> {
        self.state.history.clone()
    }

    /// Stream events parsed from `reader` until EOF or an exit command.
    pub fn start_with_reader<R>(&self, reader: R) -> mpsc::Receiver<InboundEvent>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(32);
        let state = self.state.clone();

        tokio::spawn(async move {
            let mut lines = reader.lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if matches!(line, "exit" | "quit" | "/exit" | "/quit" | ":q") {
                            break;
                        }
                        let Some(parsed) = parse_line(line) else {
                            warn!(line, "Ignoring console line, expected '[#channel] author: text'");
                            continue;
                        };
                        let event = state.event_from(parsed);
                        state.history.record(event.clone());
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF (Ctrl+D)
                    Err(e) => {
                        warn!(error = %e, "Console input failed");
                        break;
                    }
                }
            }
            debug!("Console input closed");
        });

        rx
    }
}

#[async_trait]
impl EventSource for ConsoleChannel {
    fn name(&self) -> &str {
        "console"
    }

    async fn start(&self) -> Result<mpsc::Receiver<InboundEvent>, ChannelError> {
        Ok(self.start_with_reader(BufReader::new(io::stdin())))
    }
}

#[async_trait]
impl ReplySender for ConsoleChannel {
    async fn send(&self, channel: &ChannelId, text: &str) -> Result<(), ChannelError> {
        println!("[#{channel}] {text}");

        let author_id = self.state.bots.get(channel).map(|id| *id).unwrap_or(0);
        let author_name = text
            .strip_prefix("**")
            .and_then(|rest| rest.split_once(":**"))
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| "NPC".to_string());
        self.state.history.record(InboundEvent {
            channel_id: channel.clone(),
            author_id,
            author_name,
            author_is_bot: true,
            message_id: self.state.next_message_id.fetch_add(1, Ordering::Relaxed),
            content: text.to_string(),
            mentioned_user_ids: Vec::new(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn send_typing(&self, channel: &ChannelId) -> Result<(), ChannelError> {
        debug!(channel = %channel, "typing...");
        Ok(())
    }
}

#[async_trait]
impl HistorySource for ConsoleChannel {
    async fn recent(&self, channel: &ChannelId, limit: usize) -> Result<Vec<InboundEvent>, ChannelError> {
        self.state.history.recent(channel, limit).await
    }
}
