//! Channel adapters for Homunculus.
//!
//! The pipeline talks to a chat platform only through the [`EventSource`],
//! [`ReplySender`] and [`HistorySource`] contracts. This crate provides:
//! - **Console**: stdin/stdout stand-in for a platform, one line per message
//! - **ChannelHistory**: bounded per-channel ring of recent messages
//!
//! [`EventSource`]: homunculus_core::channel::EventSource
//! [`ReplySender`]: homunculus_core::channel::ReplySender
//! [`HistorySource`]: homunculus_core::channel::HistorySource

pub mod console;
pub mod history;

pub use console::{parse_line, parse_mentions, ConsoleChannel, ConsoleLine};
pub use history::ChannelHistory;
