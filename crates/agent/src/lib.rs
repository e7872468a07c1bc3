//! The mention-to-reply pipeline for Homunculus NPCs.
//!
//! A turn runs **Filter → Gather → Build → Complete → Deliver**, then hands
//! a memory extraction job to a detached pool:
//!
//! 1. **Filter**: answer only explicit mentions of the channel's bound identity
//! 2. **Gather**: identity card, recent history, memory retrieval and ruleset
//!    excerpt, concurrently
//! 3. **Build**: assemble the prompt within the token budget
//! 4. **Complete**: one completion call, never retried
//! 5. **Deliver**: post `**Name:** reply` to the channel
//!
//! The [`IdentityManager`] owns per-channel bindings and hot-swaps them; the
//! [`Runtime`] drives turns and operator commands from an event stream.

pub mod commands;
pub mod extraction;
pub mod history;
pub mod identity_manager;
pub mod pipeline;
pub mod prompt;
pub mod reply;
pub mod runtime;
pub mod trigger;

#[cfg(test)]
pub(crate) mod test_support;

pub use commands::{parse_command, CommandHandler, NpcCommand, ParsedCommand};
pub use extraction::{ExtractionJob, MemoryExtractor};
pub use history::{scene_query, HistoryCollector, HistoryWindow};
pub use identity_manager::{BindRequest, IdentityBinding, IdentityManager, SwapReport};
pub use pipeline::{
    CompletionSettings, FailureReason, Orchestrator, PipelineOutcome, PipelineParts, SentTurn,
    TurnState,
};
pub use prompt::{BuiltPrompt, PromptBuilder, PromptError, PromptInput, TokenCounter};
pub use reply::format_reply;
pub use runtime::{RunStats, Runtime};
pub use trigger::should_respond;
