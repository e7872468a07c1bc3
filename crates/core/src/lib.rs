//! # Homunculus Core
//!
//! Domain types, capability traits, and error definitions for the Homunculus
//! NPC runtime. This crate has **no I/O framework dependencies** beyond
//! tokio's sync and fs primitives: it defines the domain model that all other
//! crates implement against.
//!
//! ## Design Philosophy
//!
//! Every consumed capability (chat platform, completion, durable memory,
//! retrieval, identity loading) is defined as a trait here. Implementations
//! live in their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod provider;
pub mod channel;
pub mod memory;
pub mod identity;
pub mod event;

// Re-export key types at crate root for ergonomics
pub use error::{
    ChannelError, CompletionFailureKind, Error, IdentityError, MemoryError, ProviderError,
    Result, SwapError, ValidationIssue,
};
pub use provider::{Provider, ProviderRequest, ProviderResponse, Usage};
pub use channel::{
    ChannelId, ConversationTurn, EventSource, HistorySource, InboundEvent, ReplySender,
    SpeakerRole,
};
pub use memory::{
    ArchiveReceipt, Degradation, DurableMemoryStore, MemoryRecord, Namespace, RetrievalBackend,
    RetrievalMode, RetrievalResult,
};
pub use identity::{CharacterCard, CharacterIdentity, FileIdentitySource, IdentityRef, IdentitySource};
pub use event::{DomainEvent, EventBus};
