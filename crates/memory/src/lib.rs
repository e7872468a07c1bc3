//! Memory system for Homunculus: durable per-namespace logs, retrieval
//! backends and the tiered retrieval adapter.

pub mod builtin;
pub mod daily_log;
pub mod layout;
pub mod qmd;
pub mod retrieval;
pub mod ruleset;
pub mod vector;

pub use builtin::BuiltinIndex;
pub use daily_log::DailyLogStore;
pub use layout::NamespaceLayout;
pub use qmd::{CommandOutput, CommandRunner, QmdBackend, TokioCommandRunner};
pub use retrieval::{normalize_query, MemoryRetrievalAdapter};
pub use ruleset::RulesetLibrary;
pub use vector::{cosine_similarity, reciprocal_rank_fusion};
