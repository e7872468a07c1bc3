//! Prompt assembly under a token budget.

pub mod builder;
pub mod token;

pub use builder::{
    BuiltPrompt, PromptBuilder, PromptError, PromptInput, Section, SectionCost, TruncationTrace,
    RESPONSE_INSTRUCTION,
};
pub use token::{CharRatioCounter, TokenCounter, WhitespaceCounter};
