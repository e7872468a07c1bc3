//! Token estimation for prompt budgeting.
//!
//! The builder never sees a real tokenizer; it asks a [`TokenCounter`] for an
//! estimate. Both counters here are deterministic and cheap.

/// Estimates the token cost of a piece of prompt text.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// One token per whitespace-separated word. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceCounter;

impl TokenCounter for WhitespaceCounter {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// Character heuristic: 1 token ≈ 4 bytes, rounded up.
///
/// Within ~10% of BPE tokenizers on English text.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharRatioCounter;

impl TokenCounter for CharRatioCounter {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        text.len().div_ceil(4)
    }
}
