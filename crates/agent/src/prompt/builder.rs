//! Budgeted prompt assembly.
//!
//! A prompt is five sections in a fixed order:
//!
//! | Section | Lives in | Under pressure |
//! |---------|----------|----------------|
//! | Persona (card, stats, skills, inventory) | system | never trimmed |
//! | Ruleset excerpt | system | word-truncated last, dropped if only the label fits |
//! | Memory highlights | system | lowest-ranked record dropped first |
//! | Recent conversation | user | oldest turn dropped first, triggering message kept |
//! | Response instruction | user | never trimmed |
//!
//! The estimate is the sum of the section costs; an empty section costs
//! nothing and renders nothing. Assembly is deterministic: the same input
//! always yields byte-identical output.

use homunculus_core::channel::ConversationTurn;
use homunculus_core::identity::{CharacterCard, CharacterIdentity};
use homunculus_core::memory::MemoryRecord;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

use super::token::{TokenCounter, WhitespaceCounter};

const RULESET_LABEL: &str = "Game rules reference:";
const MEMORY_LABEL: &str = "Memory highlights:";
const HISTORY_LABEL: &str = "Recent conversation:";
pub const RESPONSE_INSTRUCTION: &str =
    "Someone is speaking to you now. Reply naturally in-character and keep it concise.";

// ── Types ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Persona,
    Ruleset,
    Memory,
    History,
    Instruction,
}

/// Everything one prompt is built from.
pub struct PromptInput<'a> {
    pub identity: &'a CharacterIdentity,
    pub ruleset_excerpt: &'a str,
    /// Ranked, best first.
    pub memories: &'a [MemoryRecord],
    /// Oldest first; the last entry is the triggering message.
    pub history: &'a [ConversationTurn],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SectionCost {
    pub section: Section,
    pub tokens: usize,
}

/// What budget enforcement removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TruncationTrace {
    pub history_dropped: usize,
    pub memories_dropped: usize,
    pub ruleset_words_dropped: usize,
    pub ruleset_dropped: bool,
}

impl TruncationTrace {
    pub fn is_truncated(&self) -> bool {
        self.history_dropped > 0 || self.memories_dropped > 0 || self.ruleset_words_dropped > 0
    }
}

/// A prompt ready for the completion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltPrompt {
    pub system: String,
    pub user: String,
    /// Sum of `sections`, never above `budget`.
    pub estimated_tokens: usize,
    pub budget: usize,
    /// One entry per section, in prompt order.
    pub sections: Vec<SectionCost>,
    pub included_memories: usize,
    pub included_history: usize,
    pub trace: TruncationTrace,
}

impl BuiltPrompt {
    pub fn cost_of(&self, section: Section) -> usize {
        self.sections
            .iter()
            .find(|s| s.section == section)
            .map(|s| s.tokens)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromptError {
    /// Persona plus the triggering message alone do not fit.
    #[error("persona and triggering message need {required} tokens, budget is {budget}")]
    BudgetUnsatisfiable { required: usize, budget: usize },
}

// ── Builder ───────────────────────────────────────────────────────────────

/// The prompt builder. Stateless; create one and reuse it.
#[derive(Clone)]
pub struct PromptBuilder {
    budget: usize,
    counter: Arc<dyn TokenCounter>,
}

impl PromptBuilder {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            counter: Arc::new(WhitespaceCounter),
        }
    }

    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    fn cost(&self, text: &str) -> usize {
        if text.is_empty() {
            0
        } else {
            self.counter.count(text)
        }
    }

    pub fn build(&self, input: &PromptInput<'_>) -> Result<BuiltPrompt, PromptError> {
        let budget = self.budget;
        let persona = render_persona(&input.identity.card);
        let persona_cost = self.cost(&persona);
        let instruction_cost = self.cost(RESPONSE_INSTRUCTION);

        let (trigger, older) = match input.history.split_last() {
            Some((trigger, older)) => (Some(trigger), older),
            None => (None, &[][..]),
        };

        let trigger_only: Vec<&ConversationTurn> = trigger.into_iter().collect();
        let required = persona_cost + self.cost(&render_history(&trigger_only)) + instruction_cost;
        if required > budget {
            return Err(PromptError::BudgetUnsatisfiable { required, budget });
        }

        let mut trace = TruncationTrace::default();
        let fixed = persona_cost + instruction_cost;

        let excerpt = input.ruleset_excerpt.trim();
        let mut ruleset = render_ruleset(excerpt);
        let mut ruleset_cost = self.cost(&ruleset);

        let mut memories: Vec<&MemoryRecord> = input.memories.iter().collect();
        let mut memory = render_memories(&memories);
        let mut memory_cost = self.cost(&memory);

        let mut kept_older: VecDeque<&ConversationTurn> = older.iter().collect();
        let mut history = render_history(&history_turns(&kept_older, trigger));
        let mut history_cost = self.cost(&history);

        // 1. Oldest history first, never the triggering message.
        while fixed + ruleset_cost + memory_cost + history_cost > budget && !kept_older.is_empty() {
            kept_older.pop_front();
            trace.history_dropped += 1;
            history = render_history(&history_turns(&kept_older, trigger));
            history_cost = self.cost(&history);
        }

        // 2. Lowest-ranked memories.
        while fixed + ruleset_cost + memory_cost + history_cost > budget && !memories.is_empty() {
            memories.pop();
            trace.memories_dropped += 1;
            memory = render_memories(&memories);
            memory_cost = self.cost(&memory);
        }

        // 3. Ruleset excerpt, word by word.
        let over = fixed + ruleset_cost + memory_cost + history_cost;
        if over > budget && !ruleset.is_empty() {
            let available = budget.saturating_sub(over - ruleset_cost);
            let words: Vec<&str> = excerpt.split_whitespace().collect();
            let kept = self.fit_words(&words, available);
            ruleset = if kept == 0 {
                trace.ruleset_dropped = true;
                String::new()
            } else {
                render_ruleset(&words[..kept].join(" "))
            };
            ruleset_cost = self.cost(&ruleset);
            trace.ruleset_words_dropped = words.len() - kept;
        }

        let sections = vec![
            SectionCost { section: Section::Persona, tokens: persona_cost },
            SectionCost { section: Section::Ruleset, tokens: ruleset_cost },
            SectionCost { section: Section::Memory, tokens: memory_cost },
            SectionCost { section: Section::History, tokens: history_cost },
            SectionCost { section: Section::Instruction, tokens: instruction_cost },
        ];
        let estimated_tokens = sections.iter().map(|s| s.tokens).sum();

        Ok(BuiltPrompt {
            system: join_sections(&[&persona, &ruleset, &memory]),
            user: join_sections(&[&history, RESPONSE_INSTRUCTION]),
            estimated_tokens,
            budget,
            sections,
            included_memories: memories.len(),
            included_history: kept_older.len() + trigger_only.len(),
            trace,
        })
    }

    /// Largest number of leading words whose labelled rendering fits.
    fn fit_words(&self, words: &[&str], available: usize) -> usize {
        let (mut lo, mut hi) = (0, words.len());
        while lo < hi {
            let mid = (lo + hi).div_ceil(2);
            if self.cost(&render_ruleset(&words[..mid].join(" "))) <= available {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        lo
    }
}

// ── Rendering ─────────────────────────────────────────────────────────────

fn render_persona(card: &CharacterCard) -> String {
    let stats = card
        .stats
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(", ");
    let skills = if card.skills.is_empty() {
        "(none)".to_string()
    } else {
        card.skills
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let inventory = if card.inventory.is_empty() {
        "(none)".to_string()
    } else {
        card.inventory.join(", ")
    };

    format!(
        "You are {}, a TTRPG character.\n\
         Description: {}\n\
         Personality: {}\n\
         Background: {}\n\n\
         Stats: {stats}\n\
         Skills: {skills}\n\
         Inventory: {inventory}",
        card.name, card.description, card.personality, card.background
    )
}

fn render_ruleset(excerpt: &str) -> String {
    if excerpt.is_empty() {
        return String::new();
    }
    format!("{RULESET_LABEL}\n{excerpt}")
}

fn render_memories(records: &[&MemoryRecord]) -> String {
    if records.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = records
        .iter()
        .map(|r| {
            format!(
                "- {} (source={}, score={:.3})",
                single_line(&r.text),
                r.source,
                r.score
            )
        })
        .collect();
    format!("{MEMORY_LABEL}\n{}", lines.join("\n"))
}

/// The kept older turns followed by the trigger, oldest first.
fn history_turns<'t>(
    older: &VecDeque<&'t ConversationTurn>,
    trigger: Option<&'t ConversationTurn>,
) -> Vec<&'t ConversationTurn> {
    older.iter().copied().chain(trigger).collect()
}

fn render_history(turns: &[&ConversationTurn]) -> String {
    if turns.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = turns
        .iter()
        .map(|t| {
            format!(
                "[{}][{}] {}",
                t.role.as_str(),
                t.author_name,
                single_line(&t.content)
            )
        })
        .collect();
    format!("{HISTORY_LABEL}\n{}", lines.join("\n"))
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn join_sections(sections: &[&str]) -> String {
    sections
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::token::CharRatioCounter;
    use chrono::{TimeZone, Utc};
    use homunculus_core::channel::SpeakerRole;
    use std::collections::BTreeMap;

    fn kovach() -> CharacterIdentity {
        CharacterIdentity {
            card: CharacterCard {
                name: "Kovach".into(),
                description: "A weathered dock foreman.".into(),
                personality: "Gruff, loyal, superstitious.".into(),
                background: "Worked the Arkham docks for twenty years.".into(),
                stats: vec![("STR".into(), 70), ("SAN".into(), 45)],
                skills: BTreeMap::from([("Spot Hidden".into(), 45), ("Brawl".into(), 60)]),
                inventory: vec!["crowbar".into()],
            },
            ruleset_id: "coc7e".into(),
            namespace: "kovach".into(),
        }
    }

    fn turn(id: u64, role: SpeakerRole, author: &str, content: &str) -> ConversationTurn {
        ConversationTurn {
            message_id: id,
            role,
            author_name: author.into(),
            content: content.into(),
            timestamp: Utc.with_ymd_and_hms(2026, 10, 16, 20, 0, id as u32 % 60).unwrap(),
        }
    }

    fn memory(text: &str, score: f32) -> MemoryRecord {
        MemoryRecord {
            text: text.into(),
            source: "2026-10-15.md".into(),
            timestamp: None,
            namespace: "kovach".into(),
            score,
        }
    }

    fn history() -> Vec<ConversationTurn> {
        vec![
            turn(1, SpeakerRole::Other, "Ada", "Evening, all."),
            turn(2, SpeakerRole::SelfIdentity, "Kovach", "Evening. Mind the ropes."),
            turn(3, SpeakerRole::Other, "Bob", "Did the ship come in?"),
            turn(4, SpeakerRole::Other, "Ada", "<@1001> what did you see on the pier last night?"),
        ]
    }

    fn memories() -> Vec<MemoryRecord> {
        vec![
            memory("Kovach saw a lantern on the water", 0.92),
            memory("Kovach owes the harbourmaster twelve dollars", 0.41),
        ]
    }

    const EXCERPT: &str = "Spot Hidden: roll d100 under skill. Hard success is half skill.";

    fn input<'a>(
        identity: &'a CharacterIdentity,
        memories: &'a [MemoryRecord],
        history: &'a [ConversationTurn],
    ) -> PromptInput<'a> {
        PromptInput {
            identity,
            ruleset_excerpt: EXCERPT,
            memories,
            history,
        }
    }

    #[test]
    fn full_prompt_contains_every_section_in_order() {
        let identity = kovach();
        let (mems, hist) = (memories(), history());
        let prompt = PromptBuilder::new(2000).build(&input(&identity, &mems, &hist)).unwrap();

        assert!(prompt.system.starts_with("You are Kovach, a TTRPG character."));
        assert!(prompt.system.contains("Skills: Brawl=60, Spot Hidden=45"));
        let ruleset_at = prompt.system.find(RULESET_LABEL).unwrap();
        let memory_at = prompt.system.find(MEMORY_LABEL).unwrap();
        assert!(ruleset_at < memory_at);
        assert!(prompt.system.contains("- Kovach saw a lantern on the water (source=2026-10-15.md, score=0.920)"));

        assert!(prompt.user.starts_with("Recent conversation:\n[user][Ada] Evening, all."));
        assert!(prompt.user.contains("[assistant][Kovach] Evening. Mind the ropes."));
        assert!(prompt.user.ends_with(RESPONSE_INSTRUCTION));
        assert_eq!(prompt.included_memories, 2);
        assert_eq!(prompt.included_history, 4);
        assert!(!prompt.trace.is_truncated());
        assert_eq!(
            prompt.estimated_tokens,
            prompt.sections.iter().map(|s| s.tokens).sum::<usize>()
        );
    }

    #[test]
    fn identical_input_is_byte_identical() {
        let identity = kovach();
        let (mems, hist) = (memories(), history());
        let builder = PromptBuilder::new(60);
        let a = builder.build(&input(&identity, &mems, &hist)).unwrap();
        let b = builder.build(&input(&identity, &mems, &hist)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_sections_cost_nothing() {
        let identity = kovach();
        let hist = vec![turn(9, SpeakerRole::Other, "Ada", "<@1001> hello")];
        let prompt = PromptBuilder::new(2000)
            .build(&PromptInput {
                identity: &identity,
                ruleset_excerpt: "   ",
                memories: &[],
                history: &hist,
            })
            .unwrap();
        assert_eq!(prompt.cost_of(Section::Ruleset), 0);
        assert_eq!(prompt.cost_of(Section::Memory), 0);
        assert!(!prompt.system.contains(MEMORY_LABEL));
        assert!(!prompt.system.contains(RULESET_LABEL));
    }

    #[test]
    fn persona_and_trigger_over_budget_is_unsatisfiable() {
        let identity = kovach();
        let (mems, hist) = (memories(), history());
        let err = PromptBuilder::new(10)
            .build(&input(&identity, &mems, &hist))
            .unwrap_err();
        let PromptError::BudgetUnsatisfiable { required, budget } = err;
        assert_eq!(budget, 10);
        assert!(required > 10);
    }

    #[test]
    fn truncation_order_history_then_memories_then_ruleset() {
        let identity = kovach();
        let (mems, hist) = (memories(), history());
        let full = PromptBuilder::new(10_000).build(&input(&identity, &mems, &hist)).unwrap();
        let total = full.estimated_tokens;

        // One token short: only history goes.
        let p = PromptBuilder::new(total - 1).build(&input(&identity, &mems, &hist)).unwrap();
        assert!(p.trace.history_dropped >= 1);
        assert_eq!(p.trace.memories_dropped, 0);
        assert_eq!(p.trace.ruleset_words_dropped, 0);
        assert!(p.user.contains("what did you see on the pier"));
        assert!(!p.user.contains("Evening, all."));

        // All older history gone and still short: the lowest-ranked memory goes.
        let trigger_only = PromptBuilder::new(10_000)
            .build(&input(&identity, &mems, &hist[3..]))
            .unwrap();
        let p = PromptBuilder::new(trigger_only.estimated_tokens - 1)
            .build(&input(&identity, &mems, &hist))
            .unwrap();
        assert_eq!(p.trace.history_dropped, 3);
        assert_eq!(p.trace.memories_dropped, 1);
        assert_eq!(p.trace.ruleset_words_dropped, 0);
        assert!(p.system.contains("lantern"));
        assert!(!p.system.contains("harbourmaster"));

        // Only then is the ruleset cut, word by word.
        let required = trigger_only.estimated_tokens
            - trigger_only.cost_of(Section::Ruleset)
            - trigger_only.cost_of(Section::Memory);
        let ruleset_cost = trigger_only.cost_of(Section::Ruleset);
        let p = PromptBuilder::new(required + ruleset_cost - 2)
            .build(&input(&identity, &mems, &hist))
            .unwrap();
        assert_eq!(p.trace.memories_dropped, 2);
        assert_eq!(p.trace.ruleset_words_dropped, 2);
        assert!(!p.trace.ruleset_dropped);
        assert!(p.system.contains("Hard success is"));
        assert!(!p.system.contains("half skill."));

        // Label alone is not worth keeping.
        let p = PromptBuilder::new(required + 3)
            .build(&input(&identity, &mems, &hist))
            .unwrap();
        assert!(p.trace.ruleset_dropped);
        assert_eq!(p.cost_of(Section::Ruleset), 0);
        assert_eq!(p.estimated_tokens, required);
    }

    #[test]
    fn kept_history_stays_in_order_with_trigger_last() {
        let hist = history();
        let (trigger, older) = hist.split_last().unwrap();
        let mut kept: VecDeque<&ConversationTurn> = older.iter().collect();
        kept.pop_front();
        let ids: Vec<u64> = history_turns(&kept, Some(trigger)).iter().map(|t| t.message_id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert!(history_turns(&VecDeque::new(), None).is_empty());

        // Through the builder: the dropped turn is gone, the rest keep their order.
        let identity = kovach();
        let mems = memories();
        let full = PromptBuilder::new(10_000).build(&input(&identity, &mems, &hist)).unwrap();
        let p = PromptBuilder::new(full.estimated_tokens - 1)
            .build(&input(&identity, &mems, &hist))
            .unwrap();
        assert_eq!(p.trace.history_dropped, 1);
        let ropes = p.user.find("Mind the ropes").unwrap();
        let ship = p.user.find("Did the ship come in").unwrap();
        let pier = p.user.find("what did you see on the pier").unwrap();
        assert!(ropes < ship && ship < pier);
    }

    #[test]
    fn estimate_never_exceeds_budget() {
        let identity = kovach();
        let (mems, hist) = (memories(), history());
        for counter in [
            Arc::new(WhitespaceCounter) as Arc<dyn TokenCounter>,
            Arc::new(CharRatioCounter),
        ] {
            let full = PromptBuilder::new(100_000)
                .with_counter(counter.clone())
                .build(&input(&identity, &mems, &hist))
                .unwrap();
            let mut satisfiable = 0;
            for budget in 1..=full.estimated_tokens {
                let builder = PromptBuilder::new(budget).with_counter(counter.clone());
                if let Ok(p) = builder.build(&input(&identity, &mems, &hist)) {
                    assert!(p.estimated_tokens <= budget);
                    assert!(p.user.contains("what did you see on the pier"));
                    satisfiable += 1;
                }
            }
            assert!(satisfiable > 0);
        }
    }
}
