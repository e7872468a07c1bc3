//! Memory extraction: distil durable facts from a finished turn.
//!
//! Runs detached after a reply is delivered. Every failure is logged and
//! dropped; nothing here can reach the turn that spawned it.

use chrono::Utc;
use homunculus_core::channel::ConversationTurn;
use homunculus_core::event::{DomainEvent, EventBus};
use homunculus_core::memory::{DurableMemoryStore, MemoryRecord, Namespace};
use homunculus_core::provider::{Provider, ProviderRequest};
use std::sync::Arc;
use tracing::{debug, info, warn};

const EXTRACTION_SYSTEM_PROMPT: &str = "Extract durable NPC-specific memory facts from the conversation. \
Return concise markdown bullet points only. \
Do not include transient chatter, tool text, or formatting outside markdown bullets.";

/// Everything one extraction needs, owned so it can outlive the turn.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub turn_id: String,
    pub namespace: Namespace,
    pub identity_name: String,
    /// Oldest first; the last entry is the triggering message.
    pub conversation: Vec<ConversationTurn>,
    /// The memories the reply prompt actually carried.
    pub memories: Vec<MemoryRecord>,
    pub reply: String,
}

pub struct MemoryExtractor {
    provider: Arc<dyn Provider>,
    store: Arc<dyn DurableMemoryStore>,
    model: String,
    max_tokens: u32,
    temperature: f32,
    history_lines: usize,
    events: Option<Arc<EventBus>>,
}

impl MemoryExtractor {
    pub fn new(
        provider: Arc<dyn Provider>,
        store: Arc<dyn DurableMemoryStore>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            store,
            model: model.into(),
            max_tokens: 220,
            temperature: 0.0,
            history_lines: 8,
            events: None,
        }
    }

    pub fn with_limits(mut self, max_tokens: u32, temperature: f32, history_lines: usize) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self.history_lines = history_lines.max(1);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build_request(&self, job: &ExtractionJob) -> ProviderRequest {
        let skip = job.conversation.len().saturating_sub(self.history_lines);
        let lines: Vec<String> = job
            .conversation
            .iter()
            .skip(skip)
            .map(|t| format!("- [{}][{}] {}", t.role.as_str(), t.author_name, t.content.trim()))
            .collect();

        let mut prompt = format!(
            "NPC: {}\n\nRecent conversation:\n{}\n\n",
            job.identity_name,
            lines.join("\n")
        );
        if !job.memories.is_empty() {
            let known: Vec<String> = job.memories.iter().map(|m| format!("- {}", m.text.trim())).collect();
            prompt.push_str(&format!("Already remembered:\n{}\n\n", known.join("\n")));
        }
        prompt.push_str(&format!(
            "NPC response:\n{}\n\nExtract durable memory facts about this NPC as markdown bullet points.",
            job.reply.trim()
        ));

        ProviderRequest {
            model: self.model.clone(),
            system: Some(EXTRACTION_SYSTEM_PROMPT.to_string()),
            prompt,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    /// Run one extraction. Returns whether a fact block was appended.
    pub async fn run(&self, job: ExtractionJob) -> bool {
        let (appended, error) = match self.extract(&job).await {
            Ok(appended) => (appended, None),
            Err(e) => {
                warn!(
                    turn_id = %job.turn_id,
                    namespace = %job.namespace,
                    error = %e,
                    "Memory extraction failed"
                );
                (false, Some(e))
            }
        };

        if let Some(events) = &self.events {
            events.publish(DomainEvent::ExtractionFinished {
                turn_id: job.turn_id.clone(),
                namespace: job.namespace.name.clone(),
                appended,
                error,
                timestamp: Utc::now(),
            });
        }
        appended
    }

    async fn extract(&self, job: &ExtractionJob) -> Result<bool, String> {
        let response = self
            .provider
            .complete(self.build_request(job))
            .await
            .map_err(|e| format!("completion: {e}"))?;

        let facts = response.text.trim();
        if facts.is_empty() {
            debug!(turn_id = %job.turn_id, "Extraction produced nothing to remember");
            return Ok(false);
        }

        let record = self
            .store
            .append(&job.namespace, facts)
            .await
            .map_err(|e| format!("append: {e}"))?;
        info!(
            turn_id = %job.turn_id,
            namespace = %job.namespace,
            source = %record.source,
            "Memory facts appended"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{turn_of, ScriptedProvider, TestEnv};
    use homunculus_core::channel::SpeakerRole;
    use homunculus_core::error::ProviderError;

    fn job(namespace: Namespace) -> ExtractionJob {
        ExtractionJob {
            turn_id: "turn-1".into(),
            namespace,
            identity_name: "Kovach".into(),
            conversation: (1..=10)
                .map(|i| turn_of(i, SpeakerRole::Other, "Ada", &format!("line {i}")))
                .collect(),
            memories: vec![],
            reply: " I saw a lantern on the water. ".into(),
        }
    }

    #[tokio::test]
    async fn appends_distilled_facts() {
        let env = TestEnv::new();
        let ns = env.store.provision("kovach").await.unwrap();
        let provider = ScriptedProvider::new(vec![Ok("- Kovach saw a lantern on the water".into())]);
        let extractor = MemoryExtractor::new(provider.clone(), env.store.clone(), "claude-haiku-4-5");

        assert!(extractor.run(job(ns)).await);
        let records = env.store.read_all("kovach").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "- Kovach saw a lantern on the water");

        let request = &provider.requests()[0];
        assert_eq!(request.max_tokens, 220);
        assert!(request.prompt.contains("NPC: Kovach"));
        assert!(request.prompt.contains("- [user][Ada] line 10"));
        assert!(!request.prompt.contains("line 2\n"));
        assert!(request.prompt.contains("NPC response:\nI saw a lantern on the water."));
    }

    #[tokio::test]
    async fn failures_are_swallowed_and_reported() {
        let env = TestEnv::new();
        let mut events = env.events.subscribe();
        let ns = env.store.provision("kovach").await.unwrap();
        let provider = ScriptedProvider::new(vec![Err(ProviderError::Network("reset".into()))]);
        let extractor = MemoryExtractor::new(provider, env.store.clone(), "m").with_events(env.events.clone());

        assert!(!extractor.run(job(ns)).await);
        assert!(env.store.read_all("kovach").await.unwrap().is_empty());
        let event = events.recv().await.unwrap();
        assert!(matches!(
            event.as_ref(),
            DomainEvent::ExtractionFinished { appended: false, error: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn blank_completion_appends_nothing() {
        let env = TestEnv::new();
        let ns = env.store.provision("kovach").await.unwrap();
        let provider = ScriptedProvider::new(vec![Ok("   ".into())]);
        let extractor = MemoryExtractor::new(provider, env.store.clone(), "m");
        assert!(!extractor.run(job(ns)).await);
        assert!(env.store.read_all("kovach").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retired_namespace_rejects_late_write() {
        let env = TestEnv::new();
        let ns = env.store.provision("kovach").await.unwrap();
        env.store.archive(&ns).await.unwrap();
        let provider = ScriptedProvider::new(vec![Ok("- late fact".into())]);
        let extractor = MemoryExtractor::new(provider, env.store.clone(), "m");
        assert!(!extractor.run(job(ns)).await);
    }
}
