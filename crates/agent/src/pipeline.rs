//! The mention-to-reply pipeline.
//!
//! One [`Orchestrator::handle`] call is one turn:
//!
//! ```text
//! Filtering -> Gathering -> Building -> Completing -> Delivering -> (detached) Extracting
//! ```
//!
//! Gathering fans out identity load, history, retrieval and the ruleset
//! excerpt concurrently. Degraded history or retrieval only shrink the
//! prompt; the turn fails only on an unloadable identity, an unsatisfiable
//! budget, a completion error or a delivery error. Nothing is retried.

use chrono::Utc;
use homunculus_config::AppConfig;
use homunculus_core::channel::{HistorySource, InboundEvent, ReplySender};
use homunculus_core::error::CompletionFailureKind;
use homunculus_core::event::{DomainEvent, EventBus};
use homunculus_core::memory::RetrievalMode;
use homunculus_core::provider::{Provider, ProviderRequest, Usage};
use homunculus_memory::{MemoryRetrievalAdapter, RulesetLibrary};
use homunculus_telemetry::PricingTable;
use homunculus_workflow::DetachedTasks;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::extraction::{ExtractionJob, MemoryExtractor};
use crate::history::{scene_query, HistoryCollector};
use crate::identity_manager::{IdentityBinding, IdentityManager};
use crate::prompt::{PromptBuilder, PromptError, PromptInput};
use crate::reply::format_reply;
use crate::trigger;

/// Where a turn is. Logged at debug level on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Filtering,
    Gathering,
    Building,
    Completing,
    Delivering,
    Extracting,
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Filtering => "filtering",
            Self::Gathering => "gathering",
            Self::Building => "building",
            Self::Completing => "completing",
            Self::Delivering => "delivering",
            Self::Extracting => "extracting",
        };
        f.write_str(s)
    }
}

/// Why a triggered turn ended without a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    BudgetUnsatisfiable { required: usize, budget: usize },
    Completion(CompletionFailureKind),
    Delivery(String),
    IdentityLoad(String),
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BudgetUnsatisfiable { .. } => "budget_unsatisfiable",
            Self::Completion(_) => "completion",
            Self::Delivery(_) => "delivery",
            Self::IdentityLoad(_) => "identity_load",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BudgetUnsatisfiable { required, budget } => {
                write!(f, "prompt needs {required} tokens, budget is {budget}")
            }
            Self::Completion(kind) => write!(f, "completion failed: {kind}"),
            Self::Delivery(reason) => write!(f, "delivery failed: {reason}"),
            Self::IdentityLoad(reason) => write!(f, "identity load failed: {reason}"),
        }
    }
}

/// A delivered turn.
#[derive(Debug, Clone)]
pub struct SentTurn {
    pub turn_id: String,
    /// The text as delivered, speaker prefix included.
    pub reply: String,
    pub retrieval_mode: Option<RetrievalMode>,
    /// History or retrieval answered with less than they should have.
    pub degraded: bool,
    pub prompt_tokens: usize,
    pub usage: Option<Usage>,
    pub extraction_scheduled: bool,
}

#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Skipped,
    Sent(SentTurn),
    Failed(FailureReason),
}

impl PipelineOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Sent(_) => "sent",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent(_))
    }
}

/// Model settings for the reply completion.
#[derive(Debug, Clone)]
pub struct CompletionSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model: config.model.name.clone(),
            max_tokens: config.model.max_tokens,
            temperature: config.model.temperature,
        }
    }
}

/// Collaborators of the orchestrator.
pub struct PipelineParts {
    pub identities: Arc<IdentityManager>,
    pub history: Arc<dyn HistorySource>,
    pub sender: Arc<dyn ReplySender>,
    pub provider: Arc<dyn Provider>,
    pub retrieval: Arc<MemoryRetrievalAdapter>,
    pub rulesets: Arc<RulesetLibrary>,
    pub prompt: PromptBuilder,
    pub collector: HistoryCollector,
    pub completion: CompletionSettings,
    /// `None` disables extraction.
    pub extractor: Option<Arc<MemoryExtractor>>,
    pub detached: Arc<DetachedTasks>,
    pub pricing: PricingTable,
    pub events: Option<Arc<EventBus>>,
}

pub struct Orchestrator {
    parts: PipelineParts,
}

impl Orchestrator {
    pub fn new(parts: PipelineParts) -> Self {
        Self { parts }
    }

    pub fn identities(&self) -> &Arc<IdentityManager> {
        &self.parts.identities
    }

    pub fn completion(&self) -> &CompletionSettings {
        &self.parts.completion
    }

    /// Whether `event` would start a turn right now.
    pub async fn is_triggered(&self, event: &InboundEvent) -> bool {
        let binding = self.parts.identities.current(&event.channel_id).await;
        trigger::should_respond(event, binding.as_deref())
    }

    /// Run one turn for `event`.
    pub async fn handle(&self, event: &InboundEvent) -> PipelineOutcome {
        let started = Instant::now();
        debug!(channel = %event.channel_id, message_id = event.message_id, state = %TurnState::Filtering);

        let binding = self.parts.identities.current(&event.channel_id).await;
        if let Err(reason) = trigger::evaluate(event, binding.as_deref()) {
            debug!(
                channel = %event.channel_id,
                message_id = event.message_id,
                reason = reason.as_str(),
                "Event skipped"
            );
            return PipelineOutcome::Skipped;
        }
        let Some(binding) = binding else {
            return PipelineOutcome::Skipped;
        };

        let turn_id = uuid::Uuid::new_v4().to_string();
        let outcome = self.run_turn(&turn_id, event, &binding).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Some(events) = &self.parts.events {
            events.publish(DomainEvent::TurnCompleted {
                turn_id,
                channel: event.channel_id.to_string(),
                namespace: Some(binding.namespace.name.clone()),
                outcome: outcome.label().to_string(),
                duration_ms,
                timestamp: Utc::now(),
            });
        }
        outcome
    }

    async fn run_turn(
        &self,
        turn_id: &str,
        event: &InboundEvent,
        binding: &IdentityBinding,
    ) -> PipelineOutcome {
        let parts = &self.parts;
        let channel = &event.channel_id;
        let namespace = binding.namespace.name.as_str();
        debug!(turn_id, channel = %channel, namespace, state = %TurnState::Gathering);

        let query = scene_query(&event.content);
        let (identity, window, retrieval, excerpt) = tokio::join!(
            parts.identities.load_identity(binding),
            parts.collector.collect(parts.history.as_ref(), event, binding.bot_user_id),
            parts.retrieval.retrieve(namespace, &query),
            parts.rulesets.excerpt(&binding.ruleset_id),
        );

        let identity = match identity {
            Ok(identity) => identity,
            Err(e) => {
                error!(turn_id, channel = %channel, namespace, error = %e, "Turn failed: identity could not be loaded");
                return PipelineOutcome::Failed(FailureReason::IdentityLoad(e.to_string()));
            }
        };
        if let Some(reason) = &window.degraded {
            warn!(turn_id, channel = %channel, namespace, reason = %reason, "DegradedHistory");
        }
        if retrieval.is_degraded() {
            warn!(
                turn_id,
                channel = %channel,
                namespace,
                used_fallback = retrieval.used_fallback(),
                records = retrieval.records.len(),
                "DegradedRetrieval"
            );
        }

        debug!(turn_id, state = %TurnState::Building);
        let prompt = match parts.prompt.build(&PromptInput {
            identity: &identity,
            ruleset_excerpt: &excerpt,
            memories: &retrieval.records,
            history: &window.turns,
        }) {
            Ok(prompt) => prompt,
            Err(PromptError::BudgetUnsatisfiable { required, budget }) => {
                error!(turn_id, channel = %channel, namespace, required, budget, "Turn failed: BudgetUnsatisfiable");
                return PipelineOutcome::Failed(FailureReason::BudgetUnsatisfiable { required, budget });
            }
        };
        if prompt.trace.is_truncated() {
            debug!(
                turn_id,
                history_dropped = prompt.trace.history_dropped,
                memories_dropped = prompt.trace.memories_dropped,
                ruleset_words_dropped = prompt.trace.ruleset_words_dropped,
                "Prompt truncated to budget"
            );
        }

        debug!(turn_id, state = %TurnState::Completing);
        let request = ProviderRequest {
            model: parts.completion.model.clone(),
            system: Some(prompt.system.clone()),
            prompt: prompt.user.clone(),
            temperature: parts.completion.temperature,
            max_tokens: parts.completion.max_tokens,
        };
        let response = match parts.provider.complete(request).await {
            Ok(response) if !response.text.trim().is_empty() => response,
            Ok(_) => {
                error!(turn_id, channel = %channel, namespace, "Turn failed: empty completion");
                return PipelineOutcome::Failed(FailureReason::Completion(CompletionFailureKind::Unavailable));
            }
            Err(e) => {
                let kind = e.failure_kind();
                error!(turn_id, channel = %channel, namespace, kind = %kind, error = %e, "Turn failed: completion");
                return PipelineOutcome::Failed(FailureReason::Completion(kind));
            }
        };

        debug!(turn_id, state = %TurnState::Delivering);
        let reply = format_reply(identity.name(), &response.text, None);
        if let Err(e) = parts.sender.send(channel, &reply).await {
            error!(turn_id, channel = %channel, namespace, error = %e, "Turn failed: delivery");
            return PipelineOutcome::Failed(FailureReason::Delivery(e.to_string()));
        }

        let (input_tokens, output_tokens) = response
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));
        let cost = parts
            .pricing
            .estimate_cost(&response.model, input_tokens, output_tokens);
        info!(
            turn_id,
            channel = %channel,
            namespace,
            retrieval_mode = retrieval.mode.map(|m| m.as_str()).unwrap_or("none"),
            prompt_tokens = prompt.estimated_tokens,
            model = %response.model,
            input_tokens,
            output_tokens,
            cost_usd = cost.unwrap_or(0.0),
            "Reply sent"
        );

        let extraction_scheduled = match &parts.extractor {
            Some(extractor) => {
                debug!(turn_id, state = %TurnState::Extracting);
                let job = ExtractionJob {
                    turn_id: turn_id.to_string(),
                    namespace: binding.namespace.clone(),
                    identity_name: identity.name().to_string(),
                    conversation: window.turns.clone(),
                    memories: retrieval.records[..prompt.included_memories].to_vec(),
                    reply: response.text.clone(),
                };
                let extractor = extractor.clone();
                let scheduled = parts.detached.spawn(async move {
                    extractor.run(job).await;
                });
                if !scheduled {
                    warn!(turn_id, namespace, "Extraction pool full, skipping memory extraction");
                }
                scheduled
            }
            None => false,
        };

        PipelineOutcome::Sent(SentTurn {
            turn_id: turn_id.to_string(),
            reply,
            retrieval_mode: retrieval.mode,
            degraded: window.degraded.is_some() || retrieval.is_degraded(),
            prompt_tokens: prompt.estimated_tokens,
            usage: response.usage,
            extraction_scheduled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{event, memory, ScriptedProvider, TestEnv};
    use homunculus_core::channel::ChannelId;
    use homunculus_core::error::ProviderError;
    use homunculus_core::memory::DurableMemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn mention_produces_reply_and_detached_extraction() {
        let env = TestEnv::new();
        env.backend.set_records(
            "kovach",
            vec![memory("Kovach saw a lantern on the water", 0.9), memory("Kovach fears deep water", 0.4)],
        );
        let provider = ScriptedProvider::new(vec![
            Ok("I saw a light out past the pier.".into()),
            Ok("- Kovach saw a light past the pier".into()),
        ]);
        let (orchestrator, sender) = env.orchestrator(provider.clone()).await;

        let outcome = orchestrator
            .handle(&event("tavern", 7, "<@1001> what did you see last night?", &[1001]))
            .await;
        let PipelineOutcome::Sent(turn) = outcome else {
            panic!("expected Sent, got {outcome:?}");
        };
        assert_eq!(turn.reply, "**Kovach:** I saw a light out past the pier.");
        assert_eq!(turn.retrieval_mode, Some(RetrievalMode::Primary));
        assert!(!turn.degraded);
        assert!(turn.extraction_scheduled);
        assert_eq!(sender.sent(), vec![(ChannelId::new("tavern"), turn.reply.clone())]);

        let requests = provider.requests();
        let system = requests[0].system.clone().unwrap();
        assert!(system.contains("You are Kovach"));
        assert!(system.contains("lantern on the water"));
        assert!(system.contains("fears deep water"));
        assert!(requests[0].prompt.contains("what did you see last night?"));

        env.detached.drain().await;
        let records = env.store.read_all("kovach").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "- Kovach saw a light past the pier");
    }

    #[tokio::test]
    async fn unaddressed_event_is_skipped_without_effect() {
        let env = TestEnv::new();
        let provider = ScriptedProvider::new(vec![]);
        let (orchestrator, sender) = env.orchestrator(provider.clone()).await;
        let outcome = orchestrator.handle(&event("tavern", 7, "just chatting", &[])).await;
        assert!(matches!(outcome, PipelineOutcome::Skipped));
        assert!(provider.requests().is_empty());
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn completion_failure_is_terminal() {
        let env = TestEnv::new();
        let provider = ScriptedProvider::new(vec![Err(ProviderError::RateLimited { retry_after_secs: 3 })]);
        let (orchestrator, sender) = env.orchestrator(provider.clone()).await;
        let outcome = orchestrator.handle(&event("tavern", 7, "<@1001> hi", &[1001])).await;
        assert!(matches!(
            outcome,
            PipelineOutcome::Failed(FailureReason::Completion(CompletionFailureKind::RateLimited))
        ));
        assert_eq!(provider.requests().len(), 1);
        assert!(sender.sent().is_empty());
        assert_eq!(env.detached.in_flight(), 0);
    }

    #[tokio::test]
    async fn delivery_failure_is_terminal() {
        let env = TestEnv::new();
        let provider = ScriptedProvider::new(vec![Ok("Aye.".into())]);
        let (orchestrator, sender) = env.orchestrator(provider).await;
        sender.fail_sends(true);
        let outcome = orchestrator.handle(&event("tavern", 7, "<@1001> hi", &[1001])).await;
        assert!(matches!(outcome, PipelineOutcome::Failed(FailureReason::Delivery(_))));
        env.detached.drain().await;
        assert!(env.store.read_all("kovach").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsatisfiable_budget_makes_no_completion_call() {
        let env = TestEnv::new().with_token_budget(20);
        let provider = ScriptedProvider::new(vec![Ok("never".into())]);
        let (orchestrator, _sender) = env.orchestrator(provider.clone()).await;
        let outcome = orchestrator.handle(&event("tavern", 7, "<@1001> hi", &[1001])).await;
        assert!(matches!(
            outcome,
            PipelineOutcome::Failed(FailureReason::BudgetUnsatisfiable { budget: 20, .. })
        ));
        assert!(provider.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_primary_falls_back_and_still_sends() {
        let env = TestEnv::new();
        env.backend.set_primary_delay(Duration::from_secs(30));
        let provider = ScriptedProvider::new(vec![Ok("Can't say.".into())]);
        let (orchestrator, _sender) = env.orchestrator(provider).await;
        let outcome = orchestrator.handle(&event("tavern", 7, "<@1001> hi", &[1001])).await;
        let PipelineOutcome::Sent(turn) = outcome else {
            panic!("expected Sent, got {outcome:?}");
        };
        assert_eq!(turn.retrieval_mode, Some(RetrievalMode::Fallback));
        assert!(turn.degraded);
    }

    #[tokio::test]
    async fn missing_card_fails_the_turn() {
        let env = TestEnv::new();
        let provider = ScriptedProvider::new(vec![Ok("never".into())]);
        let (orchestrator, _sender) = env.orchestrator(provider.clone()).await;
        std::fs::remove_file(env.cards_dir().join("kovach.json")).unwrap();
        let outcome = orchestrator.handle(&event("tavern", 7, "<@1001> hi", &[1001])).await;
        assert!(matches!(outcome, PipelineOutcome::Failed(FailureReason::IdentityLoad(_))));
        assert!(provider.requests().is_empty());
    }
}
