//! Shared fixtures for agent tests.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use homunculus_core::channel::{ChannelId, ConversationTurn, HistorySource, InboundEvent, ReplySender, SpeakerRole};
use homunculus_core::error::{ChannelError, MemoryError, ProviderError};
use homunculus_core::event::EventBus;
use homunculus_core::identity::{FileIdentitySource, IdentityRef};
use homunculus_core::memory::{MemoryRecord, Namespace, RetrievalBackend, RetrievalMode};
use homunculus_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use homunculus_memory::{DailyLogStore, MemoryRetrievalAdapter, NamespaceLayout, RulesetLibrary};
use homunculus_telemetry::PricingTable;
use homunculus_workflow::DetachedTasks;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::extraction::MemoryExtractor;
use crate::history::HistoryCollector;
use crate::identity_manager::{BindRequest, IdentityBinding, IdentityManager};
use crate::pipeline::{CompletionSettings, Orchestrator, PipelineParts};
use crate::prompt::PromptBuilder;

pub const BOT_ID: u64 = 1001;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

// ── Builders ──────────────────────────────────────────────────────────────

pub fn event(channel: &str, author_id: u64, content: &str, mentions: &[u64]) -> InboundEvent {
    InboundEvent {
        channel_id: ChannelId::new(channel),
        author_id,
        author_name: format!("user{author_id}"),
        author_is_bot: false,
        message_id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
        content: content.into(),
        mentioned_user_ids: mentions.to_vec(),
        created_at: Utc::now(),
    }
}

/// An event with a fixed id and a timestamp `second`s into the session.
pub fn event_at(channel: &str, author_id: u64, message_id: u64, second: u32, content: &str) -> InboundEvent {
    let base = Utc.with_ymd_and_hms(2026, 10, 16, 20, 0, 0).unwrap();
    InboundEvent {
        message_id,
        created_at: base + chrono::Duration::seconds(second as i64),
        ..event(channel, author_id, content, &[])
    }
}

pub fn turn_of(message_id: u64, role: SpeakerRole, author: &str, content: &str) -> ConversationTurn {
    ConversationTurn {
        message_id,
        role,
        author_name: author.into(),
        content: content.into(),
        timestamp: Utc::now(),
    }
}

pub fn binding(channel: &str, namespace: &str, bot_user_id: u64) -> IdentityBinding {
    IdentityBinding {
        channel: ChannelId::new(channel),
        identity: IdentityRef::new(format!("/cards/{namespace}.json")),
        namespace: Namespace::new(namespace, 1),
        ruleset_id: "coc7e".into(),
        bot_user_id,
        effective_since: Utc::now(),
    }
}

pub fn memory(text: &str, score: f32) -> MemoryRecord {
    MemoryRecord {
        text: text.into(),
        source: "2026-10-15.md".into(),
        timestamp: None,
        namespace: "kovach".into(),
        score,
    }
}

/// Write a valid character card `<dir>/<stem>.json` named `name`.
pub fn write_card(dir: impl AsRef<Path>, stem: &str, name: &str) -> PathBuf {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir).unwrap();
    let card = serde_json::json!({
        "name": name,
        "description": "A weathered dock foreman.",
        "personality": "Gruff, loyal, superstitious.",
        "background": "Worked the Arkham docks for twenty years.",
        "stats": {"STR": 70, "CON": 65, "DEX": 50, "INT": 55, "POW": 45,
                  "APP": 40, "SIZ": 75, "EDU": 40, "HP": 14, "SAN": 45, "MP": 9},
        "skills": {"Spot Hidden": 45, "Brawl": 60},
        "inventory": ["crowbar", "flask of rye"]
    });
    let path = dir.join(format!("{stem}.json"));
    std::fs::write(&path, card.to_string()).unwrap();
    path
}

// ── Mocks ─────────────────────────────────────────────────────────────────

/// Returns scripted replies in order; an exhausted script yields
/// `EmptyCompletion`.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<String, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    delay: Mutex<Duration>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Result<String, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.delay.lock().unwrap() = delay;
        self
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let model = request.model.clone();
        self.requests.lock().unwrap().push(request);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(ProviderResponse {
                text,
                usage: Some(Usage::new(120, 30)),
                model,
                stop_reason: Some("end_turn".into()),
            }),
            Some(Err(e)) => Err(e),
            None => Err(ProviderError::EmptyCompletion),
        }
    }
}

#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(ChannelId, String)>>,
    fail: AtomicBool,
    typing: AtomicUsize,
}

impl RecordingSender {
    pub fn sent(&self) -> Vec<(ChannelId, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn typing_count(&self) -> usize {
        self.typing.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplySender for RecordingSender {
    async fn send(&self, channel: &ChannelId, text: &str) -> Result<(), ChannelError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChannelError::DeliveryFailed {
                channel: channel.to_string(),
                reason: "socket closed".into(),
            });
        }
        self.sent.lock().unwrap().push((channel.clone(), text.to_string()));
        Ok(())
    }

    async fn send_typing(&self, _channel: &ChannelId) -> Result<(), ChannelError> {
        self.typing.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct StaticHistory {
    events: Vec<InboundEvent>,
    fail: bool,
}

impl StaticHistory {
    pub fn new(events: Vec<InboundEvent>) -> Self {
        Self { events, fail: false }
    }

    pub fn failing() -> Self {
        Self {
            events: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl HistorySource for StaticHistory {
    async fn recent(&self, channel: &ChannelId, _limit: usize) -> Result<Vec<InboundEvent>, ChannelError> {
        if self.fail {
            return Err(ChannelError::HistoryUnavailable {
                channel: channel.to_string(),
                reason: "gateway timeout".into(),
            });
        }
        Ok(self.events.iter().filter(|e| &e.channel_id == channel).cloned().collect())
    }
}

/// Fixed records per namespace; the primary tier can be slowed down.
#[derive(Default)]
pub struct ScriptedBackend {
    records: Mutex<HashMap<String, Vec<MemoryRecord>>>,
    primary_delay: Mutex<Duration>,
}

impl ScriptedBackend {
    pub fn set_records(&self, namespace: &str, records: Vec<MemoryRecord>) {
        self.records.lock().unwrap().insert(namespace.to_string(), records);
    }

    pub fn set_primary_delay(&self, delay: Duration) {
        *self.primary_delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl RetrievalBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn query(
        &self,
        namespace: &str,
        _text: &str,
        top_k: usize,
        mode: RetrievalMode,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let delay = *self.primary_delay.lock().unwrap();
        if mode == RetrievalMode::Primary && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let records = self.records.lock().unwrap().get(namespace).cloned().unwrap_or_default();
        Ok(records.into_iter().take(top_k).collect())
    }

    async fn reindex(&self, _namespace: &str) -> Result<(), MemoryError> {
        Ok(())
    }
}

// ── Environment ───────────────────────────────────────────────────────────

/// A data home in a temp dir with `kovach` and `mira` cards written.
pub struct TestEnv {
    pub tmp: tempfile::TempDir,
    pub store: Arc<DailyLogStore>,
    pub events: Arc<EventBus>,
    pub backend: Arc<ScriptedBackend>,
    pub detached: Arc<DetachedTasks>,
    token_budget: usize,
}

impl TestEnv {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(DailyLogStore::new(NamespaceLayout::new(tmp.path())));
        let env = Self {
            store,
            events: Arc::new(EventBus::new(64)),
            backend: Arc::new(ScriptedBackend::default()),
            detached: Arc::new(DetachedTasks::new("extraction", 4)),
            token_budget: 2000,
            tmp,
        };
        write_card(env.cards_dir(), "kovach", "Kovach");
        write_card(env.cards_dir(), "mira", "Mira");
        env
    }

    pub fn with_token_budget(mut self, budget: usize) -> Self {
        self.token_budget = budget;
        self
    }

    pub fn layout(&self) -> &NamespaceLayout {
        self.store.layout()
    }

    pub fn cards_dir(&self) -> PathBuf {
        self.tmp.path().join("cards")
    }

    pub fn manager(&self) -> IdentityManager {
        IdentityManager::new(self.store.clone(), Arc::new(FileIdentitySource), self.cards_dir())
            .with_events(self.events.clone())
    }

    pub fn bind_request(&self, channel: &str, namespace: &str) -> BindRequest {
        BindRequest {
            channel: ChannelId::new(channel),
            identity: IdentityRef::new(self.cards_dir().join(format!("{namespace}.json"))),
            namespace: namespace.into(),
            ruleset_id: "coc7e".into(),
            bot_user_id: BOT_ID,
        }
    }

    /// An orchestrator with `tavern` bound to `kovach`.
    pub async fn orchestrator(&self, provider: Arc<ScriptedProvider>) -> (Orchestrator, Arc<RecordingSender>) {
        let manager = Arc::new(self.manager());
        manager.bind(self.bind_request("tavern", "kovach")).await.unwrap();
        let sender = Arc::new(RecordingSender::default());

        let retrieval = MemoryRetrievalAdapter::new(self.backend.clone(), Duration::from_secs(8))
            .with_events(self.events.clone());
        let extractor = MemoryExtractor::new(provider.clone(), self.store.clone(), "claude-haiku-4-5");

        let orchestrator = Orchestrator::new(PipelineParts {
            identities: manager,
            history: Arc::new(StaticHistory::new(Vec::new())),
            sender: sender.clone(),
            provider,
            retrieval: Arc::new(retrieval),
            rulesets: Arc::new(RulesetLibrary::new(self.layout().rulesets_dir())),
            prompt: PromptBuilder::new(self.token_budget),
            collector: HistoryCollector::new(25),
            completion: CompletionSettings {
                model: "claude-sonnet-4-20250514".into(),
                max_tokens: 500,
                temperature: 0.7,
            },
            extractor: Some(Arc::new(extractor)),
            detached: self.detached.clone(),
            pricing: PricingTable::with_defaults(),
            events: Some(self.events.clone()),
        });
        (orchestrator, sender)
    }
}
