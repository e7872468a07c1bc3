//! `homunculus run`: wire the pipeline together and answer mentions until
//! shutdown.

use homunculus_agent::{
    BindRequest, CommandHandler, CompletionSettings, HistoryCollector, IdentityManager,
    MemoryExtractor, Orchestrator, PipelineParts, PromptBuilder, Runtime,
};
use homunculus_channels::ConsoleChannel;
use homunculus_config::{AppConfig, RetrievalBackendKind};
use homunculus_core::channel::{ChannelId, EventSource};
use homunculus_core::event::EventBus;
use homunculus_core::identity::{FileIdentitySource, IdentityRef};
use homunculus_core::memory::RetrievalBackend;
use homunculus_memory::{
    BuiltinIndex, DailyLogStore, MemoryRetrievalAdapter, NamespaceLayout, QmdBackend,
    RulesetLibrary,
};
use homunculus_telemetry::PricingTable;
use homunculus_workflow::{DetachedTasks, MaintenanceScheduler};
use std::sync::Arc;
use tracing::{debug, info};

/// Console history kept per channel, as a multiple of the prompt window.
const HISTORY_RETENTION_FACTOR: usize = 4;

pub async fn run(config: AppConfig, once: bool) -> Result<(), Box<dyn std::error::Error>> {
    config.validate_for_run()?;

    let events = Arc::new(EventBus::default());
    let layout = NamespaceLayout::new(&config.runtime.data_home);
    let store = Arc::new(DailyLogStore::new(layout.clone()));

    let backend: Arc<dyn RetrievalBackend> = match config.memory.backend {
        RetrievalBackendKind::Qmd => Arc::new(
            QmdBackend::new(config.memory.qmd_binary.clone(), layout.clone()).with_timeouts(
                config.memory.query_timeout(),
                config.memory.fallback_timeout(),
                config.memory.update_timeout(),
            ),
        ),
        RetrievalBackendKind::Builtin => Arc::new(BuiltinIndex::new(store.clone())),
    };
    let retrieval = MemoryRetrievalAdapter::new(backend.clone(), config.memory.query_timeout())
        .with_top_k(config.memory.top_k)
        .with_max_query_chars(config.memory.max_query_chars)
        .with_events(events.clone());

    let scheduler = Arc::new(
        MaintenanceScheduler::new(
            backend.clone(),
            config.memory.update_interval(),
            config.memory.update_timeout(),
        )
        .with_events(events.clone()),
    );

    let identities = Arc::new(
        IdentityManager::new(
            store.clone(),
            Arc::new(FileIdentitySource),
            config.runtime.data_home.join("cards"),
        )
        .with_scheduler(scheduler.clone())
        .with_index(backend)
        .with_events(events.clone()),
    );

    let allowed: Vec<_> = config.channels.iter().filter(|c| c.allowed).collect();
    let default_channel = allowed
        .first()
        .map(|c| ChannelId::new(c.channel_id.as_str()))
        .ok_or("no allowed channels configured")?;
    let console = ConsoleChannel::new(
        default_channel,
        config.prompt.history_size * HISTORY_RETENTION_FACTOR,
    );

    for channel in &allowed {
        let channel_id = ChannelId::new(channel.channel_id.as_str());
        console.bind_bot(channel_id.clone(), channel.bot_user_id);
        let binding = identities
            .bind(BindRequest {
                channel: channel_id,
                identity: IdentityRef::new(&channel.character_card),
                namespace: channel.memory_namespace.clone(),
                ruleset_id: channel.skill_ruleset.clone(),
                bot_user_id: channel.bot_user_id,
            })
            .await?;
        info!(
            channel = %binding.channel,
            namespace = %binding.namespace,
            ruleset = %binding.ruleset_id,
            "Channel bound"
        );
    }

    let provider = homunculus_providers::build_provider(&config.model)?;
    let detached = Arc::new(DetachedTasks::new("extraction", config.extraction.max_concurrent));
    let extractor = config.extraction.enabled.then(|| {
        Arc::new(
            MemoryExtractor::new(provider.clone(), store.clone(), config.model.name.clone())
                .with_limits(
                    config.extraction.max_tokens,
                    config.extraction.temperature,
                    config.extraction.history_lines,
                )
                .with_events(events.clone()),
        )
    });

    let console = Arc::new(console);
    let orchestrator = Arc::new(Orchestrator::new(PipelineParts {
        identities: identities.clone(),
        history: console.clone(),
        sender: console.clone(),
        provider,
        retrieval: Arc::new(retrieval),
        rulesets: Arc::new(RulesetLibrary::new(layout.rulesets_dir())),
        prompt: PromptBuilder::new(config.prompt.token_budget),
        collector: HistoryCollector::new(config.prompt.history_size),
        completion: CompletionSettings::from_config(&config),
        extractor,
        detached: detached.clone(),
        pricing: PricingTable::with_defaults(),
        events: Some(events.clone()),
    }));
    let commands = Arc::new(CommandHandler::new(identities, config.model.name.clone()));
    let runtime = Runtime::new(orchestrator, commands, console.clone(), config.runtime.shutdown_grace());

    let mut feed = events.subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = feed.recv().await {
            debug!(event = ?event, "Domain event");
        }
    });

    println!("🎭 Homunculus is listening on {} channel(s)", allowed.len());
    if once {
        info!("--once given, shutting down after startup");
    } else {
        println!("   Type '[#channel] author: message', mention with <@id>. Ctrl+D or 'exit' to stop.\n");
        let inbound = console.start().await?;
        let stats = runtime.run(inbound, shutdown_signal()).await;
        println!(
            "\n   {} received, {} sent, {} failed, {} skipped, {} command(s)",
            stats.received, stats.sent, stats.failed, stats.skipped, stats.commands
        );
    }

    detached.shutdown().await;
    scheduler.shutdown().await;
    event_log.abort();
    info!("Homunculus stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
