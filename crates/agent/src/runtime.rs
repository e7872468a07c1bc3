//! Run loop: inbound events in, one task per event.
//!
//! Every event gets its own task on a [`TaskTracker`], so a slow turn on one
//! channel never holds up another. On shutdown the loop stops reading and
//! gives in-flight turns `grace` to finish; whatever is still running after
//! that is abandoned with the runtime.

use homunculus_core::channel::{InboundEvent, ReplySender};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::commands::{parse_command, CommandHandler, ParsedCommand};
use crate::pipeline::{Orchestrator, PipelineOutcome};

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub received: usize,
    pub skipped: usize,
    pub sent: usize,
    pub failed: usize,
    pub commands: usize,
    /// Turns still running when the grace period ran out.
    pub abandoned: usize,
}

#[derive(Default)]
struct Counters {
    received: AtomicUsize,
    skipped: AtomicUsize,
    sent: AtomicUsize,
    failed: AtomicUsize,
    commands: AtomicUsize,
}

impl Counters {
    fn record(&self, outcome: &PipelineOutcome) {
        let counter = match outcome {
            PipelineOutcome::Skipped => &self.skipped,
            PipelineOutcome::Sent(_) => &self.sent,
            PipelineOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, abandoned: usize) -> RunStats {
        RunStats {
            received: self.received.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            commands: self.commands.load(Ordering::Relaxed),
            abandoned,
        }
    }
}

pub struct Runtime {
    orchestrator: Arc<Orchestrator>,
    commands: Arc<CommandHandler>,
    sender: Arc<dyn ReplySender>,
    grace: Duration,
}

impl Runtime {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        commands: Arc<CommandHandler>,
        sender: Arc<dyn ReplySender>,
        grace: Duration,
    ) -> Self {
        Self {
            orchestrator,
            commands,
            sender,
            grace,
        }
    }

    /// Consume `events` until the stream ends or `shutdown` resolves.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<InboundEvent>,
        shutdown: impl Future<Output = ()>,
    ) -> RunStats {
        let tracker = TaskTracker::new();
        let counters = Arc::new(Counters::default());
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting events");
                    break;
                }
                next = events.recv() => {
                    let Some(event) = next else {
                        info!("Event source closed");
                        break;
                    };
                    counters.received.fetch_add(1, Ordering::Relaxed);
                    self.dispatch(&tracker, &counters, event);
                }
            }
        }

        tracker.close();
        let abandoned = match tokio::time::timeout(self.grace, tracker.wait()).await {
            Ok(()) => 0,
            Err(_) => {
                warn!(
                    in_flight = tracker.len(),
                    grace_secs = self.grace.as_secs(),
                    "Grace period elapsed with turns still running"
                );
                tracker.len()
            }
        };

        let stats = counters.snapshot(abandoned);
        info!(
            received = stats.received,
            sent = stats.sent,
            failed = stats.failed,
            skipped = stats.skipped,
            commands = stats.commands,
            "Run loop stopped"
        );
        stats
    }

    fn dispatch(&self, tracker: &TaskTracker, counters: &Arc<Counters>, event: InboundEvent) {
        let counters = counters.clone();
        let sender = self.sender.clone();
        let orchestrator = self.orchestrator.clone();

        match parse_command(&event.content) {
            ParsedCommand::NotACommand => {
                tracker.spawn(async move {
                    if orchestrator.is_triggered(&event).await {
                        if let Err(e) = sender.send_typing(&event.channel_id).await {
                            debug!(channel = %event.channel_id, error = %e, "Typing signal failed");
                        }
                    }
                    let outcome = orchestrator.handle(&event).await;
                    counters.record(&outcome);
                });
            }
            parsed => {
                let commands = self.commands.clone();
                tracker.spawn(async move {
                    if event.author_is_bot {
                        return;
                    }
                    let Some(binding) = orchestrator.identities().current(&event.channel_id).await else {
                        debug!(channel = %event.channel_id, "Command on unbound channel ignored");
                        return;
                    };
                    if binding.bot_user_id == event.author_id {
                        return;
                    }
                    counters.commands.fetch_add(1, Ordering::Relaxed);
                    let response = match parsed {
                        ParsedCommand::Valid(command) => commands.execute(&event.channel_id, &command).await,
                        ParsedCommand::Invalid(reason) => format!("Validation error: {reason}"),
                        ParsedCommand::NotACommand => return,
                    };
                    if let Err(e) = sender.send(&event.channel_id, &response).await {
                        warn!(channel = %event.channel_id, error = %e, "Command response not delivered");
                    }
                });
            }
        }
    }
}
