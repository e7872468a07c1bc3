//! Operator commands typed into a bound channel.
//!
//! ```text
//! /npc status
//! /npc reload
//! /npc swap <name> [card.json]
//! ```

use homunculus_core::channel::ChannelId;
use homunculus_core::error::SwapError;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use crate::identity_manager::{is_valid_npc_name, IdentityManager};

const COMMAND_PREFIX: &str = "/npc";
const INTERNAL_ERROR: &str =
    "Command failed: internal runtime error. Please retry or inspect service logs.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NpcCommand {
    Status,
    Reload,
    Swap { name: String, card: Option<PathBuf> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    /// Not addressed to us; the message goes through the normal pipeline.
    NotACommand,
    Valid(NpcCommand),
    Invalid(String),
}

pub fn parse_command(content: &str) -> ParsedCommand {
    let mut words = content.split_whitespace();
    if words.next() != Some(COMMAND_PREFIX) {
        return ParsedCommand::NotACommand;
    }
    let args: Vec<&str> = words.collect();
    match args.as_slice() {
        ["status"] => ParsedCommand::Valid(NpcCommand::Status),
        ["reload"] => ParsedCommand::Valid(NpcCommand::Reload),
        ["swap", name, rest @ ..] if rest.len() <= 1 => {
            let name = name.to_lowercase();
            if !is_valid_npc_name(&name) {
                return ParsedCommand::Invalid(format!(
                    "NPC name '{name}' must match [a-z0-9][a-z0-9_-]{{1,63}}"
                ));
            }
            let card = match rest.first() {
                Some(path) if !path.to_lowercase().ends_with(".json") => {
                    return ParsedCommand::Invalid(format!("card path '{path}' must end in .json"));
                }
                Some(path) => Some(PathBuf::from(path)),
                None => None,
            };
            ParsedCommand::Valid(NpcCommand::Swap { name, card })
        }
        [] => ParsedCommand::Invalid("usage: /npc status | reload | swap <name> [card.json]".into()),
        [other, ..] => ParsedCommand::Invalid(format!("unknown or malformed subcommand '{other}'")),
    }
}

/// Executes parsed commands and renders the channel response.
pub struct CommandHandler {
    identities: Arc<IdentityManager>,
    model: String,
}

impl CommandHandler {
    pub fn new(identities: Arc<IdentityManager>, model: impl Into<String>) -> Self {
        Self {
            identities,
            model: model.into(),
        }
    }

    pub async fn execute(&self, channel: &ChannelId, command: &NpcCommand) -> String {
        info!(channel = %channel, command = ?command, "Operator command");
        match command {
            NpcCommand::Status => self.status(channel).await,
            NpcCommand::Reload => match self.identities.reload(channel).await {
                Ok(identity) => format!(
                    "Reload complete: {} is active on this channel (namespace {}).",
                    identity.name(),
                    identity.namespace
                ),
                Err(e) => render_error(channel, e),
            },
            NpcCommand::Swap { name, card } => {
                match self.identities.swap(channel, name, card.clone()).await {
                    Ok(report) => {
                        let archived = match &report.archive {
                            Some(receipt) => format!("previous memory archived to {}", receipt.path.display()),
                            None => "nothing to archive".to_string(),
                        };
                        format!(
                            "Swap complete: {} is now active (namespace {}); {archived}.",
                            report.identity_name, report.new_namespace
                        )
                    }
                    Err(e) => render_error(channel, e),
                }
            }
        }
    }

    async fn status(&self, channel: &ChannelId) -> String {
        let Some(binding) = self.identities.current(channel).await else {
            return format!("Validation error: {}", SwapError::NotBound(channel.to_string()));
        };
        let npc = match self.identities.load_identity(&binding).await {
            Ok(identity) => identity.card.name,
            Err(e) => format!("(card unavailable: {e})"),
        };
        format!(
            "NPC status\n- npc: {npc}\n- channel_id: {channel}\n- model: {}\n- ruleset: {}\n- namespace: {}",
            self.model, binding.ruleset_id, binding.namespace.name
        )
    }
}

fn render_error(channel: &ChannelId, e: SwapError) -> String {
    match e {
        SwapError::Archive { .. } | SwapError::Provision { .. } => {
            error!(channel = %channel, error = %e, "Operator command failed");
            INTERNAL_ERROR.to_string()
        }
        other => format!("Validation error: {other}"),
    }
}
