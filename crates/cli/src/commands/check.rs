//! `homunculus check`: validate-only mode.
//!
//! Exit codes: 0 when everything loads, 2 on any configuration problem.

use homunculus_config::{AppConfig, ConfigError};
use homunculus_core::identity::load_card;
use homunculus_memory::{NamespaceLayout, RulesetLibrary};

pub const EXIT_CONFIG_ERROR: i32 = 2;

pub async fn run(loaded: Result<AppConfig, ConfigError>) -> i32 {
    println!("🔍 Validating configuration...");

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return EXIT_CONFIG_ERROR;
        }
    };
    println!("   ✅ Config parsed successfully");

    let rulesets = RulesetLibrary::new(NamespaceLayout::new(&config.runtime.data_home).rulesets_dir());
    let mut problems = Vec::new();
    let mut warnings = Vec::new();

    for channel in &config.channels {
        match load_card(&channel.character_card).await {
            Ok(card) => println!(
                "   ✅ Channel {}: {} (namespace {}, ruleset {})",
                channel.channel_id, card.name, channel.memory_namespace, channel.skill_ruleset
            ),
            Err(e) => problems.push(format!("channel {}: {e}", channel.channel_id)),
        }
        if channel.bot_user_id == 0 {
            warnings.push(format!(
                "channel {}: bot_user_id is 0, mentions can never trigger a reply",
                channel.channel_id
            ));
        }
        let ruleset_path = rulesets.path_for(&channel.skill_ruleset);
        if !ruleset_path.exists() {
            warnings.push(format!(
                "channel {}: no excerpt at {}, prompts will carry no rules",
                channel.channel_id,
                ruleset_path.display()
            ));
        }
    }
    if !config.model.has_api_key() {
        warnings.push(format!("{} is not set; `run` will refuse to start", config.model.api_key_env));
    }

    for w in &warnings {
        println!("   ⚠️  {w}");
    }
    println!();
    match serde_json::to_string_pretty(&config.summary()) {
        Ok(summary) => println!("{summary}"),
        Err(e) => println!("   ⚠️  Could not render summary: {e}"),
    }

    if problems.is_empty() {
        println!("\n   ✅ All checks passed");
        0
    } else {
        println!();
        for p in &problems {
            println!("   ❌ {p}");
        }
        EXIT_CONFIG_ERROR
    }
}
