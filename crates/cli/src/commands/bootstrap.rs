//! `homunculus bootstrap`: create namespace trees and starter character cards.
//!
//! Safe to re-run: an existing namespace keeps its memory and an existing card
//! is never overwritten.

use homunculus_agent::identity_manager::is_valid_npc_name;
use homunculus_core::identity::STAT_FIELDS;
use homunculus_core::memory::DurableMemoryStore;
use homunculus_memory::{DailyLogStore, NamespaceLayout};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::check::EXIT_CONFIG_ERROR;

/// What one name ended up with on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootstrapped {
    pub name: String,
    pub root: PathBuf,
    pub card: PathBuf,
    pub card_created: bool,
}

pub async fn run(data_home: &Path, names: &[String]) -> i32 {
    println!("🧰 Bootstrapping {} namespace(s) under {}", names.len(), data_home.display());
    match bootstrap(data_home, names).await {
        Ok(results) => {
            for r in &results {
                let card = if r.card_created { "created" } else { "kept" };
                println!("   ✅ {}: root={} card={} ({card})", r.name, r.root.display(), r.card.display());
            }
            0
        }
        Err(e) => {
            println!("   ❌ Bootstrap error: {e}");
            EXIT_CONFIG_ERROR
        }
    }
}

/// Provision every namespace in `names` and write a starter card for each
/// one that has none. All names are checked before anything is created.
pub async fn bootstrap(
    data_home: &Path,
    names: &[String],
) -> Result<Vec<Bootstrapped>, Box<dyn std::error::Error>> {
    let normalized: Vec<String> = names.iter().map(|n| n.trim().to_lowercase()).collect();
    if normalized.is_empty() {
        return Err("at least one npc name is required".into());
    }
    if let Some(bad) = normalized.iter().find(|n| !is_valid_npc_name(n)) {
        return Err(format!("npc name {bad:?} must match [a-z0-9][a-z0-9_-]{{1,63}}").into());
    }

    let layout = NamespaceLayout::new(data_home);
    let store = DailyLogStore::new(layout.clone());
    let cards_dir = data_home.join("cards");
    tokio::fs::create_dir_all(&cards_dir).await?;

    let mut results = Vec::with_capacity(normalized.len());
    for name in normalized {
        store.provision(&name).await?;
        let card = cards_dir.join(format!("{name}.json"));
        let card_created = write_if_missing(&card, &card_template(&name)).await?;
        if card_created {
            info!(namespace = %name, card = %card.display(), "Starter card written");
        }
        results.push(Bootstrapped {
            root: layout.root(&name),
            name,
            card,
            card_created,
        });
    }
    Ok(results)
}

/// A card that loads as-is, with placeholder prose to replace.
fn card_template(name: &str) -> String {
    let stats: Map<String, Value> = STAT_FIELDS
        .iter()
        .map(|stat| {
            let default = match *stat {
                "HP" | "MP" => 10,
                _ => 50,
            };
            (stat.to_string(), json!(default))
        })
        .collect();
    let card = json!({
        "name": name,
        "description": format!("{name} has not been described yet."),
        "personality": "Unremarkable until written otherwise.",
        "background": "No background has been recorded.",
        "stats": stats,
        "skills": {},
        "inventory": [],
    });
    let mut rendered = serde_json::to_string_pretty(&card).unwrap_or_else(|_| card.to_string());
    rendered.push('\n');
    rendered
}

/// `Ok(false)` when `path` already exists; its content is left alone.
async fn write_if_missing(path: &Path, content: &str) -> std::io::Result<bool> {
    let mut file = match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e),
    };
    file.write_all(content.as_bytes()).await?;
    file.flush().await?;
    Ok(true)
}
