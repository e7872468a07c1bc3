//! Durable memory store: append-only daily markdown logs per namespace.
//!
//! Each namespace keeps one file per UTC day under
//! `agents/<namespace>/memory/memory/YYYY-MM-DD.md`. Entries are appended as
//!
//! ```text
//!
//! ## 2026-10-16T21:05:09Z
//! - Kovach owes the harbourmaster twelve dollars
//! ```
//!
//! and are never rewritten. Every write and the archive move for a namespace
//! go through that namespace's slot lock, and every handle carries the
//! generation it was issued for: once a namespace is archived its old handles
//! are rejected, so a late detached write can neither leak into the archive
//! nor into a freshly provisioned namespace of the same name.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use homunculus_core::error::MemoryError;
use homunculus_core::memory::{
    is_valid_namespace_name, ArchiveReceipt, DurableMemoryStore, MemoryRecord, Namespace,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::layout::{NamespaceLayout, CURATED_SEED};

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Per-namespace write serialisation; the value is the live generation.
#[derive(Default)]
struct NamespaceSlot {
    generation: Mutex<u64>,
}

pub struct DailyLogStore {
    layout: NamespaceLayout,
    slots: DashMap<String, Arc<NamespaceSlot>>,
    clock: Clock,
}

impl DailyLogStore {
    pub fn new(layout: NamespaceLayout) -> Self {
        Self {
            layout,
            slots: DashMap::new(),
            clock: Arc::new(Utc::now),
        }
    }

    /// Override the wall clock (tests pin dates and archive names).
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn layout(&self) -> &NamespaceLayout {
        &self.layout
    }

    fn slot(&self, name: &str) -> Arc<NamespaceSlot> {
        self.slots.entry(name.to_string()).or_default().clone()
    }

    fn check_name(name: &str) -> Result<(), MemoryError> {
        if is_valid_namespace_name(name) {
            Ok(())
        } else {
            Err(MemoryError::InvalidNamespace(name.to_string()))
        }
    }

    fn free_archive_target(&self, name: &str, at: DateTime<Utc>) -> PathBuf {
        let base = self.layout.archive_target(name, at);
        if !base.exists() {
            return base;
        }
        (1..)
            .map(|n| PathBuf::from(format!("{}-{n}", base.display())))
            .find(|p| !p.exists())
            .unwrap_or(base)
    }
}

#[async_trait]
impl DurableMemoryStore for DailyLogStore {
    async fn provision(&self, name: &str) -> Result<Namespace, MemoryError> {
        Self::check_name(name)?;
        let slot = self.slot(name);
        let mut generation = slot.generation.lock().await;

        for dir in [
            self.layout.daily_dir(name),
            self.layout.qmd_config_home(name),
            self.layout.qmd_cache_home(name),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        let curated = self.layout.curated_file(name);
        if !tokio::fs::try_exists(&curated).await? {
            tokio::fs::write(&curated, CURATED_SEED).await?;
        }

        *generation += 1;
        debug!(namespace = name, generation = *generation, "Namespace provisioned");
        Ok(Namespace::new(name, *generation))
    }

    async fn append(&self, namespace: &Namespace, text: &str) -> Result<MemoryRecord, MemoryError> {
        let facts = text.trim();
        if facts.is_empty() {
            return Err(MemoryError::Storage("refusing to append an empty entry".into()));
        }

        let slot = self.slot(&namespace.name);
        let generation = slot.generation.lock().await;
        if *generation != namespace.generation {
            return Err(MemoryError::NamespaceRetired {
                namespace: namespace.name.clone(),
                generation: namespace.generation,
            });
        }

        let now = (self.clock)();
        let path = self.layout.daily_file(&namespace.name, now.date_naive());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
        let entry = format!("\n## {stamp}\n{facts}\n");

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        file.flush().await?;
        drop(generation);

        debug!(namespace = %namespace, path = %path.display(), "Appended memory entry");
        Ok(MemoryRecord {
            text: facts.to_string(),
            source: path.display().to_string(),
            timestamp: Some(now),
            namespace: namespace.name.clone(),
            score: 0.0,
        })
    }

    async fn read_all(&self, name: &str) -> Result<Vec<MemoryRecord>, MemoryError> {
        Self::check_name(name)?;
        let dir = self.layout.daily_dir(name);
        let mut files = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "md") {
                files.push(path);
            }
        }
        // YYYY-MM-DD names sort chronologically.
        files.sort();

        let mut records = Vec::new();
        for path in files {
            let content = tokio::fs::read_to_string(&path).await?;
            records.extend(parse_entries(&content, &path, name));
        }
        Ok(records)
    }

    async fn archive(&self, namespace: &Namespace) -> Result<Option<ArchiveReceipt>, MemoryError> {
        let slot = self.slot(&namespace.name);
        let mut generation = slot.generation.lock().await;
        if *generation != namespace.generation {
            return Err(MemoryError::NamespaceRetired {
                namespace: namespace.name.clone(),
                generation: namespace.generation,
            });
        }
        // Retire first: whatever happens below, old handles stop writing.
        *generation += 1;

        let root = self.layout.root(&namespace.name);
        if !tokio::fs::try_exists(&root).await? {
            warn!(namespace = %namespace, "Nothing on disk to archive");
            return Ok(None);
        }

        let target = self.free_archive_target(&namespace.name, (self.clock)());
        tokio::fs::create_dir_all(self.layout.archive_dir()).await?;
        tokio::fs::rename(&root, &target).await?;

        let frozen = target.clone();
        let files = tokio::task::spawn_blocking(move || make_read_only(&frozen))
            .await
            .map_err(|e| MemoryError::Storage(format!("archive freeze task failed: {e}")))??;

        info!(
            namespace = %namespace,
            archive = %target.display(),
            files,
            "Namespace archived"
        );
        Ok(Some(ArchiveReceipt {
            namespace: namespace.name.clone(),
            path: target,
            files,
        }))
    }
}

/// Split a daily log into its `## <timestamp>` entries.
fn parse_entries(content: &str, path: &Path, namespace: &str) -> Vec<MemoryRecord> {
    let mut records = Vec::new();
    let mut current: Option<(Option<DateTime<Utc>>, Vec<&str>)> = None;

    let mut flush = |entry: Option<(Option<DateTime<Utc>>, Vec<&str>)>| {
        if let Some((timestamp, lines)) = entry {
            let text = lines.join("\n").trim().to_string();
            if !text.is_empty() {
                records.push(MemoryRecord {
                    text,
                    source: path.display().to_string(),
                    timestamp,
                    namespace: namespace.to_string(),
                    score: 0.0,
                });
            }
        }
    };

    for line in content.lines() {
        if let Some(header) = line.strip_prefix("## ") {
            flush(current.take());
            let timestamp = DateTime::parse_from_rfc3339(header.trim())
                .ok()
                .map(|t| t.with_timezone(&Utc));
            current = Some((timestamp, Vec::new()));
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }
    flush(current.take());
    records
}

/// Mark every file under `root` read-only; returns the file count.
fn make_read_only(root: &Path) -> Result<usize, MemoryError> {
    let mut count = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(path);
            } else {
                let mut perms = meta.permissions();
                perms.set_readonly(true);
                std::fs::set_permissions(&path, perms)?;
                count += 1;
            }
        }
    }
    Ok(count)
}
