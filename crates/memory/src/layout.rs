//! On-disk layout of the data home.
//!
//! ```text
//! <data_home>/
//!   agents/<namespace>/
//!     memory/MEMORY.md              curated notes
//!     memory/memory/YYYY-MM-DD.md   daily durable logs
//!     qmd/xdg-config, qmd/xdg-cache index state
//!   archive/<namespace>-<YYYYMMDDTHHMMSSZ>/
//!   rulesets/<id>.md
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use std::path::{Path, PathBuf};

pub const CURATED_FILE: &str = "MEMORY.md";
pub const CURATED_SEED: &str = "# MEMORY\n\n";

#[derive(Debug, Clone)]
pub struct NamespaceLayout {
    data_home: PathBuf,
}

impl NamespaceLayout {
    pub fn new(data_home: impl Into<PathBuf>) -> Self {
        Self {
            data_home: data_home.into(),
        }
    }

    pub fn data_home(&self) -> &Path {
        &self.data_home
    }

    pub fn root(&self, namespace: &str) -> PathBuf {
        self.data_home.join("agents").join(namespace)
    }

    pub fn memory_dir(&self, namespace: &str) -> PathBuf {
        self.root(namespace).join("memory")
    }

    pub fn curated_file(&self, namespace: &str) -> PathBuf {
        self.memory_dir(namespace).join(CURATED_FILE)
    }

    pub fn daily_dir(&self, namespace: &str) -> PathBuf {
        self.memory_dir(namespace).join("memory")
    }

    /// The "current period" log for `date`.
    pub fn daily_file(&self, namespace: &str, date: NaiveDate) -> PathBuf {
        self.daily_dir(namespace)
            .join(format!("{}.md", date.format("%Y-%m-%d")))
    }

    pub fn qmd_config_home(&self, namespace: &str) -> PathBuf {
        self.root(namespace).join("qmd").join("xdg-config")
    }

    pub fn qmd_cache_home(&self, namespace: &str) -> PathBuf {
        self.root(namespace).join("qmd").join("xdg-cache")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.data_home.join("archive")
    }

    /// Timestamped archive location for a namespace retired at `at`.
    pub fn archive_target(&self, namespace: &str, at: DateTime<Utc>) -> PathBuf {
        self.archive_dir()
            .join(format!("{namespace}-{}", at.format("%Y%m%dT%H%M%SZ")))
    }

    pub fn rulesets_dir(&self) -> PathBuf {
        self.data_home.join("rulesets")
    }
}
