//! Skill-ruleset excerpts, read from `<data_home>/rulesets/<id>.md`.

use std::path::PathBuf;
use tracing::warn;

pub const MAX_EXCERPT_CHARS: usize = 2400;

#[derive(Debug, Clone)]
pub struct RulesetLibrary {
    dir: PathBuf,
    max_chars: usize,
}

impl RulesetLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_chars: MAX_EXCERPT_CHARS,
        }
    }

    pub fn path_for(&self, ruleset_id: &str) -> PathBuf {
        self.dir.join(format!("{ruleset_id}.md"))
    }

    /// The capped excerpt for `ruleset_id`, or an empty string when it cannot
    /// be read.
    pub async fn excerpt(&self, ruleset_id: &str) -> String {
        let path = self.path_for(ruleset_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => cap(text.trim(), self.max_chars),
            Err(e) => {
                warn!(ruleset = ruleset_id, path = %path.display(), error = %e, "Ruleset excerpt unavailable");
                String::new()
            }
        }
    }
}

fn cap(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
