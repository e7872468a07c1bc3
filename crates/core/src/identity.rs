//! Character identity: the persona a channel's NPC speaks as.
//!
//! Identities are described by JSON character cards:
//!
//! ```json
//! {
//!   "name": "Kovach",
//!   "description": "A weathered dock foreman.",
//!   "personality": "Gruff, loyal, superstitious.",
//!   "background": "Worked the Arkham docks for twenty years.",
//!   "stats": {"STR": 70, "CON": 65, "DEX": 50, "INT": 55, "POW": 45,
//!             "APP": 40, "SIZ": 75, "EDU": 40, "HP": 14, "SAN": 45, "MP": 9},
//!   "skills": {"Spot Hidden": 45, "Brawl": 60},
//!   "inventory": ["crowbar", "flask of rye"]
//! }
//! ```
//!
//! Cards are re-read on every turn (no caching) so edits apply immediately.
//! Validation never stops at the first problem: every issue is collected and
//! reported together, sorted by field.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use crate::error::{IdentityError, ValidationIssue};

const CARD_FIELDS: [&str; 7] = [
    "name",
    "description",
    "personality",
    "background",
    "stats",
    "skills",
    "inventory",
];

/// Required stat block, in display order.
pub const STAT_FIELDS: [&str; 11] = [
    "STR", "CON", "DEX", "INT", "POW", "APP", "SIZ", "EDU", "HP", "SAN", "MP",
];

const SCORE_MIN: i64 = 0;
const SCORE_MAX: i64 = 100;

/// A validated character card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterCard {
    pub name: String,
    pub description: String,
    pub personality: String,
    pub background: String,
    /// Stats in [`STAT_FIELDS`] order
    pub stats: Vec<(String, i64)>,
    pub skills: BTreeMap<String, i64>,
    pub inventory: Vec<String>,
}

/// Points at the card an identity is loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityRef {
    pub card_path: PathBuf,
}

impl IdentityRef {
    pub fn new(card_path: impl Into<PathBuf>) -> Self {
        Self {
            card_path: card_path.into(),
        }
    }
}

impl std::fmt::Display for IdentityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.card_path.display())
    }
}

/// A card plus the channel-level settings it is bound with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterIdentity {
    pub card: CharacterCard,
    pub ruleset_id: String,
    pub namespace: String,
}

impl CharacterIdentity {
    pub fn name(&self) -> &str {
        &self.card.name
    }
}

/// Loads identity records. Implementations must not cache between calls.
#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn load(&self, identity: &IdentityRef) -> std::result::Result<CharacterCard, IdentityError>;
}

/// Reads character cards from the filesystem.
#[derive(Debug, Clone, Default)]
pub struct FileIdentitySource;

#[async_trait]
impl IdentitySource for FileIdentitySource {
    async fn load(&self, identity: &IdentityRef) -> std::result::Result<CharacterCard, IdentityError> {
        load_card(&identity.card_path).await
    }
}

/// Read and validate a card file.
pub async fn load_card(path: &Path) -> std::result::Result<CharacterCard, IdentityError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(IdentityError::NotFound(path.display().to_string()));
        }
        Err(e) => {
            return Err(IdentityError::Unreadable {
                path: path.display().to_string(),
                reason: e.to_string(),
            });
        }
    };
    let payload: Value = serde_json::from_str(&raw).map_err(|e| IdentityError::Malformed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let card = parse_card(&payload)?;
    debug!(path = %path.display(), name = %card.name, "Loaded character card");
    Ok(card)
}

/// Validate a parsed JSON payload into a card.
pub fn parse_card(payload: &Value) -> std::result::Result<CharacterCard, IdentityError> {
    let Some(obj) = payload.as_object() else {
        return Err(IdentityError::Invalid(vec![ValidationIssue::new(
            "$",
            "invalid_type",
            "Character card root must be an object.",
        )]));
    };

    let mut issues = Vec::new();

    for key in obj.keys().filter(|k| !CARD_FIELDS.contains(&k.as_str())) {
        issues.push(ValidationIssue::new(key.as_str(), "unknown_field", "Unknown field is not allowed."));
    }
    for field in CARD_FIELDS.iter().filter(|f| !obj.contains_key(**f)) {
        issues.push(ValidationIssue::new(*field, "missing_field", "Required field is missing."));
    }

    let text = |field: &str, issues: &mut Vec<ValidationIssue>| {
        obj.get(field)
            .map(|v| non_empty_string(field, v, issues))
            .unwrap_or_default()
    };
    let name = text("name", &mut issues);
    let description = text("description", &mut issues);
    let personality = text("personality", &mut issues);
    let background = text("background", &mut issues);

    let stats = obj.get("stats").map(|v| stats(v, &mut issues)).unwrap_or_default();
    let skills = obj.get("skills").map(|v| skills(v, &mut issues)).unwrap_or_default();
    let inventory = obj
        .get("inventory")
        .map(|v| inventory(v, &mut issues))
        .unwrap_or_default();

    if !issues.is_empty() {
        issues.sort();
        return Err(IdentityError::Invalid(issues));
    }

    Ok(CharacterCard {
        name,
        description,
        personality,
        background,
        stats,
        skills,
        inventory,
    })
}

fn non_empty_string(field: &str, value: &Value, issues: &mut Vec<ValidationIssue>) -> String {
    let Some(s) = value.as_str() else {
        issues.push(ValidationIssue::new(field, "invalid_type", "Expected a string value."));
        return String::new();
    };
    let trimmed = s.trim();
    if trimmed.is_empty() {
        issues.push(ValidationIssue::new(field, "empty_string", "Value cannot be empty."));
    }
    trimmed.to_string()
}

fn bounded_score(field: &str, value: &Value, issues: &mut Vec<ValidationIssue>) -> Option<i64> {
    // JSON booleans are not integers even though some decoders coerce them.
    let Some(n) = value.as_i64() else {
        issues.push(ValidationIssue::new(field, "invalid_type", "Expected an integer value."));
        return None;
    };
    if !(SCORE_MIN..=SCORE_MAX).contains(&n) {
        issues.push(ValidationIssue::new(
            field,
            "out_of_range",
            format!("Expected value between {SCORE_MIN} and {SCORE_MAX}."),
        ));
        return None;
    }
    Some(n)
}

fn stats(value: &Value, issues: &mut Vec<ValidationIssue>) -> Vec<(String, i64)> {
    let Some(obj) = value.as_object() else {
        issues.push(ValidationIssue::new("stats", "invalid_type", "Expected an object for stats."));
        return Vec::new();
    };
    for key in obj.keys().filter(|k| !STAT_FIELDS.contains(&k.as_str())) {
        issues.push(ValidationIssue::new(
            format!("stats.{key}"),
            "unknown_field",
            "Unknown stat is not allowed.",
        ));
    }

    let mut out = Vec::with_capacity(STAT_FIELDS.len());
    for stat in STAT_FIELDS {
        let field = format!("stats.{stat}");
        match obj.get(stat) {
            None => issues.push(ValidationIssue::new(field, "missing_field", "Required stat is missing.")),
            Some(v) => {
                if let Some(n) = bounded_score(&field, v, issues) {
                    out.push((stat.to_string(), n));
                }
            }
        }
    }
    out
}

fn skills(value: &Value, issues: &mut Vec<ValidationIssue>) -> BTreeMap<String, i64> {
    let Some(obj) = value.as_object() else {
        issues.push(ValidationIssue::new("skills", "invalid_type", "Expected an object for skills."));
        return BTreeMap::new();
    };
    let mut out = BTreeMap::new();
    for (raw_key, v) in obj {
        let key = raw_key.trim();
        if key.is_empty() {
            issues.push(ValidationIssue::new("skills", "empty_key", "Skill keys must be non-empty strings."));
            continue;
        }
        if let Some(n) = bounded_score(&format!("skills.{key}"), v, issues) {
            out.insert(key.to_string(), n);
        }
    }
    out
}

fn inventory(value: &Value, issues: &mut Vec<ValidationIssue>) -> Vec<String> {
    let Some(items) = value.as_array() else {
        issues.push(ValidationIssue::new("inventory", "invalid_type", "Expected a list for inventory."));
        return Vec::new();
    };
    let mut out = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let field = format!("inventory[{idx}]");
        match item.as_str().map(str::trim) {
            None => issues.push(ValidationIssue::new(field, "invalid_type", "Inventory item must be a string.")),
            Some("") => issues.push(ValidationIssue::new(field, "empty_string", "Inventory item cannot be empty.")),
            Some(s) => out.push(s.to_string()),
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn kovach_json() -> Value {
        json!({
            "name": "Kovach",
            "description": "A weathered dock foreman.",
            "personality": "Gruff, loyal, superstitious.",
            "background": "Worked the Arkham docks for twenty years.",
            "stats": {"STR": 70, "CON": 65, "DEX": 50, "INT": 55, "POW": 45,
                      "APP": 40, "SIZ": 75, "EDU": 40, "HP": 14, "SAN": 45, "MP": 9},
            "skills": {"Spot Hidden": 45, "Brawl": 60},
            "inventory": ["crowbar", " flask of rye "]
        })
    }

    #[test]
    fn valid_card_parses() {
        let card = parse_card(&kovach_json()).unwrap();
        assert_eq!(card.name, "Kovach");
        assert_eq!(card.stats.len(), 11);
        assert_eq!(card.stats[0], ("STR".to_string(), 70));
        assert_eq!(card.stats[10], ("MP".to_string(), 9));
        assert_eq!(card.skills.get("Brawl"), Some(&60));
        assert_eq!(card.inventory, vec!["crowbar", "flask of rye"]);
    }

    #[test]
    fn every_issue_is_reported_sorted() {
        let mut payload = kovach_json();
        payload["stats"]["HP"] = json!(140);
        payload["stats"].as_object_mut().unwrap().remove("SAN");
        payload["name"] = json!("   ");
        payload["inventory"] = json!(["ok", 3]);
        payload["alignment"] = json!("chaotic");

        let Err(IdentityError::Invalid(issues)) = parse_card(&payload) else {
            panic!("expected validation failure");
        };
        let fields: Vec<&str> = issues.iter().map(|i| i.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["alignment", "inventory[1]", "name", "stats.HP", "stats.SAN"]
        );
        assert_eq!(issues[3].code, "out_of_range");
        assert_eq!(issues[4].code, "missing_field");
    }

    #[test]
    fn boolean_is_not_a_score() {
        let mut payload = kovach_json();
        payload["skills"]["Brawl"] = json!(true);
        let Err(IdentityError::Invalid(issues)) = parse_card(&payload) else {
            panic!("expected validation failure");
        };
        assert_eq!(issues[0].field, "skills.Brawl");
        assert_eq!(issues[0].code, "invalid_type");
    }

    #[test]
    fn non_object_root_rejected() {
        let err = parse_card(&json!(["not", "a", "card"])).unwrap_err();
        assert!(err.to_string().contains("root must be an object"));
    }

    #[tokio::test]
    async fn file_source_rereads_every_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("kovach.json");
        std::fs::write(&path, kovach_json().to_string()).unwrap();

        let source = FileIdentitySource;
        let identity = IdentityRef::new(&path);
        assert_eq!(source.load(&identity).await.unwrap().name, "Kovach");

        let mut edited = kovach_json();
        edited["name"] = json!("Old Kovach");
        std::fs::write(&path, edited.to_string()).unwrap();
        assert_eq!(source.load(&identity).await.unwrap().name, "Old Kovach");
    }

    #[tokio::test]
    async fn missing_and_malformed_files() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = load_card(&tmp.path().join("nope.json")).await.unwrap_err();
        assert!(matches!(missing, IdentityError::NotFound(_)));

        let bad = tmp.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        let malformed = load_card(&bad).await.unwrap_err();
        assert!(matches!(malformed, IdentityError::Malformed { .. }));
    }
}
