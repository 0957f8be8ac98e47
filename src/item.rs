//! Item types and structures

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Kind of artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Prompt,
    Template,
    Chat,
}

impl ItemType {
    pub const ALL: [ItemType; 3] = [ItemType::Prompt, ItemType::Template, ItemType::Chat];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Prompt => "prompt",
            ItemType::Template => "template",
            ItemType::Chat => "chat",
        }
    }

    /// Directory name for items of this type
    pub fn dir_name(&self) -> &'static str {
        match self {
            ItemType::Prompt => "prompts",
            ItemType::Template => "templates",
            ItemType::Chat => "chats",
        }
    }

    fn from_dir_name(dir: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.dir_name() == dir)
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemType {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s || t.dir_name() == s)
            .ok_or_else(|| VaultError::validation(format!("Unknown item type: {}", s)))
    }
}

/// Immutable item identifier (26 Crockford base32 characters when generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId(String);

impl ItemId {
    /// Generate a time-ordered identifier: 10 timestamp chars then 16 random chars
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(26);
        let mut t = millis;
        let mut stamp = [0u8; 10];
        for slot in stamp.iter_mut().rev() {
            *slot = CROCKFORD[(t % 32) as usize];
            t /= 32;
        }
        out.extend_from_slice(&stamp);

        let random = uuid::Uuid::new_v4();
        for byte in random.as_bytes().iter().take(16) {
            out.push(CROCKFORD[(byte % 32) as usize]);
        }

        Self(String::from_utf8_lossy(&out).into_owned())
    }

    pub fn parse(s: &str) -> Result<Self> {
        let valid = !s.is_empty()
            && s.len() <= 64
            && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(VaultError::validation(format!("Invalid item id: {:?}", s)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ItemId {
    type Error = VaultError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

impl FromStr for ItemId {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Storage path of an item, `"{type}s/{id}"`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemPath {
    pub item_type: ItemType,
    pub id: ItemId,
}

impl ItemPath {
    pub fn new(item_type: ItemType, id: ItemId) -> Self {
        Self { item_type, id }
    }

    pub fn parse(path: &str) -> Result<Self> {
        let (dir, id) = path
            .trim_matches('/')
            .split_once('/')
            .ok_or_else(|| VaultError::not_found("path", path))?;
        let item_type = ItemType::from_dir_name(dir).ok_or_else(|| VaultError::not_found("path", path))?;
        Ok(Self::new(item_type, ItemId::parse(id)?))
    }
}

impl fmt::Display for ItemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.item_type.dir_name(), self.id)
    }
}

/// Declared type of a template variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    #[default]
    Str,
    Int,
    Float,
    Bool,
}

/// A placeholder a template expects to be filled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateVariable {
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: VariableType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

impl TemplateVariable {
    pub fn new(name: impl Into<String>, var_type: VariableType) -> Self {
        Self {
            name: name.into(),
            var_type,
            description: None,
            default_value: None,
        }
    }
}

/// Type-specific metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ItemKind {
    Prompt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
    },
    Template {
        #[serde(default)]
        variables: Vec<TemplateVariable>,
    },
    Chat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        #[serde(default)]
        turn_count: u32,
    },
}

impl ItemKind {
    pub fn prompt() -> Self {
        ItemKind::Prompt { project: None }
    }

    pub fn template(variables: Vec<TemplateVariable>) -> Self {
        ItemKind::Template { variables }
    }

    pub fn chat() -> Self {
        ItemKind::Chat {
            provider: None,
            model: None,
            conversation_id: None,
            turn_count: 0,
        }
    }

    pub fn item_type(&self) -> ItemType {
        match self {
            ItemKind::Prompt { .. } => ItemType::Prompt,
            ItemKind::Template { .. } => ItemType::Template,
            ItemKind::Chat { .. } => ItemType::Chat,
        }
    }

    /// Chat provider, if recorded
    pub fn provider(&self) -> Option<&str> {
        match self {
            ItemKind::Chat { provider, .. } => provider.as_deref(),
            _ => None,
        }
    }

    /// Recompute content-derived fields after a write
    pub fn refresh_from_content(&mut self, content: &str) {
        if let ItemKind::Chat { turn_count, .. } = self {
            if let Some(turns) = count_user_turns(content) {
                *turn_count = turns;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if let ItemKind::Template { variables } = self {
            let mut seen = BTreeSet::new();
            for var in variables {
                if !identifier_pattern().is_match(&var.name) {
                    return Err(VaultError::validation(format!(
                        "Invalid template variable name: {:?}",
                        var.name
                    )));
                }
                if !seen.insert(var.name.as_str()) {
                    return Err(VaultError::validation(format!(
                        "Duplicate template variable: {}",
                        var.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Count user messages in a JSON chat transcript
fn count_user_turns(content: &str) -> Option<u32> {
    let value: serde_json::Value = serde_json::from_str(content).ok()?;
    let messages = value.get("messages")?.as_array()?;
    let turns = messages
        .iter()
        .filter(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"))
        .count();
    Some(turns as u32)
}

fn slug_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").unwrap())
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap())
}

/// A managed artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Item {
    pub id: ItemId,
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub kind: ItemKind,
}

impl Item {
    pub fn item_type(&self) -> ItemType {
        self.kind.item_type()
    }

    pub fn path(&self) -> ItemPath {
        ItemPath::new(self.item_type(), self.id.clone())
    }

    /// Check field constraints
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(VaultError::validation("title is required"));
        }
        if !slug_pattern().is_match(&self.slug) {
            return Err(VaultError::validation(format!(
                "slug must be lowercase words joined by '-': {:?}",
                self.slug
            )));
        }
        if self.author.trim().is_empty() {
            return Err(VaultError::validation("author is required"));
        }
        for label in &self.labels {
            if label.is_empty() || label.trim() != label {
                return Err(VaultError::validation(format!("Invalid label: {:?}", label)));
            }
        }
        self.kind.validate()
    }
}

/// Input for creating an item
#[derive(Debug, Clone)]
pub struct NewItem {
    pub id: Option<ItemId>,
    pub kind: ItemKind,
    pub slug: String,
    pub title: String,
    pub description: String,
    pub labels: BTreeSet<String>,
}

impl NewItem {
    pub fn new(kind: ItemKind, slug: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: None,
            kind,
            slug: slug.into(),
            title: title.into(),
            description: String::new(),
            labels: BTreeSet::new(),
        }
    }

    pub fn with_id(mut self, id: ItemId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Materialize into a validated item
    pub fn into_item(self, author: &str, now: DateTime<Utc>) -> Result<Item> {
        let item = Item {
            id: self.id.unwrap_or_else(ItemId::generate),
            slug: self.slug,
            title: self.title,
            description: self.description,
            labels: self.labels,
            author: author.to_string(),
            created_at: now,
            updated_at: now,
            kind: self.kind,
        };
        item.validate()?;
        Ok(item)
    }
}

/// Partial metadata update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    pub slug: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub labels: Option<BTreeSet<String>>,
    pub kind: Option<ItemKind>,
}

impl ItemPatch {
    pub fn is_empty(&self) -> bool {
        self.slug.is_none()
            && self.title.is_none()
            && self.description.is_none()
            && self.labels.is_none()
            && self.kind.is_none()
    }

    /// Apply to a copy of `item`; the item type cannot change
    pub fn apply(self, item: &Item) -> Result<Item> {
        let mut next = item.clone();
        if let Some(slug) = self.slug {
            next.slug = slug;
        }
        if let Some(title) = self.title {
            next.title = title;
        }
        if let Some(description) = self.description {
            next.description = description;
        }
        if let Some(labels) = self.labels {
            next.labels = labels;
        }
        if let Some(kind) = self.kind {
            if kind.item_type() != item.item_type() {
                return Err(VaultError::validation(format!(
                    "cannot change item type from {} to {}",
                    item.item_type(),
                    kind.item_type()
                )));
            }
            next.kind = kind;
        }
        next.validate()?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_well_formed() {
        let a = ItemId::generate();
        let b = ItemId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 26);
        assert!(ItemId::parse(a.as_str()).is_ok());
    }

    #[test]
    fn test_rejects_path_like_ids() {
        assert!(ItemId::parse("../etc").is_err());
        assert!(ItemId::parse("").is_err());
    }

    #[test]
    fn test_item_path_round_trip() {
        let path = ItemPath::parse("templates/abc123").unwrap();
        assert_eq!(path.item_type, ItemType::Template);
        assert_eq!(path.to_string(), "templates/abc123");
        assert!(ItemPath::parse("widgets/abc").is_err());
        assert!(ItemPath::parse("prompts").is_err());
    }

    #[test]
    fn test_kind_serialization_is_tagged() {
        let kind = ItemKind::template(vec![TemplateVariable::new("name", VariableType::Str)]);
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "template");
        assert_eq!(json["variables"][0]["type"], "str");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let json = r#"{"type": "prompt", "project": "p", "color": "blue"}"#;
        assert!(serde_json::from_str::<ItemKind>(json).is_err());
    }

    #[test]
    fn test_validation() {
        let now = Utc::now();
        let ok = NewItem::new(ItemKind::prompt(), "welcome-email", "Welcome").into_item("ana", now);
        assert!(ok.is_ok());

        let bad_slug = NewItem::new(ItemKind::prompt(), "Welcome Email", "Welcome").into_item("ana", now);
        assert!(matches!(bad_slug, Err(VaultError::Validation(_))));

        let no_title = NewItem::new(ItemKind::prompt(), "x", "  ").into_item("ana", now);
        assert!(no_title.is_err());

        let dup_vars = ItemKind::template(vec![
            TemplateVariable::new("name", VariableType::Str),
            TemplateVariable::new("name", VariableType::Int),
        ]);
        assert!(NewItem::new(dup_vars, "t", "T").into_item("ana", now).is_err());
    }

    #[test]
    fn test_patch_cannot_change_type() {
        let item = NewItem::new(ItemKind::prompt(), "p", "P").into_item("ana", Utc::now()).unwrap();
        let patch = ItemPatch {
            kind: Some(ItemKind::chat()),
            ..Default::default()
        };
        assert!(patch.apply(&item).is_err());
    }

    #[test]
    fn test_chat_turns_from_transcript() {
        let mut kind = ItemKind::chat();
        kind.refresh_from_content(
            r#"{"messages": [{"role": "user"}, {"role": "assistant"}, {"role": "user"}]}"#,
        );
        assert!(matches!(kind, ItemKind::Chat { turn_count: 2, .. }));
    }
}
