//! Front matter parsing
//!
//! Item content may begin with a metadata block between `---` delimiters,
//! written as YAML (or JSON, which YAML accepts):
//!
//! ```text
//! ---
//! type: prompt
//! project: onboarding
//! labels: [welcome, email]
//! ---
//! # Greeting
//! Hello {{name}}
//! ```

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_yaml::{Mapping, Value};

use crate::error::Result;

fn block_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)\A---[ \t]*\r?\n(.*?)\r?\n---[ \t]*(?:\r?\n(.*))?\z").unwrap())
}

fn heading_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?m)^#+\s").unwrap())
}

/// Parsed metadata block plus the remaining body
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrontMatter {
    pub fields: Mapping,
    pub body: String,
}

impl FrontMatter {
    /// Split content into metadata and body.
    ///
    /// Content without a block, or with a block that does not parse as a
    /// mapping, yields empty metadata and the whole input as body.
    pub fn parse(content: &str) -> Self {
        let Some(caps) = block_pattern().captures(content) else {
            return Self {
                fields: Mapping::new(),
                body: content.to_string(),
            };
        };

        let raw = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default().to_string();

        match serde_yaml::from_str::<Value>(raw) {
            Ok(Value::Mapping(fields)) => Self { fields, body },
            _ => Self {
                fields: Mapping::new(),
                body: content.to_string(),
            },
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// String value of a scalar field
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Label set, accepting a sequence or a comma separated string
    pub fn labels(&self) -> BTreeSet<String> {
        match self.get("labels") {
            Some(Value::Sequence(seq)) => seq
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            _ => BTreeSet::new(),
        }
    }

    /// Number of markdown headings in the body
    pub fn section_count(&self) -> usize {
        heading_pattern().find_iter(&self.body).count()
    }

    /// Keys whose values differ between two blocks, sorted
    pub fn changed_keys(&self, other: &FrontMatter) -> Vec<String> {
        let mut keys: BTreeSet<String> = BTreeSet::new();
        for key in self.fields.keys().chain(other.fields.keys()) {
            if let Some(k) = key.as_str() {
                if self.get(k) != other.get(k) {
                    keys.insert(k.to_string());
                }
            }
        }
        keys.into_iter().collect()
    }

    /// Serialize back to `---` delimited content
    pub fn render(&self) -> Result<String> {
        if self.fields.is_empty() {
            return Ok(self.body.clone());
        }
        let yaml = serde_yaml::to_string(&self.fields)?;
        Ok(format!("---\n{}---\n{}", yaml, self.body))
    }
}
