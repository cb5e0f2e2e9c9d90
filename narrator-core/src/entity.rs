//! Entity records supplied by the external entity store.
//!
//! The narrator never owns entity lifecycle. Records arrive as raw JSON and are
//! validated into one typed struct per kind at the store boundary; fields the
//! core does not read are preserved in `extra` so they still count toward the
//! sticky-context budget and still render for the model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Errors from reading or validating entity records.
#[derive(Debug, Error)]
pub enum EntityError {
    #[error("Invalid {kind} record at index {index}: {reason}")]
    Invalid {
        kind: EntityKind,
        index: usize,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The three entity kinds the narrator retrieves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Character,
    Event,
    Law,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Character => "character",
            EntityKind::Event => "event",
            EntityKind::Law => "law",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common view over every entity kind.
pub trait Record: Clone {
    const KIND: EntityKind;

    /// Stable identifier.
    fn id(&self) -> &str;

    /// Display name (character name, law title, event summary).
    fn label(&self) -> &str;

    /// Total character count of every string value in the record.
    fn string_chars(&self) -> usize;
}

/// A character in the world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub current_task: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub status: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Character {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            title: String::new(),
            current_task: String::new(),
            category: String::new(),
            location: String::new(),
            status: String::new(),
            extra: Map::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_current_task(mut self, task: impl Into<String>) -> Self {
        self.current_task = task.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }
}

impl Record for Character {
    const KIND: EntityKind = EntityKind::Character;

    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.name
    }

    fn string_chars(&self) -> usize {
        [
            &self.id,
            &self.name,
            &self.title,
            &self.current_task,
            &self.category,
            &self.location,
            &self.status,
        ]
        .iter()
        .map(|s| s.chars().count())
        .sum::<usize>()
            + map_chars(&self.extra)
    }
}

/// A past event in the world's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub summary: String,
    #[serde(default)]
    pub date: String,
    /// IDs of the characters involved.
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default, rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub location: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    pub fn new(id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            summary: summary.into(),
            date: String::new(),
            characters: Vec::new(),
            event_type: String::new(),
            location: String::new(),
            extra: Map::new(),
        }
    }

    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.date = date.into();
        self
    }

    pub fn with_characters<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.characters = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }
}

impl Record for Event {
    const KIND: EntityKind = EntityKind::Event;

    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.summary
    }

    fn string_chars(&self) -> usize {
        [
            &self.id,
            &self.summary,
            &self.date,
            &self.event_type,
            &self.location,
        ]
        .iter()
        .map(|s| s.chars().count())
        .sum::<usize>()
            + self
                .characters
                .iter()
                .map(|c| c.chars().count())
                .sum::<usize>()
            + map_chars(&self.extra)
    }
}

/// A law in force (or formerly in force).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Law {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub category: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Law {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            summary: String::new(),
            status: String::new(),
            category: String::new(),
            extra: Map::new(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }
}

impl Record for Law {
    const KIND: EntityKind = EntityKind::Law;

    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.title
    }

    fn string_chars(&self) -> usize {
        [
            &self.id,
            &self.title,
            &self.summary,
            &self.status,
            &self.category,
        ]
        .iter()
        .map(|s| s.chars().count())
        .sum::<usize>()
            + map_chars(&self.extra)
    }
}

/// Character count of every string value inside a JSON value, recursing
/// through arrays and objects. Object keys are not counted.
pub fn value_chars(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.iter().map(value_chars).sum(),
        Value::Object(map) => map_chars(map),
        Value::Null | Value::Bool(_) | Value::Number(_) => 0,
    }
}

fn map_chars(map: &Map<String, Value>) -> usize {
    map.values().map(value_chars).sum()
}

/// Validate one raw record into a typed entity.
pub fn validate<T>(raw: Value, index: usize) -> Result<T, EntityError>
where
    T: Record + for<'de> Deserialize<'de>,
{
    let invalid = |reason: String| EntityError::Invalid {
        kind: T::KIND,
        index,
        reason,
    };

    if !raw.is_object() {
        return Err(invalid("record is not a JSON object".to_string()));
    }

    let record: T = serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?;

    if record.id().trim().is_empty() {
        return Err(invalid("empty id".to_string()));
    }
    if record.label().trim().is_empty() {
        return Err(invalid("empty name/title/summary".to_string()));
    }

    Ok(record)
}
