//! Read-only access to the authoritative entity database.
//!
//! The database itself lives outside the narrator. [`EntityStore`] is the
//! read seam; [`MemoryStore`] is a validating in-memory implementation built
//! from raw JSON records, used by the headless binary and by tests.

use crate::entity::{validate, Character, EntityError, EntityKind, Event, Law};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

/// Read access to entity collections.
pub trait EntityStore: Send + Sync {
    fn characters(&self) -> Vec<Character>;

    fn events(&self) -> Vec<Event>;

    fn laws(&self) -> Vec<Law>;

    /// Detail sub-records extracted from an event (dialogue lines, witness
    /// statements and so on). Empty when the event has none.
    fn event_detail(&self, event_id: &str) -> Vec<Value>;
}

/// In-memory entity store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    characters: Vec<Character>,
    events: Vec<Event>,
    laws: Vec<Law>,
    details: HashMap<String, Vec<Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from already-typed entities.
    pub fn from_entities(characters: Vec<Character>, events: Vec<Event>, laws: Vec<Law>) -> Self {
        Self {
            characters,
            events,
            laws,
            details: HashMap::new(),
        }
    }

    /// Validate a list of raw records of one kind and add them to the store.
    ///
    /// Event records may carry a `details` array; it is split off and kept as
    /// the event's detail sub-records.
    pub fn add_records(&mut self, kind: EntityKind, records: Vec<Value>) -> Result<(), EntityError> {
        for (index, raw) in records.into_iter().enumerate() {
            match kind {
                EntityKind::Character => self.characters.push(validate(raw, index)?),
                EntityKind::Law => self.laws.push(validate(raw, index)?),
                EntityKind::Event => {
                    let mut raw = raw;
                    let details = raw
                        .as_object_mut()
                        .and_then(|obj| obj.remove("details"));
                    let event: Event = validate(raw, index)?;
                    if let Some(Value::Array(details)) = details {
                        if !details.is_empty() {
                            self.details.insert(event.id.clone(), details);
                        }
                    }
                    self.events.push(event);
                }
            }
        }
        Ok(())
    }

    /// Parse a world document: `{"characters": [...], "events": [...], "laws": [...]}`.
    /// Missing collections are treated as empty.
    pub fn from_json_str(json: &str) -> Result<Self, EntityError> {
        let mut world: Value = serde_json::from_str(json)?;
        let mut store = Self::new();

        for (key, kind) in [
            ("characters", EntityKind::Character),
            ("events", EntityKind::Event),
            ("laws", EntityKind::Law),
        ] {
            let records = match world.get_mut(key).map(Value::take) {
                Some(Value::Array(records)) => records,
                Some(Value::Null) | None => Vec::new(),
                Some(_) => {
                    return Err(EntityError::Invalid {
                        kind,
                        index: 0,
                        reason: format!("`{key}` is not an array"),
                    })
                }
            };
            store.add_records(kind, records)?;
        }

        Ok(store)
    }

    /// Load a world document from disk.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, EntityError> {
        let content = fs::read_to_string(path).await?;
        Self::from_json_str(&content)
    }

    /// Attach detail records to an event.
    pub fn insert_detail(&mut self, event_id: impl Into<String>, details: Vec<Value>) {
        self.details.insert(event_id.into(), details);
    }

    pub fn character_count(&self) -> usize {
        self.characters.len()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn law_count(&self) -> usize {
        self.laws.len()
    }
}

impl EntityStore for MemoryStore {
    fn characters(&self) -> Vec<Character> {
        self.characters.clone()
    }

    fn events(&self) -> Vec<Event> {
        self.events.clone()
    }

    fn laws(&self) -> Vec<Law> {
        self.laws.clone()
    }

    fn event_detail(&self, event_id: &str) -> Vec<Value> {
        self.details.get(event_id).cloned().unwrap_or_default()
    }
}
