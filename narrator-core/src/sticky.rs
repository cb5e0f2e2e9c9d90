//! Sticky context: retrieved entities that survive across exchanges.
//!
//! The store holds three typed pools and an estimated token cost. The estimate
//! is recomputed after every batch insert; crossing the budget is reported to
//! the caller, who must `clear()` before continuing. Clearing is the only
//! eviction: an episode keeps everything it retrieved or nothing at all.

use crate::entity::{value_chars, Character, Event, Law, Record};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt::Write;

/// Default budget in estimated tokens.
pub const DEFAULT_TOKEN_BUDGET: usize = 3000;

/// Characters per estimated token.
const CHARS_PER_TOKEN: usize = 4;

/// A resident entity with its optional detail attachment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StickyEntry<T> {
    pub entity: T,
    pub detail: Vec<Value>,
}

impl<T: Record> StickyEntry<T> {
    fn string_chars(&self) -> usize {
        self.entity.string_chars() + self.detail.iter().map(value_chars).sum::<usize>()
    }
}

/// Diagnostic view of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StickySnapshot {
    pub character_ids: Vec<String>,
    pub event_ids: Vec<String>,
    pub law_ids: Vec<String>,
    pub events_with_detail: Vec<String>,
    pub estimated_tokens: usize,
    pub budget: usize,
}

/// Budget-capped memory for one episode.
#[derive(Debug, Clone)]
pub struct StickyContext {
    characters: Vec<StickyEntry<Character>>,
    events: Vec<StickyEntry<Event>>,
    laws: Vec<StickyEntry<Law>>,
    budget: usize,
    estimated_tokens: usize,
}

impl StickyContext {
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_TOKEN_BUDGET)
    }

    pub fn with_budget(budget: usize) -> Self {
        Self {
            characters: Vec::new(),
            events: Vec::new(),
            laws: Vec::new(),
            budget,
            estimated_tokens: 0,
        }
    }

    /// Insert or overwrite characters. Returns `true` when the store is now
    /// over budget.
    pub fn add_characters(&mut self, characters: impl IntoIterator<Item = Character>) -> bool {
        for character in characters {
            upsert(&mut self.characters, character);
        }
        self.recompute()
    }

    /// Insert or overwrite events. Returns `true` when the store is now over
    /// budget.
    pub fn add_events(&mut self, events: impl IntoIterator<Item = Event>) -> bool {
        for event in events {
            upsert(&mut self.events, event);
        }
        self.recompute()
    }

    /// Insert or overwrite laws. Returns `true` when the store is now over
    /// budget.
    pub fn add_laws(&mut self, laws: impl IntoIterator<Item = Law>) -> bool {
        for law in laws {
            upsert(&mut self.laws, law);
        }
        self.recompute()
    }

    /// Attach detail records to a resident event, replacing any earlier
    /// attachment. Returns `None` when the event is not resident, otherwise
    /// whether the store is now over budget.
    pub fn add_event_detail(&mut self, event_id: &str, detail: Vec<Value>) -> Option<bool> {
        let entry = self.events.iter_mut().find(|e| e.entity.id == event_id)?;
        entry.detail = detail;
        Some(self.recompute())
    }

    /// Current estimate: total characters of every string value, divided by
    /// four, rounded up.
    pub fn estimate_tokens(&self) -> usize {
        self.estimated_tokens
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn is_over_budget(&self) -> bool {
        self.estimated_tokens > self.budget
    }

    /// Drop every entry and reset the estimate.
    pub fn clear(&mut self) {
        *self = Self::with_budget(self.budget);
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty() && self.events.is_empty() && self.laws.is_empty()
    }

    pub fn len(&self) -> usize {
        self.characters.len() + self.events.len() + self.laws.len()
    }

    pub fn character_ids(&self) -> Vec<String> {
        ids(&self.characters)
    }

    pub fn event_ids(&self) -> Vec<String> {
        ids(&self.events)
    }

    pub fn law_ids(&self) -> Vec<String> {
        ids(&self.laws)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.characters.iter().any(|e| e.entity.id == id)
            || self.events.iter().any(|e| e.entity.id == id)
            || self.laws.iter().any(|e| e.entity.id == id)
    }

    pub fn snapshot(&self) -> StickySnapshot {
        StickySnapshot {
            character_ids: self.character_ids(),
            event_ids: self.event_ids(),
            law_ids: self.law_ids(),
            events_with_detail: self
                .events
                .iter()
                .filter(|e| !e.detail.is_empty())
                .map(|e| e.entity.id.clone())
                .collect(),
            estimated_tokens: self.estimated_tokens,
            budget: self.budget,
        }
    }

    /// Render the three pools as prompt text. Empty store renders as an empty
    /// string.
    pub fn format_for_prompt(&self) -> String {
        if self.is_empty() {
            return String::new();
        }

        let mut out = String::new();

        out.push_str("### Characters\n");
        if self.characters.is_empty() {
            out.push_str("- (none)\n");
        }
        for entry in &self.characters {
            let c = &entry.entity;
            let _ = write!(out, "- [{}] {}", c.id, c.name);
            push_field(&mut out, "title", &c.title);
            push_field(&mut out, "category", &c.category);
            push_field(&mut out, "location", &c.location);
            push_field(&mut out, "status", &c.status);
            push_field(&mut out, "task", &c.current_task);
            push_extra(&mut out, &c.extra);
            out.push('\n');
        }

        out.push_str("\n### Events\n");
        if self.events.is_empty() {
            out.push_str("- (none)\n");
        }
        for entry in &self.events {
            let e = &entry.entity;
            let _ = write!(out, "- [{}] {}", e.id, e.summary);
            push_field(&mut out, "date", &e.date);
            push_field(&mut out, "type", &e.event_type);
            push_field(&mut out, "location", &e.location);
            push_field(&mut out, "characters", &e.characters.join(", "));
            push_extra(&mut out, &e.extra);
            out.push('\n');
            for record in &entry.detail {
                let _ = writeln!(out, "    > {}", compact(record));
            }
        }

        out.push_str("\n### Laws\n");
        if self.laws.is_empty() {
            out.push_str("- (none)\n");
        }
        for entry in &self.laws {
            let l = &entry.entity;
            let _ = write!(out, "- [{}] {}", l.id, l.title);
            push_field(&mut out, "status", &l.status);
            push_field(&mut out, "category", &l.category);
            push_field(&mut out, "summary", &l.summary);
            push_extra(&mut out, &l.extra);
            out.push('\n');
        }

        out
    }

    fn recompute(&mut self) -> bool {
        let chars = pool_chars(&self.characters) + pool_chars(&self.events) + pool_chars(&self.laws);
        self.estimated_tokens = chars.div_ceil(CHARS_PER_TOKEN);
        self.is_over_budget()
    }
}

impl Default for StickyContext {
    fn default() -> Self {
        Self::new()
    }
}

fn upsert<T: Record>(pool: &mut Vec<StickyEntry<T>>, entity: T) {
    match pool.iter_mut().find(|e| e.entity.id() == entity.id()) {
        Some(existing) => existing.entity = entity,
        None => pool.push(StickyEntry {
            entity,
            detail: Vec::new(),
        }),
    }
}

fn pool_chars<T: Record>(pool: &[StickyEntry<T>]) -> usize {
    pool.iter().map(StickyEntry::string_chars).sum()
}

fn ids<T: Record>(pool: &[StickyEntry<T>]) -> Vec<String> {
    pool.iter().map(|e| e.entity.id().to_string()).collect()
}

fn push_field(out: &mut String, label: &str, value: &str) {
    if !value.is_empty() {
        let _ = write!(out, " | {label}: {value}");
    }
}

fn push_extra(out: &mut String, extra: &Map<String, Value>) {
    for (key, value) in extra {
        match value {
            Value::Null => {}
            Value::String(s) if s.is_empty() => {}
            Value::String(s) => push_field(out, key, s),
            other => push_field(out, key, &compact(other)),
        }
    }
}

fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
