//! Compact indices injected into the router call.
//!
//! One line per entity, fields separated by ` | ` in a fixed order, so the
//! router model can pick IDs without seeing full records.

use crate::entity::{Character, Event};

/// Default number of events included in the event index.
pub const DEFAULT_EVENT_INDEX_LIMIT: usize = 100;

/// Event summaries longer than this are cut in the index.
const SUMMARY_CHARS: usize = 120;

/// `id | name | title | location | status` per character, in store order.
pub fn character_index(characters: &[Character]) -> String {
    characters
        .iter()
        .map(|c| {
            [
                c.id.as_str(),
                c.name.as_str(),
                c.title.as_str(),
                c.location.as_str(),
                c.status.as_str(),
            ]
            .map(clean)
            .join(" | ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// `id | date | summary | character ids` for the most recent `limit` events,
/// oldest first so the most recent event is the last line.
///
/// Events are ordered by date; undated events count as the oldest.
pub fn event_index(events: &[Event], limit: usize) -> String {
    let mut ordered: Vec<&Event> = events.iter().collect();
    ordered.sort_by(|a, b| a.date.cmp(&b.date));

    let skip = ordered.len().saturating_sub(limit);
    ordered[skip..]
        .iter()
        .map(|e| {
            format!(
                "{} | {} | {} | {}",
                clean(&e.id),
                clean(&e.date),
                truncate(&clean(&e.summary), SUMMARY_CHARS),
                e.characters.join(",")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn clean(field: &str) -> String {
    field.replace(['\n', '\r'], " ").replace('|', "/")
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}
