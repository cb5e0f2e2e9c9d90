//! Parsing generation responses.
//!
//! A generation response is narrative prose followed by a trailing fenced JSON
//! block of scene metadata. A missing or malformed block never fails the
//! turn: the narrative is kept and the metadata falls back to its defaults.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Gap kinds that can be resolved by a direct store lookup.
pub const ENTITY_UNKNOWN: &str = "entity_unknown";

/// A structured hint that the generation call lacked information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingContext {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub fixable: bool,
}

impl MissingContext {
    pub fn new(kind: impl Into<String>, description: impl Into<String>, fixable: bool) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            fixable,
        }
    }

    pub fn is_entity_unknown(&self) -> bool {
        self.kind == ENTITY_UNKNOWN
    }
}

/// Classification of the gaps a response reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GapClass {
    /// At least one gap can be fixed by another retrieval.
    MissingContextFixable,
    /// Every gap is beyond what the archive holds.
    MissingContextUnfixable,
}

impl GapClass {
    /// `None` when there are no gaps at all.
    pub fn classify(gaps: &[MissingContext]) -> Option<Self> {
        if gaps.is_empty() {
            None
        } else if gaps.iter().any(|g| g.fixable) {
            Some(GapClass::MissingContextFixable)
        } else {
            Some(GapClass::MissingContextUnfixable)
        }
    }
}

/// Scene metadata reported by the generation call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GenerationMetadata {
    pub scene_characters: Vec<String>,
    pub location: Option<String>,
    pub date: Option<String>,
    pub awaiting_roll: bool,
    pub roll_type: Option<String>,
    pub summary_update: Option<String>,
    pub events: Vec<Value>,
    pub dialogue: Vec<Value>,
    pub actor_acted: bool,
    pub confidence: Option<f64>,
    pub missing_context: Vec<MissingContext>,
}

impl GenerationMetadata {
    /// Read each field on its own so one badly typed value does not cost the
    /// rest of the block. Returns the names of the fields that were ignored.
    pub fn from_fields(fields: &Map<String, Value>) -> (Self, Vec<String>) {
        let mut dropped = Vec::new();
        let metadata = GenerationMetadata {
            scene_characters: lenient(fields, "sceneCharacters", &mut dropped),
            location: lenient(fields, "location", &mut dropped),
            date: lenient(fields, "date", &mut dropped),
            awaiting_roll: lenient(fields, "awaitingRoll", &mut dropped),
            roll_type: lenient(fields, "rollType", &mut dropped),
            summary_update: lenient(fields, "summaryUpdate", &mut dropped),
            events: lenient(fields, "events", &mut dropped),
            dialogue: lenient(fields, "dialogue", &mut dropped),
            actor_acted: lenient(fields, "actorActed", &mut dropped),
            confidence: lenient(fields, "confidence", &mut dropped),
            missing_context: missing_context(fields, &mut dropped),
        };
        (metadata, dropped)
    }
}

/// Deserialize one field, falling back to its default when absent or mistyped.
fn lenient<T: DeserializeOwned + Default>(
    fields: &Map<String, Value>,
    key: &str,
    dropped: &mut Vec<String>,
) -> T {
    match fields.get(key) {
        None | Some(Value::Null) => T::default(),
        Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|_| {
            dropped.push(key.to_string());
            T::default()
        }),
    }
}

/// Gaps are read entry by entry; a malformed entry is skipped on its own.
fn missing_context(fields: &Map<String, Value>, dropped: &mut Vec<String>) -> Vec<MissingContext> {
    match fields.get("missingContext") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| match serde_json::from_value(entry.clone()) {
                Ok(gap) => Some(gap),
                Err(_) => {
                    dropped.push(format!("missingContext[{i}]"));
                    None
                }
            })
            .collect(),
        Some(_) => {
            dropped.push("missingContext".to_string());
            Vec::new()
        }
    }
}

/// A generation response split into prose and metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub narrative: String,
    pub metadata: GenerationMetadata,
    /// Whether a well-formed metadata block was found.
    pub has_metadata: bool,
}

impl ParsedResponse {
    pub fn parse(text: &str) -> Self {
        let Some((narrative, json)) = split_trailing_block(text) else {
            warn!("generation response has no metadata block");
            return Self {
                narrative: text.trim().to_string(),
                metadata: GenerationMetadata::default(),
                has_metadata: false,
            };
        };

        let (metadata, has_metadata) = match serde_json::from_str::<Value>(json) {
            Ok(Value::Object(fields)) => {
                let (metadata, dropped) = GenerationMetadata::from_fields(&fields);
                if !dropped.is_empty() {
                    warn!(?dropped, "metadata fields with unexpected shape were ignored");
                }
                (metadata, true)
            }
            Ok(_) => {
                warn!("metadata block is not an object, using defaults");
                (GenerationMetadata::default(), false)
            }
            Err(e) => {
                warn!(error = %e, "malformed metadata block, using defaults");
                (GenerationMetadata::default(), false)
            }
        };

        if metadata.actor_acted {
            warn!("self-check failed: narrator acted on the player's behalf");
        }

        Self {
            narrative: narrative.trim().to_string(),
            metadata,
            has_metadata,
        }
    }

    pub fn gap_class(&self) -> Option<GapClass> {
        GapClass::classify(&self.metadata.missing_context)
    }
}

/// Split off the last fenced block. Returns the text before it and the block
/// content.
fn split_trailing_block(text: &str) -> Option<(&str, &str)> {
    let start = text.rfind("```json").or_else(|| {
        // An unlabelled fence: the opening one is the second-to-last fence.
        let close = text.rfind("```")?;
        text[..close].rfind("```")
    })?;

    let after_tag = &text[start + 3..];
    let content_start = start + 3 + after_tag.find('\n').unwrap_or(0);
    let rest = &text[content_start..];
    let content = match rest.find("```") {
        Some(end) => &rest[..end],
        None => rest,
    };

    let content = content.trim();
    let content = content.strip_prefix("json").unwrap_or(content).trim();
    if !content.starts_with('{') {
        return None;
    }
    Some((&text[..start], content))
}

/// Extract JSON from a reply that may be wrapped in a markdown code fence.
pub(crate) fn extract_json(text: &str) -> &str {
    let text = text.trim();

    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    text
}
