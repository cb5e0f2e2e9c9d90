//! Layered prompt assembly.
//!
//! A generation prompt is an ordered list of system segments, each tagged as
//! cacheable or not:
//!
//! 1. static guidance (cacheable)
//! 2. the call-type template (cacheable)
//! 3. the persistent profile (cacheable, replaced by the refresh cycle)
//! 4. the dynamic scene: date, location, story so far, sticky context,
//!    retrieval notes and, on the final attempt, degradation instructions
//!    (never cacheable)
//!
//! The order keeps every cacheable segment ahead of the dynamic one so the
//! cached prefix survives from turn to turn.

use crate::sticky::StickyContext;
use claude::SystemBlock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Output budget used when a call type has no entry in the table.
pub const DEFAULT_MAX_OUTPUT_TOKENS: usize = 1500;

/// Template used when no template matches the call type.
const FALLBACK_TEMPLATE: &str = "narrative";

/// The kind of generation call being made.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CallType {
    Narrative,
    Dialogue,
    Action,
    Travel,
    /// Resolution of a dice roll requested by an earlier response.
    RollResult,
    SessionOpen,
    Other(String),
}

impl CallType {
    pub fn as_str(&self) -> &str {
        match self {
            CallType::Narrative => "narrative",
            CallType::Dialogue => "dialogue",
            CallType::Action => "action",
            CallType::Travel => "travel",
            CallType::RollResult => "roll_result",
            CallType::SessionOpen => "session_open",
            CallType::Other(name) => name,
        }
    }

    /// Output token budget for this call type.
    pub fn max_output_tokens(&self) -> usize {
        match self {
            CallType::Narrative | CallType::Action => 1500,
            CallType::Dialogue | CallType::RollResult => 1200,
            CallType::Travel => 1000,
            CallType::SessionOpen => 2000,
            CallType::Other(_) => DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }
}

impl From<&str> for CallType {
    fn from(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "narrative" => CallType::Narrative,
            "dialogue" => CallType::Dialogue,
            "action" => CallType::Action,
            "travel" => CallType::Travel,
            "roll_result" => CallType::RollResult,
            "session_open" => CallType::SessionOpen,
            other => CallType::Other(other.to_string()),
        }
    }
}

impl From<String> for CallType {
    fn from(name: String) -> Self {
        CallType::from(name.as_str())
    }
}

impl From<CallType> for String {
    fn from(call_type: CallType) -> Self {
        call_type.as_str().to_string()
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static prompt text: guidance, per-call-type templates, and the
/// instructions used on a forced final attempt.
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    pub guidance: String,
    /// Templates keyed by call type name.
    pub templates: HashMap<String, String>,
    pub degradation: String,
}

impl PromptLibrary {
    /// Resolve the template for a call. A roll result uses the template of the
    /// call that asked for the roll, named by `roll_type`; anything without a
    /// template of its own falls back to the narrative template.
    pub fn template_for(&self, call_type: &CallType, roll_type: Option<&str>) -> &str {
        let key = match call_type {
            CallType::RollResult => roll_type.unwrap_or(FALLBACK_TEMPLATE),
            other => other.as_str(),
        };

        self.templates
            .get(key)
            .or_else(|| self.templates.get(FALLBACK_TEMPLATE))
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn with_template(mut self, call_type: &str, text: impl Into<String>) -> Self {
        self.templates.insert(call_type.to_string(), text.into());
        self
    }
}

impl Default for PromptLibrary {
    fn default() -> Self {
        let templates = [
            ("narrative", include_str!("prompts/narrative.txt")),
            ("dialogue", include_str!("prompts/dialogue.txt")),
            ("action", include_str!("prompts/action.txt")),
            ("travel", include_str!("prompts/travel.txt")),
            ("session_open", include_str!("prompts/session_open.txt")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            guidance: include_str!("prompts/guidance.txt").to_string(),
            templates,
            degradation: include_str!("prompts/degradation.txt").to_string(),
        }
    }
}

/// One system segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSegment {
    pub text: String,
    pub cacheable: bool,
}

/// The user turn as sent to the model and as replayed from the window.
pub fn user_message(call_type: &CallType, player_input: &str) -> String {
    format!("[{call_type}] {player_input}")
}

/// A fully assembled generation prompt.
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub segments: Vec<PromptSegment>,
    pub max_output_tokens: usize,
    /// The user turn: the player's input tagged with the call type.
    pub user_message: String,
}

impl AssembledPrompt {
    pub fn system_blocks(&self) -> Vec<SystemBlock> {
        self.segments
            .iter()
            .map(|s| SystemBlock {
                text: s.text.clone(),
                cache: s.cacheable,
            })
            .collect()
    }
}

/// Session state the dynamic segment is built from.
#[derive(Debug, Clone, Copy)]
pub struct SceneContext<'a> {
    pub date: &'a str,
    pub location: &'a str,
    pub narrative_summary: &'a str,
    pub sticky: &'a StickyContext,
    /// Call type that asked for a pending roll.
    pub roll_type: Option<&'a str>,
    /// Notes about gaps resolved (or not) on earlier attempts this turn.
    pub enrichment: &'a [String],
    /// Whether this is the last attempt for the turn.
    pub final_attempt: bool,
}

/// Builds generation prompts and owns the refreshable profile.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    library: PromptLibrary,
    profile: String,
    profile_revision: u32,
    exchanges_since_refresh: usize,
    refresh_interval: usize,
}

impl PromptAssembler {
    pub fn new(library: PromptLibrary, refresh_interval: usize) -> Self {
        Self {
            library,
            profile: String::new(),
            profile_revision: 0,
            exchanges_since_refresh: 0,
            refresh_interval,
        }
    }

    /// Replace the profile text. Invalidates its cache entry on the next call.
    pub fn set_profile(&mut self, profile: impl Into<String>) {
        self.profile = profile.into();
        self.profile_revision += 1;
        self.exchanges_since_refresh = 0;
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn profile_revision(&self) -> u32 {
        self.profile_revision
    }

    /// Count a completed exchange toward the refresh cycle.
    pub fn record_exchange(&mut self) {
        self.exchanges_since_refresh += 1;
    }

    /// Whether the external refresh cycle should regenerate the profile.
    pub fn profile_due(&self) -> bool {
        self.refresh_interval > 0 && self.exchanges_since_refresh >= self.refresh_interval
    }

    pub fn library(&self) -> &PromptLibrary {
        &self.library
    }

    /// Assemble the prompt for one generation call.
    ///
    /// The profile segment is left out while no profile has been set.
    pub fn assemble(
        &self,
        call_type: &CallType,
        player_input: &str,
        scene: &SceneContext<'_>,
    ) -> AssembledPrompt {
        let mut segments = vec![
            PromptSegment {
                text: self.library.guidance.clone(),
                cacheable: true,
            },
            PromptSegment {
                text: self
                    .library
                    .template_for(call_type, scene.roll_type)
                    .to_string(),
                cacheable: true,
            },
        ];

        if !self.profile.trim().is_empty() {
            segments.push(PromptSegment {
                text: format!("## Player Profile\n{}", self.profile),
                cacheable: true,
            });
        }

        segments.push(PromptSegment {
            text: self.scene_text(scene),
            cacheable: false,
        });

        AssembledPrompt {
            segments,
            max_output_tokens: call_type.max_output_tokens(),
            user_message: user_message(call_type, player_input),
        }
    }

    fn scene_text(&self, scene: &SceneContext<'_>) -> String {
        let mut text = String::new();

        text.push_str("## Current Scene\n");
        text.push_str(&format!("Date: {}\n", or_unknown(scene.date)));
        text.push_str(&format!("Location: {}\n", or_unknown(scene.location)));

        text.push_str("\n## Story So Far\n");
        if scene.narrative_summary.trim().is_empty() {
            text.push_str("(the story has just begun)\n");
        } else {
            text.push_str(scene.narrative_summary.trim_end());
            text.push('\n');
        }

        text.push_str("\n## Loaded Context\n");
        let sticky = scene.sticky.format_for_prompt();
        if sticky.is_empty() {
            text.push_str("(nothing loaded)\n");
        } else {
            text.push_str(&sticky);
        }

        if !scene.enrichment.is_empty() {
            text.push_str("\n## Retrieval Notes\n");
            for note in scene.enrichment {
                text.push_str(&format!("- {note}\n"));
            }
        }

        if scene.final_attempt {
            text.push_str("\n## Final Attempt\n");
            text.push_str(&self.library.degradation);
        }

        text
    }
}

fn or_unknown(value: &str) -> &str {
    if value.trim().is_empty() {
        "unknown"
    } else {
        value
    }
}
