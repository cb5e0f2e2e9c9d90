//! The turn state machine.
//!
//! One player input runs through:
//!
//! ```text
//! Idle -> Routing -> Generating -> Idle
//!                       |  ^
//!                       v  |
//!                   Broadening
//!
//! Generating -> Finalizing -> Idle
//! ```
//!
//! Routing and broadening fail open: a router error is logged and the turn
//! continues with whatever is already in sticky context. Only a failed
//! generation call ends a turn with an error. The attempt counter is bounded
//! by [`NarratorConfig::max_attempts`]; the generation call made at the bound
//! is always the last one and carries the degradation instructions.

use crate::client::CompletionClient;
use crate::config::NarratorConfig;
use crate::diagnostics::{
    Diagnostic, DiagnosticEntry, DiagnosticSink, ResetReason, RouterOutcome, SessionId,
    TracingSink,
};
use crate::entity::{Character, Event, Law, Record};
use crate::index::{character_index, event_index};
use crate::prompt::{user_message, CallType, PromptAssembler, PromptLibrary, SceneContext};
use crate::response::{GapClass, GenerationMetadata, MissingContext, ParsedResponse};
use crate::router::{AlreadyLoaded, RouteDecision, Router, RouterDirective, RouterRequest};
use crate::search::{search_characters, search_events, search_laws, SearchResults};
use crate::session::NarratorError;
use crate::sticky::StickyContext;
use crate::store::EntityStore;
use crate::window::ConversationWindow;
use claude::{Message, Request, Usage};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Minimum length of a gap description matched against entity labels.
const MIN_LOOKUP_LEN: usize = 3;

/// Orchestrator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum State {
    Idle,
    Routing,
    Generating,
    Broadening,
    Finalizing,
}

/// Per-turn retry bookkeeping.
#[derive(Debug, Clone)]
pub struct CallAttempt {
    number: u32,
    max: u32,
    /// Notes on gaps resolved (or not) so far this turn.
    pub enrichment: Vec<String>,
    /// Gaps still outstanding after the last generation call.
    pub outstanding: Vec<MissingContext>,
}

impl CallAttempt {
    pub fn new(max: u32) -> Self {
        Self {
            number: 1,
            max: max.max(1),
            enrichment: Vec::new(),
            outstanding: Vec::new(),
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn is_final(&self) -> bool {
        self.number >= self.max
    }

    fn advance(&mut self) {
        self.number = (self.number + 1).min(self.max);
    }

    fn force_final(&mut self) {
        self.number = self.max;
    }
}

/// Date, location and story so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Scene {
    pub date: String,
    pub location: String,
    pub narrative_summary: String,
    /// Call type that asked for a roll still to be resolved.
    pub pending_roll_type: Option<String>,
}

/// Token and cost totals for the current session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionTotals {
    pub turns: u32,
    pub router_calls: u32,
    pub generation_calls: u32,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub cache_read_tokens: usize,
    pub cache_write_tokens: usize,
    pub cost_usd: f64,
}

impl SessionTotals {
    fn add_usage(&mut self, usage: &Usage, cost: f64) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cache_read_tokens += usage.cache_read_input_tokens;
        self.cache_write_tokens += usage.cache_creation_input_tokens;
        self.cost_usd += cost;
    }
}

/// The outcome of one player input.
#[derive(Debug, Clone)]
pub struct Turn {
    pub narrative: String,
    pub metadata: GenerationMetadata,
    /// Attempt number of the generation call that produced the narrative.
    pub attempts: u32,
    /// States entered during the turn, in order. Always ends with `Idle`.
    pub transitions: Vec<State>,
    /// Enrichment notes the final call was given.
    pub enrichment: Vec<String>,
    /// Gaps the final response still reported.
    pub unresolved: Vec<MissingContext>,
    pub cost_usd: f64,
}

/// Sequences router, search, sticky context, prompt assembly and generation
/// for one session.
pub struct Orchestrator {
    session: SessionId,
    config: NarratorConfig,
    client: Arc<dyn CompletionClient>,
    router: Router,
    store: Arc<dyn EntityStore>,
    sink: Arc<dyn DiagnosticSink>,
    prompts: PromptAssembler,
    sticky: StickyContext,
    window: ConversationWindow,
    scene: Scene,
    state: State,
    totals: SessionTotals,
    transitions: Vec<State>,
    turn_cost: f64,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        store: Arc<dyn EntityStore>,
        config: NarratorConfig,
    ) -> Self {
        let router = Router::new(client.clone(), &config.router_model)
            .with_max_tokens(config.router_max_tokens)
            .with_timeout(config.router_timeout);

        Self {
            session: SessionId::new(),
            router,
            store,
            sink: Arc::new(TracingSink),
            prompts: PromptAssembler::new(PromptLibrary::default(), config.profile_refresh_interval),
            sticky: StickyContext::with_budget(config.sticky_budget),
            window: ConversationWindow::with_bound(config.window_size),
            scene: Scene::default(),
            state: State::Idle,
            totals: SessionTotals::default(),
            transitions: Vec::new(),
            turn_cost: 0.0,
            client,
            config,
        }
    }

    pub fn with_prompts(mut self, library: PromptLibrary) -> Self {
        self.prompts = PromptAssembler::new(library, self.config.profile_refresh_interval);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn config(&self) -> &NarratorConfig {
        &self.config
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn sticky(&self) -> &StickyContext {
        &self.sticky
    }

    pub fn window(&self) -> &ConversationWindow {
        &self.window
    }

    pub fn totals(&self) -> &SessionTotals {
        &self.totals
    }

    pub fn prompts(&self) -> &PromptAssembler {
        &self.prompts
    }

    /// Replace the profile segment.
    pub fn set_profile(&mut self, profile: impl Into<String>) {
        self.prompts.set_profile(profile);
    }

    /// Whether the profile is due for regeneration.
    pub fn profile_due(&self) -> bool {
        self.prompts.profile_due()
    }

    /// Begin a session: set the scene, reset totals, and start a fresh
    /// episode with an empty window.
    pub fn start_session(
        &mut self,
        date: impl Into<String>,
        location: impl Into<String>,
        narrative_summary: impl Into<String>,
    ) {
        self.scene = Scene {
            date: date.into(),
            location: location.into(),
            narrative_summary: narrative_summary.into(),
            pending_roll_type: None,
        };
        self.totals = SessionTotals::default();
        self.window.clear();
        self.reset_episode(ResetReason::SessionStart);
        info!(session = %self.session, date = %self.scene.date, location = %self.scene.location, "session started");
    }

    /// Drop all sticky context.
    pub fn clear_context(&mut self) {
        self.reset_episode(ResetReason::Manual);
    }

    /// Run one player input to completion.
    ///
    /// Rejected with [`NarratorError::Busy`] unless the orchestrator is idle.
    /// A failed generation call returns the orchestrator to `Idle` and the
    /// input can be resubmitted.
    pub async fn handle_input(
        &mut self,
        call_type: CallType,
        player_input: &str,
    ) -> Result<Turn, NarratorError> {
        if self.state != State::Idle {
            return Err(NarratorError::Busy);
        }
        self.transitions.clear();
        self.turn_cost = 0.0;

        let result = self.run_turn(&call_type, player_input).await;
        let last_attempt = result.as_ref().map_or(0, |(_, attempt)| attempt.number);
        self.transition(State::Idle, last_attempt);

        let (parsed, attempt) = result?;
        self.totals.turns += 1;
        self.apply_metadata(&call_type, player_input, &parsed);

        Ok(Turn {
            narrative: parsed.narrative,
            metadata: parsed.metadata,
            attempts: attempt.number,
            transitions: std::mem::take(&mut self.transitions),
            enrichment: attempt.enrichment,
            unresolved: attempt.outstanding,
            cost_usd: self.turn_cost,
        })
    }

    async fn run_turn(
        &mut self,
        call_type: &CallType,
        player_input: &str,
    ) -> Result<(ParsedResponse, CallAttempt), NarratorError> {
        let mut attempt = CallAttempt::new(self.config.max_attempts);

        if self.config.skips_routing(call_type) {
            debug!(%call_type, "routing skipped");
        } else {
            self.transition(State::Routing, attempt.number);
            self.route(player_input, &[], &attempt).await;
        }

        let mut next = State::Generating;
        loop {
            self.transition(next, attempt.number);
            let parsed = self.generate(call_type, player_input, &attempt).await?;
            attempt.outstanding = parsed.metadata.missing_context.clone();

            if attempt.is_final() {
                if !attempt.outstanding.is_empty() {
                    debug!(gaps = attempt.outstanding.len(), "final attempt returned with gaps");
                }
                return Ok((parsed, attempt));
            }

            let remaining = match parsed.gap_class() {
                None => return Ok((parsed, attempt)),
                Some(GapClass::MissingContextFixable) => {
                    self.resolve_locally(&parsed.metadata.missing_context, &mut attempt)
                }
                Some(GapClass::MissingContextUnfixable) => parsed.metadata.missing_context.clone(),
            };

            next = match GapClass::classify(&remaining) {
                None => {
                    attempt.advance();
                    State::Generating
                }
                Some(GapClass::MissingContextFixable) => {
                    attempt.advance();
                    self.transition(State::Broadening, attempt.number);
                    self.broaden(player_input, &remaining, &mut attempt).await;
                    State::Generating
                }
                Some(GapClass::MissingContextUnfixable) => {
                    attempt.force_final();
                    for gap in &remaining {
                        attempt
                            .enrichment
                            .push(format!("{}: not held in the archive", gap.description));
                    }
                    State::Finalizing
                }
            };
        }
    }

    /// Route, search and ingest. Every router failure is absorbed here.
    async fn route(&mut self, player_input: &str, gaps: &[MissingContext], attempt: &CallAttempt) -> usize {
        let request = self.router_request(player_input);
        let broadened = !gaps.is_empty();
        let result = if broadened {
            self.router.route_broadened(&request, gaps).await
        } else {
            self.router.route(&request).await
        };

        let (outcome, usage, loaded) = match result {
            Ok(routed) => match routed.decision {
                RouteDecision::Search(directive) => {
                    let loaded = self.ingest(&directive);
                    (RouterOutcome::Search { results: loaded }, routed.usage, loaded)
                }
                RouteDecision::NoSearchNeeded => (RouterOutcome::NoSearchNeeded, routed.usage, 0),
            },
            Err(e) => {
                warn!(error = %e, broadened, "router failed, continuing without search");
                let usage = e.usage();
                (RouterOutcome::FailedOpen { reason: e.to_string() }, usage, 0)
            }
        };

        let model = self.router.model().to_string();
        let cost = self.record_cost(&model, &usage);
        self.totals.router_calls += 1;
        self.emit(Diagnostic::RouterCall {
            attempt: attempt.number,
            broadened,
            outcome,
            tokens: usage.into(),
            cost_usd: cost,
        });
        loaded
    }

    /// Widen the search for fixable gaps. Unfixable gaps are only noted.
    async fn broaden(&mut self, player_input: &str, gaps: &[MissingContext], attempt: &mut CallAttempt) {
        let (fixable, unfixable): (Vec<MissingContext>, Vec<MissingContext>) =
            gaps.iter().cloned().partition(|gap| gap.fixable);
        let loaded = self.route(player_input, &fixable, attempt).await;
        for gap in &unfixable {
            attempt
                .enrichment
                .push(format!("{}: not held in the archive", gap.description));
        }
        for gap in &fixable {
            let note = if loaded > 0 {
                format!("{}: widened search loaded more records", gap.description)
            } else {
                format!("{}: nothing further found in the archive", gap.description)
            };
            attempt.enrichment.push(note);
        }
    }

    fn router_request(&self, player_input: &str) -> RouterRequest {
        let events = self.store.events();
        RouterRequest {
            player_input: player_input.to_string(),
            date: self.scene.date.clone(),
            location: self.scene.location.clone(),
            already_loaded: AlreadyLoaded {
                character_ids: self.sticky.character_ids(),
                event_ids: self.sticky.event_ids(),
            },
            character_index: character_index(&self.store.characters()),
            event_index: event_index(&events, self.config.event_index_limit),
        }
    }

    /// Run the directive's searches and load the results into sticky context.
    /// Returns the number of records loaded.
    fn ingest(&mut self, directive: &RouterDirective) -> usize {
        let mut results = SearchResults::default();
        if let Some(d) = &directive.character_search {
            results.characters = search_characters(d, &self.store.characters());
        }
        if let Some(d) = &directive.event_search {
            results.events = search_events(d, &self.store.events());
        }
        if let Some(d) = &directive.law_search {
            results.laws = search_laws(d, &self.store.laws());
        }

        let details: Vec<(String, Vec<Value>)> = directive
            .event_detail_ids
            .iter()
            .map(|id| (id.clone(), self.store.event_detail(id)))
            .filter(|(_, detail)| !detail.is_empty())
            .collect();

        let characters: Vec<Character> = results.characters.iter().map(|r| r.entity.clone()).collect();
        let events: Vec<Event> = results.events.iter().map(|r| r.entity.clone()).collect();
        let laws: Vec<Law> = results.laws.iter().map(|r| r.entity.clone()).collect();

        debug!(
            characters = characters.len(),
            events = events.len(),
            laws = laws.len(),
            details = details.len(),
            "ingesting search results"
        );
        self.load_batch(&characters, &events, &laws, &details);
        results.total() + details.len()
    }

    /// Insert one batch. On overflow the episode ends and the batch becomes the
    /// first content of the next one.
    fn load_batch(
        &mut self,
        characters: &[Character],
        events: &[Event],
        laws: &[Law],
        details: &[(String, Vec<Value>)],
    ) {
        if insert_batch(&mut self.sticky, characters, events, laws, details) {
            info!(
                estimated_tokens = self.sticky.estimate_tokens(),
                budget = self.sticky.budget(),
                "sticky context over budget, starting a new episode"
            );
            self.reset_episode(ResetReason::Overflow);
            if insert_batch(&mut self.sticky, characters, events, laws, details) {
                warn!(
                    estimated_tokens = self.sticky.estimate_tokens(),
                    "a single batch exceeds the sticky budget"
                );
            }
        }
        self.emit(Diagnostic::Sticky(self.sticky.snapshot()));
    }

    /// Resolve `entity_unknown` gaps by direct lookup. Returns the gaps still
    /// outstanding.
    fn resolve_locally(&mut self, gaps: &[MissingContext], attempt: &mut CallAttempt) -> Vec<MissingContext> {
        let characters = self.store.characters();
        let events = self.store.events();
        let laws = self.store.laws();

        let mut found_characters = Vec::new();
        let mut found_events = Vec::new();
        let mut found_laws = Vec::new();
        let mut remaining = Vec::new();

        for gap in gaps {
            if !gap.is_entity_unknown() {
                remaining.push(gap.clone());
                continue;
            }

            let label = if let Some(c) = lookup(&characters, &gap.description) {
                found_characters.push(c.clone());
                describe(c)
            } else if let Some(e) = lookup(&events, &gap.description) {
                found_events.push(e.clone());
                describe(e)
            } else if let Some(l) = lookup(&laws, &gap.description) {
                found_laws.push(l.clone());
                describe(l)
            } else {
                remaining.push(gap.clone());
                continue;
            };

            debug!(gap = %gap.description, resolved = %label, "resolved gap locally");
            attempt
                .enrichment
                .push(format!("{}: resolved as {label}", gap.description));
        }

        if !(found_characters.is_empty() && found_events.is_empty() && found_laws.is_empty()) {
            self.load_batch(&found_characters, &found_events, &found_laws, &[]);
        }
        remaining
    }

    async fn generate(
        &mut self,
        call_type: &CallType,
        player_input: &str,
        attempt: &CallAttempt,
    ) -> Result<ParsedResponse, NarratorError> {
        let final_attempt = attempt.is_final();
        let scene = SceneContext {
            date: &self.scene.date,
            location: &self.scene.location,
            narrative_summary: &self.scene.narrative_summary,
            sticky: &self.sticky,
            roll_type: self.scene.pending_roll_type.as_deref(),
            enrichment: &attempt.enrichment,
            final_attempt,
        };
        let prompt = self.prompts.assemble(call_type, player_input, &scene);

        let mut messages = self.window.api_messages();
        messages.push(Message::user(&prompt.user_message));

        let mut request = Request::new(messages)
            .with_model(&self.config.generation_model)
            .with_max_tokens(prompt.max_output_tokens)
            .with_system_blocks(prompt.system_blocks());
        if let Some(temperature) = self.config.temperature {
            request = request.with_temperature(temperature);
        }

        debug!(%call_type, attempt = attempt.number, final_attempt, "generation call");
        let response = tokio::time::timeout(self.config.generation_timeout, self.client.complete(request))
            .await
            .map_err(|_| {
                NarratorError::GenerationFailed(format!(
                    "timed out after {:?}",
                    self.config.generation_timeout
                ))
            })?
            .map_err(|e| NarratorError::GenerationFailed(e.to_string()))?;

        let model = self.config.generation_model.clone();
        let cost = self.record_cost(&model, &response.usage);
        self.totals.generation_calls += 1;
        self.emit(Diagnostic::GenerationCall {
            attempt: attempt.number,
            final_attempt,
            tokens: response.usage.into(),
            cost_usd: cost,
        });

        Ok(ParsedResponse::parse(&response.text()))
    }

    /// Fold a finished turn's metadata into the scene and the window.
    fn apply_metadata(&mut self, call_type: &CallType, player_input: &str, parsed: &ParsedResponse) {
        let meta = &parsed.metadata;

        if let Some(location) = meta.location.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
            let changed = !self.scene.location.trim().eq_ignore_ascii_case(location);
            if changed {
                if !self.scene.location.is_empty() {
                    info!(from = %self.scene.location, to = %location, "location changed");
                    self.reset_episode(ResetReason::LocationChange);
                }
                self.scene.location = location.to_string();
            }
        }

        if let Some(date) = meta.date.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            self.scene.date = date.to_string();
        }

        if let Some(update) = meta.summary_update.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            if !self.scene.narrative_summary.is_empty() {
                self.scene.narrative_summary.push('\n');
            }
            self.scene.narrative_summary.push_str(update);
        }

        if meta.awaiting_roll {
            let roll_type = meta
                .roll_type
                .clone()
                .unwrap_or_else(|| call_type.as_str().to_string());
            self.scene.pending_roll_type = Some(roll_type);
        } else if *call_type == CallType::RollResult {
            self.scene.pending_roll_type = None;
        }

        self.window.add_exchange(
            user_message(call_type, player_input),
            &parsed.narrative,
            meta.summary_update.clone(),
        );
        self.prompts.record_exchange();
    }

    fn reset_episode(&mut self, reason: ResetReason) {
        self.sticky.clear();
        self.emit(Diagnostic::EpisodeReset { reason });
    }

    fn record_cost(&mut self, model: &str, usage: &Usage) -> f64 {
        let cost = self.config.pricing.cost(model, usage);
        self.totals.add_usage(usage, cost);
        self.turn_cost += cost;
        cost
    }

    fn transition(&mut self, to: State, attempt: u32) {
        let from = self.state;
        self.state = to;
        self.transitions.push(to);
        self.emit(Diagnostic::Transition { from, to, attempt });
    }

    fn emit(&self, diagnostic: Diagnostic) {
        self.sink.record(&DiagnosticEntry {
            session: self.session,
            diagnostic,
        });
    }
}

fn insert_batch(
    sticky: &mut StickyContext,
    characters: &[Character],
    events: &[Event],
    laws: &[Law],
    details: &[(String, Vec<Value>)],
) -> bool {
    let mut overflow = false;
    if !characters.is_empty() {
        overflow |= sticky.add_characters(characters.iter().cloned());
    }
    if !events.is_empty() {
        overflow |= sticky.add_events(events.iter().cloned());
    }
    if !laws.is_empty() {
        overflow |= sticky.add_laws(laws.iter().cloned());
    }
    for (id, detail) in details {
        if let Some(over) = sticky.add_event_detail(id, detail.clone()) {
            overflow |= over;
        }
    }
    overflow
}

/// Find a record by exact ID, by its label named in the description as whole
/// words, or by a description that opens the label on a word boundary.
fn lookup<'a, T: Record>(records: &'a [T], description: &str) -> Option<&'a T> {
    let needle = description.trim();
    if let Some(found) = records.iter().find(|r| r.id() == needle) {
        return Some(found);
    }

    if needle.chars().count() < MIN_LOOKUP_LEN {
        return None;
    }
    let needle = words(needle);
    records.iter().find(|r| {
        if r.label().chars().count() < MIN_LOOKUP_LEN {
            return false;
        }
        let label = words(r.label());
        !label.is_empty() && (needle.windows(label.len()).any(|w| w == label) || label.starts_with(&needle))
    })
}

/// Lowercased alphanumeric words.
fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn describe<T: Record>(record: &T) -> String {
    format!("[{}] {}", record.id(), record.label())
}
