//! The router: a cheap model call that decides what context a turn needs.
//!
//! The router sees compact indices of characters and recent events plus the
//! IDs already loaded this episode, and answers with either "no search
//! needed" or a set of search directives. Every failure is reported as a
//! [`RouterError`]; the orchestrator treats all of them as "no search needed".

use crate::client::CompletionClient;
use crate::response::{extract_json, MissingContext};
use crate::search::SearchDirective;
use claude::{Message, Request, Usage};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors from a router call.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Network failure, API error status, or timeout.
    #[error("router unavailable: {0}")]
    Unavailable(String),

    /// The reply could not be parsed as a routing decision.
    #[error("malformed router reply: {message}")]
    Malformed { message: String, usage: Usage },

    /// A call is already in flight on this router.
    #[error("router call already in flight")]
    Busy,
}

impl From<claude::Error> for RouterError {
    fn from(e: claude::Error) -> Self {
        RouterError::Unavailable(e.to_string())
    }
}

impl RouterError {
    /// Tokens spent before the failure, if the call reached the model.
    pub fn usage(&self) -> Usage {
        match self {
            RouterError::Malformed { usage, .. } => *usage,
            _ => Usage::default(),
        }
    }
}

/// IDs already resident in sticky context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlreadyLoaded {
    pub character_ids: Vec<String>,
    pub event_ids: Vec<String>,
}

/// Everything the router is shown.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterRequest {
    pub player_input: String,
    pub date: String,
    pub location: String,
    pub already_loaded: AlreadyLoaded,
    pub character_index: String,
    pub event_index: String,
}

/// Search directives chosen by the router.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouterDirective {
    pub character_search: Option<SearchDirective>,
    pub event_search: Option<SearchDirective>,
    pub law_search: Option<SearchDirective>,
    /// Resident events whose detail records should be attached.
    pub event_detail_ids: Vec<String>,
}

impl RouterDirective {
    pub fn is_empty(&self) -> bool {
        self.character_search.is_none()
            && self.event_search.is_none()
            && self.law_search.is_none()
            && self.event_detail_ids.is_empty()
    }
}

/// What the router decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Search(RouterDirective),
    NoSearchNeeded,
}

/// A successful router call.
#[derive(Debug, Clone)]
pub struct Routed {
    pub decision: RouteDecision,
    pub usage: Usage,
}

/// Response format we expect from the router model.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouterResponse {
    #[serde(default)]
    needs_search: bool,
    #[serde(flatten)]
    directive: RouterDirective,
}

impl RouterResponse {
    fn into_decision(self) -> RouteDecision {
        if self.needs_search && !self.directive.is_empty() {
            RouteDecision::Search(self.directive)
        } else {
            RouteDecision::NoSearchNeeded
        }
    }
}

/// Sends routing requests to a cheap model.
pub struct Router {
    client: Arc<dyn CompletionClient>,
    model: String,
    max_tokens: usize,
    timeout: Duration,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag when a call finishes, however it finishes.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Router {
    pub fn new(client: Arc<dyn CompletionClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            max_tokens: 600,
            timeout: Duration::from_secs(20),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Ask which context the player input needs.
    pub async fn route(&self, request: &RouterRequest) -> Result<Routed, RouterError> {
        self.send(build_prompt(request, &[])).await
    }

    /// Ask again with the gaps the generation call reported, so the router can
    /// widen its criteria.
    pub async fn route_broadened(
        &self,
        request: &RouterRequest,
        gaps: &[MissingContext],
    ) -> Result<Routed, RouterError> {
        self.send(build_prompt(request, gaps)).await
    }

    async fn send(&self, prompt: String) -> Result<Routed, RouterError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(RouterError::Busy);
        }
        let _guard = InFlight(&self.in_flight);

        let request = Request::new(vec![Message::user(prompt)])
            .with_model(&self.model)
            .with_max_tokens(self.max_tokens)
            .with_temperature(0.0);

        let response = tokio::time::timeout(self.timeout, self.client.complete(request))
            .await
            .map_err(|_| RouterError::Unavailable(format!("timed out after {:?}", self.timeout)))??;

        let decision = parse_reply(&response.text()).map_err(|message| RouterError::Malformed {
            message,
            usage: response.usage,
        })?;
        debug!(?decision, "router decision");

        Ok(Routed {
            decision,
            usage: response.usage,
        })
    }
}

fn parse_reply(text: &str) -> Result<RouteDecision, String> {
    let json = extract_json(text);
    serde_json::from_str::<RouterResponse>(json)
        .map(RouterResponse::into_decision)
        .map_err(|e| format!("{e}: {json}"))
}

fn build_prompt(request: &RouterRequest, gaps: &[MissingContext]) -> String {
    let RouterRequest {
        player_input,
        date,
        location,
        already_loaded,
        character_index,
        event_index,
    } = request;

    let loaded_characters = join_or_none(&already_loaded.character_ids);
    let loaded_events = join_or_none(&already_loaded.event_ids);

    let broadening = if gaps.is_empty() {
        String::new()
    } else {
        let lines: Vec<String> = gaps
            .iter()
            .map(|g| format!("- {}: {}", g.kind, g.description))
            .collect();
        format!(
            r#"
## Outstanding Gaps
The narrator already tried to answer and reported missing information:
{}

Widen your criteria to cover these gaps: use more and broader keywords and synonyms, drop date bounds and status filters, and search every entity kind that could hold the answer.
"#,
            lines.join("\n")
        )
    };

    format!(
        r#"You are choosing which archive records a narrator needs before it answers the player.

## Player Input
"{player_input}"

## Scene
Date: {date}
Location: {location}

## Already Loaded (do not request these again)
Characters: {loaded_characters}
Events: {loaded_events}

## Character Index (id | name | title | location | status)
{character_index}

## Event Index (id | date | summary | character ids), oldest first
{event_index}
{broadening}
## Instructions
Decide whether the input refers to people, past events or laws that are not already loaded.
If nothing new is needed, respond with {{"needsSearch": false}}.

Otherwise respond with ONLY a JSON object (no markdown, no explanation outside the JSON):
{{
  "needsSearch": true,
  "characterSearch": {{"keywords": [], "ids": [], "categories": [], "locations": [], "status": null}},
  "eventSearch": {{"keywords": [], "characters": [], "types": [], "dateAfter": null, "dateBefore": null}},
  "lawSearch": {{"keywords": [], "status": null}},
  "eventDetailIds": []
}}

Omit any search you do not need. Use `eventDetailIds` for loaded events whose full record (dialogue, witnesses) the narrator needs."#
    )
}

fn join_or_none(ids: &[String]) -> String {
    if ids.is_empty() {
        "(none)".to_string()
    } else {
        ids.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockClient, MockReply};

    fn request() -> RouterRequest {
        RouterRequest {
            player_input: "I ask the queen about the edict".to_string(),
            date: "1520-03-14".to_string(),
            location: "Toledo".to_string(),
            already_loaded: AlreadyLoaded {
                character_ids: vec!["c1".to_string()],
                event_ids: vec![],
            },
            character_index: "c1 | Lucía | Queen of Castile | Toledo | alive".to_string(),
            event_index: String::new(),
        }
    }

    #[test]
    fn test_parse_no_search() {
        let decision = parse_reply(r#"{"needsSearch": false}"#).unwrap();
        assert_eq!(decision, RouteDecision::NoSearchNeeded);
    }

    #[test]
    fn test_parse_search_in_fence() {
        let text = "```json\n{\"needsSearch\": true, \"lawSearch\": {\"keywords\": [\"edict\"]}, \"eventDetailIds\": [\"e4\"]}\n```";
        let RouteDecision::Search(directive) = parse_reply(text).unwrap() else {
            panic!("expected a search");
        };
        assert_eq!(directive.law_search.unwrap().keywords, vec!["edict"]);
        assert!(directive.character_search.is_none());
        assert_eq!(directive.event_detail_ids, vec!["e4"]);
    }

    #[test]
    fn test_parse_event_search_aliases() {
        let text = r#"{"needsSearch": true, "eventSearch": {"characters": ["c1"], "dateAfter": "1518-01-01"}}"#;
        let RouteDecision::Search(directive) = parse_reply(text).unwrap() else {
            panic!("expected a search");
        };
        let events = directive.event_search.unwrap();
        assert_eq!(events.ids, vec!["c1"]);
        assert_eq!(events.date_after.as_deref(), Some("1518-01-01"));
    }

    #[test]
    fn test_empty_search_means_no_search() {
        let decision = parse_reply(r#"{"needsSearch": true}"#).unwrap();
        assert_eq!(decision, RouteDecision::NoSearchNeeded);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_reply("I think you should look up the queen.").is_err());
    }

    #[test]
    fn test_prompt_lists_loaded_ids_and_gaps() {
        let gaps = [MissingContext::new("event_unknown", "the Cortes of 1518", true)];
        let prompt = build_prompt(&request(), &gaps);
        assert!(prompt.contains("Characters: c1"));
        assert!(prompt.contains("Events: (none)"));
        assert!(prompt.contains("- event_unknown: the Cortes of 1518"));

        let plain = build_prompt(&request(), &[]);
        assert!(!plain.contains("Outstanding Gaps"));
    }

    #[tokio::test]
    async fn test_route_sends_router_model() {
        let client = Arc::new(MockClient::new(vec![MockReply::text(
            r#"{"needsSearch": true, "characterSearch": {"keywords": ["queen"]}}"#,
        )]));
        let router = Router::new(client.clone(), "cheap-model");

        let routed = router.route(&request()).await.unwrap();
        assert!(matches!(routed.decision, RouteDecision::Search(_)));

        let sent = client.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].model.as_deref(), Some("cheap-model"));
        assert_eq!(sent[0].temperature, Some(0.0));
    }

    #[tokio::test]
    async fn test_route_failure_is_unavailable() {
        let client = Arc::new(MockClient::new(vec![MockReply::failure("connection reset")]));
        let router = Router::new(client, "cheap-model");
        let err = router.route(&request()).await.unwrap_err();
        assert!(matches!(err, RouterError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_route_timeout_is_unavailable() {
        let client = Arc::new(MockClient::new(vec![MockReply::delayed(
            r#"{"needsSearch": false}"#,
            Duration::from_millis(200),
        )]));
        let router = Router::new(client, "cheap-model").with_timeout(Duration::from_millis(10));
        let err = router.route(&request()).await.unwrap_err();
        assert!(matches!(err, RouterError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_concurrent_call_is_busy() {
        let client = Arc::new(MockClient::new(vec![MockReply::delayed(
            r#"{"needsSearch": false}"#,
            Duration::from_millis(50),
        )]));
        let router = Router::new(client, "cheap-model");
        let req = request();

        let (first, second) = tokio::join!(router.route(&req), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            router.route(&req).await
        });

        assert!(first.is_ok());
        assert!(matches!(second, Err(RouterError::Busy)));
        // The flag is released once the first call completes.
        assert!(!router.in_flight.load(Ordering::Acquire));
        let third = router.route(&req).await;
        assert!(!matches!(third, Err(RouterError::Busy)));
    }
}
