//! Testing utilities for the narrator.
//!
//! This module provides tools for integration testing:
//! - `MockClient` for deterministic testing without API calls
//! - `TestHarness` for scripted turn scenarios
//! - Assertion helpers for verifying orchestrator state

use crate::client::CompletionClient;
use crate::config::NarratorConfig;
use crate::diagnostics::{ChannelSink, Diagnostic, DiagnosticEntry};
use crate::entity::{Character, Event, Law};
use crate::orchestrator::{Orchestrator, State, Turn};
use crate::prompt::CallType;
use crate::session::NarratorError;
use crate::store::MemoryStore;
use async_trait::async_trait;
use claude::{ContentBlock, Request, Response, StopReason, Usage};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// A scripted reply from the mock client.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    /// Fail with a network error carrying this message.
    Failure(String),
    /// Reply after a delay.
    Delayed { text: String, delay: Duration },
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        MockReply::Text(text.into())
    }

    /// A generation reply: prose followed by a fenced metadata block.
    pub fn narrative(prose: &str, metadata_json: &str) -> Self {
        MockReply::Text(format!("{prose}\n\n```json\n{metadata_json}\n```"))
    }

    pub fn failure(message: impl Into<String>) -> Self {
        MockReply::Failure(message.into())
    }

    pub fn delayed(text: impl Into<String>, delay: Duration) -> Self {
        MockReply::Delayed {
            text: text.into(),
            delay,
        }
    }
}

/// A completion client that answers from a script, in order, and records
/// every request it receives.
///
/// Once the script runs out every call fails.
#[derive(Debug, Default)]
pub struct MockClient {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<Request>>,
}

impl MockClient {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Add a reply to the end of the script.
    pub fn push(&self, reply: MockReply) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<Request> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replies not yet consumed.
    pub fn remaining(&self) -> usize {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl CompletionClient for MockClient {
    async fn complete(&self, request: Request) -> Result<Response, claude::Error> {
        let model = request.model.clone().unwrap_or_default();
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let reply = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        let text = match reply {
            Some(MockReply::Text(text)) => text,
            Some(MockReply::Failure(message)) => return Err(claude::Error::Network(message)),
            Some(MockReply::Delayed { text, delay }) => {
                tokio::time::sleep(delay).await;
                text
            }
            None => return Err(claude::Error::Network("no scripted reply".to_string())),
        };

        Ok(Response {
            id: "msg_mock".to_string(),
            model,
            content: vec![ContentBlock::Text { text }],
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 1000,
                output_tokens: 200,
                ..Usage::default()
            },
        })
    }
}

/// A small court of Castile used by tests.
pub fn sample_store() -> MemoryStore {
    let mut store = MemoryStore::from_entities(
        vec![
            Character::new("c1", "Queen Lucía")
                .with_title("Queen of Castile")
                .with_location("Toledo")
                .with_category("royalty")
                .with_status("alive"),
            Character::new("c2", "Rodrigo de Vivar")
                .with_title("Constable of Castile")
                .with_current_task("Raising levies in Burgos")
                .with_location("Burgos")
                .with_category("military")
                .with_status("alive"),
            Character::new("c3", "Alonso de Fonseca")
                .with_title("Bishop of Burgos")
                .with_location("Toledo")
                .with_category("clergy")
                .with_status("alive"),
            Character::new("c4", "Inés de Mendoza")
                .with_title("Lady-in-waiting to the queen")
                .with_location("Toledo")
                .with_category("court")
                .with_status("alive"),
        ],
        vec![
            Event::new("e1", "Queen Lucía is crowned in Toledo")
                .with_date("1518-05-01")
                .with_characters(["c1", "c3"])
                .with_type("ceremony"),
            Event::new("e2", "The Cortes of Valladolid refuse new taxes")
                .with_date("1518-02-02")
                .with_characters(["c1", "c2"])
                .with_type("politics"),
            Event::new("e3", "Rodrigo de Vivar defeats raiders at Burgos")
                .with_date("1519-09-12")
                .with_characters(["c2"])
                .with_type("battle"),
        ],
        vec![
            Law::new("l1", "Edict of Toledo")
                .with_summary("Forbids carrying swords within the city walls")
                .with_status("active"),
            Law::new("l2", "Levy of 1519")
                .with_summary("Raises a war tax on wool")
                .with_status("repealed"),
        ],
    );
    store.insert_detail(
        "e2",
        vec![json!({"speaker": "c2", "line": "Castile will not pay for a foreign war."})],
    );
    store
}

/// Test harness for running turn scenarios.
pub struct TestHarness {
    /// The orchestrator under test.
    pub orchestrator: Orchestrator,
    /// The scripted client.
    pub client: Arc<MockClient>,
    diagnostics: mpsc::UnboundedReceiver<DiagnosticEntry>,
}

impl TestHarness {
    /// A harness over the sample court, starting in Toledo.
    pub fn new() -> Self {
        Self::with_store(sample_store(), NarratorConfig::default())
    }

    pub fn with_store(store: MemoryStore, config: NarratorConfig) -> Self {
        let client = Arc::new(MockClient::default());
        let (sink, diagnostics) = ChannelSink::new();
        let mut orchestrator = Orchestrator::new(client.clone(), Arc::new(store), config)
            .with_sink(Arc::new(sink));
        orchestrator.start_session("1520-03-14", "Toledo", "");

        Self {
            orchestrator,
            client,
            diagnostics,
        }
    }

    /// Queue a router reply.
    pub fn expect_router(&mut self, json: &str) -> &mut Self {
        self.client.push(MockReply::text(json));
        self
    }

    /// Queue a router reply saying nothing is needed.
    pub fn expect_no_search(&mut self) -> &mut Self {
        self.expect_router(r#"{"needsSearch": false}"#)
    }

    /// Queue a generation reply.
    pub fn expect_narrative(&mut self, prose: &str, metadata_json: &str) -> &mut Self {
        self.client.push(MockReply::narrative(prose, metadata_json));
        self
    }

    /// Queue a failing call.
    pub fn expect_failure(&mut self, message: &str) -> &mut Self {
        self.client.push(MockReply::failure(message));
        self
    }

    /// Run one player input.
    pub async fn input(&mut self, call_type: CallType, text: &str) -> Result<Turn, NarratorError> {
        self.orchestrator.handle_input(call_type, text).await
    }

    /// Diagnostics emitted since the last call.
    pub fn diagnostics(&mut self) -> Vec<Diagnostic> {
        let mut out = Vec::new();
        while let Ok(entry) = self.diagnostics.try_recv() {
            out.push(entry.diagnostic);
        }
        out
    }

    /// Number of model calls made so far.
    pub fn calls(&self) -> usize {
        self.client.requests().len()
    }

    /// System text of the most recent request.
    pub fn last_system_text(&self) -> Option<String> {
        self.client.requests().last().map(Request::system_text)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert the states a turn went through.
#[track_caller]
pub fn assert_transitions(turn: &Turn, expected: &[State]) {
    assert_eq!(
        turn.transitions, expected,
        "Expected transitions {expected:?}, got {:?}",
        turn.transitions
    );
}

/// Assert an entity is resident in sticky context.
#[track_caller]
pub fn assert_sticky_contains(harness: &TestHarness, id: &str) {
    assert!(
        harness.orchestrator.sticky().contains(id),
        "Expected '{id}' in sticky context, have {:?}",
        harness.orchestrator.sticky().snapshot()
    );
}

/// Assert an entity is NOT resident in sticky context.
#[track_caller]
pub fn assert_sticky_missing(harness: &TestHarness, id: &str) {
    assert!(
        !harness.orchestrator.sticky().contains(id),
        "Expected '{id}' to NOT be in sticky context"
    );
}

/// Assert the orchestrator is idle.
#[track_caller]
pub fn assert_idle(harness: &TestHarness) {
    assert_eq!(
        harness.orchestrator.state(),
        State::Idle,
        "Expected the orchestrator to be idle"
    );
}
