//! Orchestration scenarios against a scripted client.
//!
//! Every model call is answered by `MockClient` in script order, so these run
//! offline and deterministically.

use narrator_core::diagnostics::{ResetReason, RouterOutcome};
use narrator_core::orchestrator::State;
use narrator_core::testing::{
    assert_idle, assert_sticky_contains, assert_sticky_missing, assert_transitions, sample_store,
    TestHarness,
};
use narrator_core::{CallType, Character, Diagnostic, MemoryStore, NarratorConfig, NarratorError};

// =============================================================================
// ROUTING
// =============================================================================

#[tokio::test]
async fn test_router_results_land_in_sticky_context() {
    let mut harness = TestHarness::new();
    harness
        .expect_router(r#"{"needsSearch": true, "characterSearch": {"keywords": ["queen"]}, "lawSearch": {"keywords": ["edict"]}}"#)
        .expect_narrative("The queen taps the edict on her desk.", "{}");

    let turn = harness
        .input(CallType::Dialogue, "I ask the queen about the edict")
        .await
        .unwrap();

    assert_transitions(&turn, &[State::Routing, State::Generating, State::Idle]);
    assert_sticky_contains(&harness, "c1");
    assert_sticky_contains(&harness, "l1");
    assert!(turn.enrichment.is_empty());

    let system = harness.last_system_text().unwrap();
    assert!(system.contains("[c1] Queen Lucía"));
    assert!(system.contains("[l1] Edict of Toledo"));
}

#[tokio::test]
async fn test_loaded_ids_are_passed_to_router() {
    let mut harness = TestHarness::new();
    harness
        .expect_router(r#"{"needsSearch": true, "characterSearch": {"ids": ["c1"]}}"#)
        .expect_narrative("The queen waits.", "{}")
        .expect_no_search()
        .expect_narrative("She speaks at last.", "{}");

    harness.input(CallType::Narrative, "I bow").await.unwrap();
    harness.input(CallType::Narrative, "I wait").await.unwrap();

    let requests = harness.client.requests();
    let second_router_prompt = requests[2].messages[0].text();
    assert!(second_router_prompt.contains("Characters: c1"));
    assert!(second_router_prompt.contains("\"I wait\""));
}

#[tokio::test]
async fn test_skip_list_never_routes() {
    let mut harness = TestHarness::new();
    harness.expect_narrative("The die settles.", "{}");

    let turn = harness.input(CallType::RollResult, "I rolled 12").await.unwrap();

    assert_transitions(&turn, &[State::Generating, State::Idle]);
    assert_eq!(harness.calls(), 1);
    assert!(!turn.transitions.contains(&State::Routing));
}

#[tokio::test]
async fn test_session_open_skips_routing() {
    let mut harness = TestHarness::new();
    harness.expect_narrative("Toledo, spring of 1520.", "{}");

    let turn = harness.input(CallType::SessionOpen, "").await.unwrap();
    assert!(!turn.transitions.contains(&State::Routing));
}

#[tokio::test]
async fn test_router_failure_fails_open() {
    let mut harness = TestHarness::new();
    harness
        .expect_failure("connection refused")
        .expect_narrative("The corridor is empty.", "{}");

    let turn = harness.input(CallType::Narrative, "I walk on").await.unwrap();

    assert_transitions(&turn, &[State::Routing, State::Generating, State::Idle]);
    assert!(turn.enrichment.is_empty());
    assert!(harness.orchestrator.sticky().is_empty());
}

#[tokio::test]
async fn test_malformed_router_reply_fails_open() {
    let mut harness = TestHarness::new();
    harness
        .expect_router("You should probably look up the queen.")
        .expect_narrative("Nothing stirs.", "{}");

    let turn = harness.input(CallType::Narrative, "I listen").await.unwrap();
    assert_eq!(turn.narrative, "Nothing stirs.");
    assert!(turn.enrichment.is_empty());
}

#[tokio::test]
async fn test_event_detail_attached() {
    let mut harness = TestHarness::new();
    harness
        .expect_router(r#"{"needsSearch": true, "eventSearch": {"keywords": ["cortes"]}, "eventDetailIds": ["e2"]}"#)
        .expect_narrative("You recall the Cortes.", "{}");

    harness
        .input(CallType::Narrative, "What did the Constable say at the Cortes?")
        .await
        .unwrap();

    let snapshot = harness.orchestrator.sticky().snapshot();
    assert_eq!(snapshot.events_with_detail, vec!["e2"]);
    let system = harness.last_system_text().unwrap();
    assert!(system.contains("Castile will not pay for a foreign war."));
}

// =============================================================================
// RETRIES
// =============================================================================

#[tokio::test]
async fn test_fixable_gap_broadens() {
    let mut harness = TestHarness::new();
    harness
        .expect_no_search()
        .expect_narrative(
            "The bishop hesitates.",
            r#"{"missingContext": [{"type": "event_unknown", "description": "the coronation", "fixable": true}]}"#,
        )
        .expect_router(r#"{"needsSearch": true, "eventSearch": {"keywords": ["crowned"]}}"#)
        .expect_narrative("The bishop remembers the coronation.", "{}");

    let turn = harness
        .input(CallType::Dialogue, "Tell me of the coronation")
        .await
        .unwrap();

    assert_transitions(
        &turn,
        &[
            State::Routing,
            State::Generating,
            State::Broadening,
            State::Generating,
            State::Idle,
        ],
    );
    assert_eq!(turn.attempts, 2);
    assert_sticky_contains(&harness, "e1");
    assert_eq!(
        turn.enrichment,
        vec!["the coronation: widened search loaded more records"]
    );

    let requests = harness.client.requests();
    assert!(requests[2].messages[0].text().contains("## Outstanding Gaps"));
    assert!(requests[3].system_text().contains("## Retrieval Notes"));
}

#[tokio::test]
async fn test_unfixable_gap_finalizes_immediately() {
    let mut harness = TestHarness::new();
    harness
        .expect_no_search()
        .expect_narrative(
            "You descend the stairs.",
            r#"{"missingContext": [{"type": "location_detail", "description": "the crypt beneath the cathedral", "fixable": false}]}"#,
        )
        .expect_narrative("The crypt is dark; the sacristan will not say more.", "{}");

    let turn = harness.input(CallType::Narrative, "I enter the crypt").await.unwrap();

    assert_transitions(
        &turn,
        &[State::Routing, State::Generating, State::Finalizing, State::Idle],
    );
    assert_eq!(turn.attempts, 3);
    assert_eq!(harness.calls(), 3);

    let system = harness.last_system_text().unwrap();
    assert!(system.contains("## Final Attempt"));
    assert!(system.contains("the crypt beneath the cathedral: not held in the archive"));
}

#[tokio::test]
async fn test_attempt_cap_forces_final_answer() {
    let gap = r#"{"missingContext": [{"type": "law_unknown", "description": "the salt tax", "fixable": true}]}"#;
    let mut harness = TestHarness::new();
    harness
        .expect_no_search()
        .expect_narrative("Attempt one.", gap)
        .expect_no_search()
        .expect_narrative("Attempt two.", gap)
        .expect_no_search()
        .expect_narrative("Attempt three.", gap);

    let turn = harness.input(CallType::Narrative, "What is the salt tax?").await.unwrap();

    assert_eq!(turn.narrative, "Attempt three.");
    assert_eq!(turn.attempts, 3);
    assert_eq!(turn.unresolved.len(), 1);
    assert_transitions(
        &turn,
        &[
            State::Routing,
            State::Generating,
            State::Broadening,
            State::Generating,
            State::Broadening,
            State::Generating,
            State::Idle,
        ],
    );
    assert_eq!(harness.calls(), 6);
    assert_eq!(harness.client.remaining(), 0);
    assert!(harness.last_system_text().unwrap().contains("## Final Attempt"));
}

#[tokio::test]
async fn test_entity_unknown_resolved_locally() {
    let mut harness = TestHarness::new();
    harness
        .expect_no_search()
        .expect_narrative(
            "Inés looks up.",
            r#"{"missingContext": [{"type": "entity_unknown", "description": "Alonso de Fonseca", "fixable": true}]}"#,
        )
        .expect_narrative("Inés names the bishop.", "{}");

    let turn = harness
        .input(CallType::Dialogue, "Who is Alonso de Fonseca?")
        .await
        .unwrap();

    assert_transitions(
        &turn,
        &[State::Routing, State::Generating, State::Generating, State::Idle],
    );
    assert_sticky_contains(&harness, "c3");
    assert_eq!(harness.calls(), 3);
}

#[tokio::test]
async fn test_name_inside_another_label_still_broadens() {
    let store = MemoryStore::from_entities(vec![Character::new("c5", "Queen Mother Juana")], vec![], vec![]);
    let mut harness = TestHarness::with_store(store, NarratorConfig::default());
    harness
        .expect_no_search()
        .expect_narrative(
            "A maid curtsies.",
            r#"{"missingContext": [{"type": "entity_unknown", "description": "Ana", "fixable": true}]}"#,
        )
        .expect_no_search()
        .expect_narrative("Nobody at court knows an Ana.", "{}");

    let turn = harness.input(CallType::Dialogue, "Fetch Ana").await.unwrap();

    assert_transitions(
        &turn,
        &[
            State::Routing,
            State::Generating,
            State::Broadening,
            State::Generating,
            State::Idle,
        ],
    );
    assert_sticky_missing(&harness, "c5");
    assert_eq!(turn.enrichment, vec!["Ana: nothing further found in the archive"]);
}

#[tokio::test]
async fn test_broadening_router_failure_continues() {
    let mut harness = TestHarness::new();
    harness
        .expect_no_search()
        .expect_narrative(
            "The herald hesitates.",
            r#"{"missingContext": [{"type": "event_unknown", "description": "the siege of Zamora", "fixable": true}]}"#,
        )
        .expect_failure("overloaded")
        .expect_narrative("The herald admits he knows little of Zamora.", "{}");

    let turn = harness
        .input(CallType::Narrative, "What news of the siege?")
        .await
        .unwrap();

    assert_transitions(
        &turn,
        &[
            State::Routing,
            State::Generating,
            State::Broadening,
            State::Generating,
            State::Idle,
        ],
    );
    assert_eq!(turn.attempts, 2);
    assert_eq!(turn.narrative, "The herald admits he knows little of Zamora.");
    assert_eq!(
        turn.enrichment,
        vec!["the siege of Zamora: nothing further found in the archive"]
    );
    assert!(harness.diagnostics().iter().any(|d| matches!(
        d,
        Diagnostic::RouterCall {
            broadened: true,
            outcome: RouterOutcome::FailedOpen { .. },
            ..
        }
    )));
}

#[tokio::test]
async fn test_broadening_garbage_reply_continues() {
    let mut harness = TestHarness::new();
    harness
        .expect_no_search()
        .expect_narrative(
            "The herald hesitates.",
            r#"{"missingContext": [{"type": "event_unknown", "description": "the siege of Zamora", "fixable": true}]}"#,
        )
        .expect_router("I would search for Zamora.")
        .expect_narrative("Little is known of Zamora.", "{}");

    let turn = harness
        .input(CallType::Narrative, "What news of the siege?")
        .await
        .unwrap();

    assert_eq!(turn.attempts, 2);
    assert_eq!(turn.transitions.last(), Some(&State::Idle));
    assert_eq!(harness.client.remaining(), 0);
}

#[tokio::test]
async fn test_broadening_sends_only_fixable_gaps() {
    let mut harness = TestHarness::new();
    harness
        .expect_no_search()
        .expect_narrative(
            "The herald hesitates.",
            r#"{"missingContext": [
                {"type": "event_unknown", "description": "the siege of Zamora", "fixable": true},
                {"type": "world_detail", "description": "the price of bread", "fixable": false}
            ]}"#,
        )
        .expect_no_search()
        .expect_narrative("The herald shrugs.", "{}");

    let turn = harness
        .input(CallType::Narrative, "What news of the siege?")
        .await
        .unwrap();

    let broadened = harness.client.requests()[2].messages[0].text();
    assert!(broadened.contains("- event_unknown: the siege of Zamora"));
    assert!(!broadened.contains("the price of bread"));
    assert_eq!(
        turn.enrichment,
        vec![
            "the price of bread: not held in the archive",
            "the siege of Zamora: nothing further found in the archive",
        ]
    );
}

#[tokio::test]
async fn test_mistyped_metadata_field_still_finalizes() {
    let mut harness = TestHarness::new();
    harness
        .expect_no_search()
        .expect_narrative(
            "You descend the stairs.",
            r#"{"confidence": "high", "missingContext": [{"type": "location_detail", "description": "crypt", "fixable": false}]}"#,
        )
        .expect_narrative("The crypt is dark.", "{}");

    let turn = harness.input(CallType::Narrative, "I enter the crypt").await.unwrap();

    assert_transitions(
        &turn,
        &[State::Routing, State::Generating, State::Finalizing, State::Idle],
    );
    assert!(harness.last_system_text().unwrap().contains("crypt: not held in the archive"));
}

#[tokio::test]
async fn test_mixed_gaps_finalize_after_local_resolution() {
    let mut harness = TestHarness::new();
    harness
        .expect_no_search()
        .expect_narrative(
            "Silence.",
            r#"{"missingContext": [
                {"type": "entity_unknown", "description": "c2", "fixable": true},
                {"type": "world_detail", "description": "the price of bread", "fixable": false}
            ]}"#,
        )
        .expect_narrative("The Constable shrugs at the question of bread.", "{}");

    let turn = harness.input(CallType::Narrative, "I ask about bread").await.unwrap();

    assert_transitions(
        &turn,
        &[State::Routing, State::Generating, State::Finalizing, State::Idle],
    );
    assert_sticky_contains(&harness, "c2");
    assert_eq!(turn.enrichment.len(), 2);
}

#[tokio::test]
async fn test_generation_failure_returns_to_idle() {
    let mut harness = TestHarness::new();
    harness.expect_no_search().expect_failure("overloaded");

    let err = harness.input(CallType::Narrative, "I wait").await.unwrap_err();

    assert!(matches!(err, NarratorError::GenerationFailed(_)));
    assert_idle(&harness);
    assert_eq!(harness.orchestrator.window().len(), 0);
}

#[tokio::test]
async fn test_failure_during_finalizing_is_surfaced() {
    let mut harness = TestHarness::new();
    harness
        .expect_no_search()
        .expect_narrative(
            "Hm.",
            r#"{"missingContext": [{"type": "world_detail", "description": "weather", "fixable": false}]}"#,
        )
        .expect_failure("overloaded");

    let err = harness.input(CallType::Narrative, "Is it raining?").await.unwrap_err();
    assert!(matches!(err, NarratorError::GenerationFailed(_)));
    assert_idle(&harness);
}

// =============================================================================
// EPISODES
// =============================================================================

#[tokio::test]
async fn test_overflow_starts_new_episode() {
    let config = NarratorConfig::default().with_sticky_budget(40);
    let mut harness = TestHarness::with_store(sample_store(), config);
    harness
        .expect_router(r#"{"needsSearch": true, "characterSearch": {"ids": ["c1"]}}"#)
        .expect_narrative("The queen nods.", "{}")
        .expect_router(r#"{"needsSearch": true, "characterSearch": {"ids": ["c2"]}, "eventSearch": {"keywords": ["raiders"]}}"#)
        .expect_narrative("The Constable recounts the raid.", "{}");

    harness.input(CallType::Narrative, "I greet the queen").await.unwrap();
    assert_sticky_contains(&harness, "c1");
    harness.diagnostics();

    harness
        .input(CallType::Narrative, "Tell me about the raid at Burgos")
        .await
        .unwrap();

    assert_sticky_missing(&harness, "c1");
    assert_sticky_contains(&harness, "c2");
    assert_sticky_contains(&harness, "e3");
    assert!(!harness.orchestrator.sticky().is_over_budget());
    assert!(harness.diagnostics().iter().any(|d| matches!(
        d,
        Diagnostic::EpisodeReset {
            reason: ResetReason::Overflow
        }
    )));
}

#[tokio::test]
async fn test_location_change_clears_sticky() {
    let mut harness = TestHarness::new();
    harness
        .expect_router(r#"{"needsSearch": true, "characterSearch": {"ids": ["c1"]}}"#)
        .expect_narrative(
            "You leave the queen and ride for Burgos.",
            r#"{"location": "Burgos", "date": "1520-03-18", "summaryUpdate": "Left Toledo for Burgos."}"#,
        );

    harness.input(CallType::Travel, "I ride to Burgos").await.unwrap();

    assert!(harness.orchestrator.sticky().is_empty());
    let scene = harness.orchestrator.scene();
    assert_eq!(scene.location, "Burgos");
    assert_eq!(scene.date, "1520-03-18");
    assert_eq!(scene.narrative_summary, "Left Toledo for Burgos.");
}

#[tokio::test]
async fn test_same_location_keeps_sticky() {
    let mut harness = TestHarness::new();
    harness
        .expect_router(r#"{"needsSearch": true, "characterSearch": {"ids": ["c1"]}}"#)
        .expect_narrative("The queen smiles.", r#"{"location": "toledo"}"#);

    harness.input(CallType::Narrative, "I smile back").await.unwrap();
    assert_sticky_contains(&harness, "c1");
}

// =============================================================================
// ACCOUNTING
// =============================================================================

#[tokio::test]
async fn test_costs_accumulate_and_reset() {
    let mut harness = TestHarness::new();
    harness
        .expect_no_search()
        .expect_narrative("A quiet evening.", "{}");

    let turn = harness.input(CallType::Narrative, "I rest").await.unwrap();

    let totals = harness.orchestrator.totals().clone();
    assert_eq!(totals.turns, 1);
    assert_eq!(totals.router_calls, 1);
    assert_eq!(totals.generation_calls, 1);
    assert_eq!(totals.input_tokens, 2000);
    assert!(totals.cost_usd > 0.0);
    assert!((turn.cost_usd - totals.cost_usd).abs() < 1e-12);

    harness.orchestrator.start_session("1520-04-01", "Toledo", "");
    assert_eq!(harness.orchestrator.totals().turns, 0);
    assert_eq!(harness.orchestrator.totals().cost_usd, 0.0);
}

#[tokio::test]
async fn test_window_feeds_generation_messages() {
    let mut harness = TestHarness::new();
    harness
        .expect_no_search()
        .expect_narrative("First reply.", "{}")
        .expect_no_search()
        .expect_narrative("Second reply.", "{}");

    harness.input(CallType::Narrative, "first").await.unwrap();
    harness.input(CallType::Narrative, "second").await.unwrap();

    let requests = harness.client.requests();
    let generation = &requests[3];
    assert_eq!(generation.messages.len(), 3);
    assert_eq!(generation.messages[0].text(), "[narrative] first");
    assert_eq!(generation.messages[1].text(), "First reply.");
    assert_eq!(generation.messages[2].text(), "[narrative] second");
}

#[tokio::test]
async fn test_window_replays_the_tagged_user_turn() {
    let mut harness = TestHarness::new();
    harness
        .expect_router(r#"{"needsSearch": false}"#)
        .expect_narrative("She nods.", "{}");

    harness.input(CallType::Dialogue, "I greet the queen").await.unwrap();

    let sent = harness.client.requests()[1].messages[0].text();
    let stored = harness.orchestrator.window().api_messages();
    assert_eq!(stored[0].text(), sent);
    assert_eq!(sent, "[dialogue] I greet the queen");
}
