//! Context retrieval and prompt orchestration for an LLM narrator.
//!
//! This crate provides:
//! - A cheap router call that picks which characters, events and laws a turn needs
//! - Local scoring search over the entity store
//! - Budget-capped sticky context with all-or-nothing episode resets
//! - Layered, cache-tagged prompt assembly
//! - A bounded retry state machine that degrades gracefully when context is missing
//!
//! # Quick Start
//!
//! ```ignore
//! use narrator_core::{CallType, MemoryStore, NarratorConfig, NarratorSession};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MemoryStore::load("world.json").await?;
//!     let session = NarratorSession::from_env(Arc::new(store), NarratorConfig::default())?;
//!     session.try_with(|o| o.start_session("1520-03-14", "Toledo", ""))?;
//!
//!     let turn = session.submit(CallType::Dialogue, "I ask the queen about the edict").await?;
//!     println!("{}", turn.narrative);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod diagnostics;
pub mod entity;
pub mod index;
pub mod orchestrator;
pub mod prompt;
pub mod response;
pub mod router;
pub mod search;
pub mod session;
pub mod sticky;
pub mod store;
pub mod testing;
pub mod window;

// Primary public API
pub use client::CompletionClient;
pub use config::{ModelPricing, NarratorConfig, PricingTable};
pub use diagnostics::{ChannelSink, Diagnostic, DiagnosticSink, SessionId, TracingSink};
pub use entity::{Character, EntityError, EntityKind, Event, Law};
pub use orchestrator::{Orchestrator, Scene, SessionTotals, State, Turn};
pub use prompt::{CallType, PromptLibrary};
pub use response::{GapClass, GenerationMetadata, MissingContext};
pub use session::{NarratorError, NarratorSession};
pub use sticky::{StickyContext, StickySnapshot};
pub use store::{EntityStore, MemoryStore};
pub use testing::{MockClient, MockReply, TestHarness};
pub use window::ConversationWindow;
