//! Diagnostic snapshots for an external observability sink.
//!
//! The orchestrator reports state transitions, per-call token usage and cost,
//! sticky context snapshots and episode resets. Sinks are synchronous and
//! must not block: the pipeline never waits on them.

use crate::orchestrator::State;
use crate::sticky::StickySnapshot;
use claude::Usage;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Identifies one narrator session in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token counts of one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenCounts {
    pub input: usize,
    pub output: usize,
    pub cache_write: usize,
    pub cache_read: usize,
}

impl From<Usage> for TokenCounts {
    fn from(usage: Usage) -> Self {
        Self {
            input: usage.input_tokens,
            output: usage.output_tokens,
            cache_write: usage.cache_creation_input_tokens,
            cache_read: usage.cache_read_input_tokens,
        }
    }
}

/// How a router call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RouterOutcome {
    Search { results: usize },
    NoSearchNeeded,
    FailedOpen { reason: String },
}

/// Why sticky context was cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    Overflow,
    LocationChange,
    SessionStart,
    Manual,
}

/// One diagnostic event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Diagnostic {
    Transition {
        from: State,
        to: State,
        attempt: u32,
    },
    RouterCall {
        attempt: u32,
        broadened: bool,
        outcome: RouterOutcome,
        tokens: TokenCounts,
        cost_usd: f64,
    },
    GenerationCall {
        attempt: u32,
        final_attempt: bool,
        tokens: TokenCounts,
        cost_usd: f64,
    },
    Sticky(StickySnapshot),
    EpisodeReset {
        reason: ResetReason,
    },
}

/// A diagnostic tagged with its session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticEntry {
    pub session: SessionId,
    pub diagnostic: Diagnostic,
}

/// Where diagnostics go.
pub trait DiagnosticSink: Send + Sync {
    fn record(&self, entry: &DiagnosticEntry);
}

/// Logs every diagnostic through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, entry: &DiagnosticEntry) {
        let session = entry.session;
        match &entry.diagnostic {
            Diagnostic::Transition { from, to, attempt } => {
                debug!(%session, ?from, ?to, attempt, "transition");
            }
            Diagnostic::RouterCall {
                attempt,
                broadened,
                outcome,
                tokens,
                cost_usd,
            } => {
                info!(
                    %session,
                    attempt,
                    broadened,
                    ?outcome,
                    input_tokens = tokens.input,
                    output_tokens = tokens.output,
                    cost_usd,
                    "router call"
                );
            }
            Diagnostic::GenerationCall {
                attempt,
                final_attempt,
                tokens,
                cost_usd,
            } => {
                info!(
                    %session,
                    attempt,
                    final_attempt,
                    input_tokens = tokens.input,
                    output_tokens = tokens.output,
                    cache_read = tokens.cache_read,
                    cache_write = tokens.cache_write,
                    cost_usd,
                    "generation call"
                );
            }
            Diagnostic::Sticky(snapshot) => {
                debug!(
                    %session,
                    characters = snapshot.character_ids.len(),
                    events = snapshot.event_ids.len(),
                    laws = snapshot.law_ids.len(),
                    estimated_tokens = snapshot.estimated_tokens,
                    budget = snapshot.budget,
                    "sticky context"
                );
            }
            Diagnostic::EpisodeReset { reason } => {
                info!(%session, ?reason, "episode reset");
            }
        }
    }
}

/// Forwards diagnostics to an unbounded channel. A closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DiagnosticEntry>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DiagnosticEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DiagnosticSink for ChannelSink {
    fn record(&self, entry: &DiagnosticEntry) {
        let _ = self.tx.send(entry.clone());
    }
}
