//! Short rolling window of recent exchanges.
//!
//! Only the newest `bound` exchanges are ever handed to the model. The bound is
//! applied when reading; older entries are compacted away lazily so the buffer
//! cannot grow without limit.

use claude::Message;
use serde::{Deserialize, Serialize};

/// Default number of exchanges sent with each generation call.
pub const DEFAULT_WINDOW_SIZE: usize = 8;

/// One player input and the narrator's reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub input: String,
    pub response: String,
    /// Summary line extracted from the response metadata, if any.
    pub extracted: Option<String>,
}

/// Bounded buffer of recent exchanges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationWindow {
    exchanges: Vec<Exchange>,
    bound: usize,
}

impl ConversationWindow {
    pub fn new() -> Self {
        Self::with_bound(DEFAULT_WINDOW_SIZE)
    }

    pub fn with_bound(bound: usize) -> Self {
        Self {
            exchanges: Vec::new(),
            bound,
        }
    }

    /// Record an exchange.
    pub fn add_exchange(
        &mut self,
        input: impl Into<String>,
        response: impl Into<String>,
        extracted: Option<String>,
    ) {
        self.exchanges.push(Exchange {
            input: input.into(),
            response: response.into(),
            extracted,
        });

        if self.exchanges.len() > self.bound * 2 {
            let excess = self.exchanges.len() - self.bound;
            self.exchanges.drain(..excess);
        }
    }

    /// The exchanges inside the window, oldest first.
    pub fn recent(&self) -> &[Exchange] {
        let start = self.exchanges.len().saturating_sub(self.bound);
        &self.exchanges[start..]
    }

    /// Alternating user/assistant messages for the API call, oldest first.
    pub fn api_messages(&self) -> Vec<Message> {
        self.recent()
            .iter()
            .flat_map(|e| [Message::user(&e.input), Message::assistant(&e.response)])
            .collect()
    }

    /// Number of exchanges inside the window.
    pub fn len(&self) -> usize {
        self.recent().len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    pub fn clear(&mut self) {
        self.exchanges.clear();
    }
}

impl Default for ConversationWindow {
    fn default() -> Self {
        Self::new()
    }
}
