//! Conversation history with bounded retention
//!
//! The store keeps the most recent `K` exchanges (a user message plus the
//! assistant reply that follows it). When a new user message pushes the
//! exchange count over `K`, the oldest exchange is evicted from the front.
//!
//! The store is not synchronized. It is owned by the inference engine and
//! only touched while the single-flight gate is held.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of retained exchanges
pub const DEFAULT_MAX_EXCHANGES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single immutable chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    role: Role,
    content: String,
    timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), timestamp: Utc::now() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Ordered message history retaining at most `max_exchanges` exchanges
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    messages: VecDeque<Message>,
    max_exchanges: usize,
}

impl Default for ConversationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EXCHANGES)
    }
}

impl ConversationHistory {
    /// Create an empty history. A bound of zero is raised to one.
    pub fn new(max_exchanges: usize) -> Self {
        let max_exchanges = max_exchanges.max(1);
        Self { messages: VecDeque::with_capacity(max_exchanges * 2 + 1), max_exchanges }
    }

    /// Append a message, evicting the oldest exchanges while more than
    /// `max_exchanges` user messages are held. The store never holds more
    /// than `2 * max_exchanges` messages; past that the oldest messages go
    /// one at a time.
    pub fn append(&mut self, message: Message) {
        self.messages.push_back(message);
        while self.exchange_count() > self.max_exchanges {
            self.evict_oldest_exchange();
        }
        while self.messages.len() > 2 * self.max_exchanges {
            self.messages.pop_front();
        }
    }

    /// Append a completed user/assistant exchange
    pub fn commit_exchange(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        self.append(Message::user(user));
        self.append(Message::assistant(assistant));
    }

    /// Copy of the current history, oldest first
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Number of exchanges currently held (counted by user messages)
    pub fn exchange_count(&self) -> usize {
        self.messages.iter().filter(|m| m.role == Role::User).count()
    }

    pub fn max_exchanges(&self) -> usize {
        self.max_exchanges
    }

    // Drops everything up to and including the first user message, then the
    // replies that belong to it.
    fn evict_oldest_exchange(&mut self) {
        while let Some(front) = self.messages.pop_front() {
            if front.role == Role::User {
                break;
            }
        }
        while self.messages.front().is_some_and(|m| m.role != Role::User) {
            self.messages.pop_front();
        }
    }
}
