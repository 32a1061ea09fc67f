//! Per-counterparty agent session: conversation memory plus the wallet tool set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::identity::Identity;
use crate::tools::WalletTools;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message of prior conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryTurn {
    pub role: Role,
    pub content: String,
}

/// Turn history that is replayed to the reasoner.
///
/// Always holds complete user/assistant exchanges: a turn is recorded only once
/// the reply for it exists, so a failed turn leaves no dangling user message.
#[derive(Debug, Clone, Default)]
pub struct ConversationMemory {
    turns: VecDeque<MemoryTurn>,
    max_exchanges: usize,
}

impl ConversationMemory {
    /// `max_exchanges == 0` keeps everything.
    pub fn new(max_exchanges: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            max_exchanges,
        }
    }

    pub fn record_exchange(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        self.turns.push_back(MemoryTurn {
            role: Role::User,
            content: user.into(),
        });
        self.turns.push_back(MemoryTurn {
            role: Role::Assistant,
            content: assistant.into(),
        });

        if self.max_exchanges > 0 {
            while self.turns.len() > self.max_exchanges * 2 {
                // drop the oldest exchange as a pair
                self.turns.pop_front();
                self.turns.pop_front();
            }
        }
    }

    pub fn turns(&self) -> impl Iterator<Item = &MemoryTurn> {
        self.turns.iter()
    }

    pub fn exchange_count(&self) -> usize {
        self.turns.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

pub struct AgentSession {
    pub identity: Identity,
    pub memory: ConversationMemory,
    pub tools: Arc<dyn WalletTools>,
    /// Fixed system instruction shared by every session.
    pub instructions: Arc<str>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl AgentSession {
    pub fn new(
        identity: Identity,
        tools: Arc<dyn WalletTools>,
        instructions: Arc<str>,
        max_history_turns: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            identity,
            memory: ConversationMemory::new(max_history_turns),
            tools,
            instructions,
            created_at: now,
            last_active: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }
}

impl std::fmt::Debug for AgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("identity", &self.identity)
            .field("wallet", &self.tools.address())
            .field("exchanges", &self.memory.exchange_count())
            .field("created_at", &self.created_at)
            .finish()
    }
}
