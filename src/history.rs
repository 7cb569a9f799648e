//! Bounded per-user chat history.

use credit_ledger::{ChatMessage, UserId};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Idle conversations are pruned once the map grows past this size.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug)]
struct Conversation {
    messages: VecDeque<ChatMessage>,
    last_active: Instant,
}

/// Last `capacity` messages of each user's conversation, oldest first.
#[derive(Debug)]
pub struct ConversationHistory {
    users: RwLock<HashMap<UserId, Conversation>>,
    capacity: usize,
    idle_ttl: Duration,
}

impl ConversationHistory {
    pub fn new(capacity: usize, idle_ttl: Duration) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            idle_ttl,
        }
    }

    /// Append a message, evicting the oldest once the buffer is full.
    pub async fn push(&self, user_id: UserId, message: ChatMessage) {
        let mut users = self.users.write().await;
        if users.len() >= PRUNE_THRESHOLD {
            let idle_ttl = self.idle_ttl;
            users.retain(|_, c| c.last_active.elapsed() < idle_ttl);
        }

        let conversation = users.entry(user_id).or_insert_with(|| Conversation {
            messages: VecDeque::with_capacity(self.capacity),
            last_active: Instant::now(),
        });
        if conversation.messages.len() == self.capacity {
            conversation.messages.pop_front();
        }
        conversation.messages.push_back(message);
        conversation.last_active = Instant::now();
    }

    /// Drop the newest message, used when the request it started failed.
    /// Callers serialize a user's turns, so this is always their own message.
    pub async fn pop_last(&self, user_id: UserId) -> Option<ChatMessage> {
        let mut users = self.users.write().await;
        users
            .get_mut(&user_id)
            .and_then(|c| c.messages.pop_back())
    }

    pub async fn messages(&self, user_id: UserId) -> Vec<ChatMessage> {
        let users = self.users.read().await;
        users
            .get(&user_id)
            .map(|c| c.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn len(&self, user_id: UserId) -> usize {
        let users = self.users.read().await;
        users.get(&user_id).map(|c| c.messages.len()).unwrap_or(0)
    }
}
