// Per-user conversation logs for the chat endpoint.
//
// Entries live in a DashMap keyed by user id. Each conversation sits behind its own async
// mutex so one user's requests run one at a time while other users proceed. Capacity
// eviction never drops a conversation a request still holds, so the map may run over
// capacity until those requests finish.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct HistoryConfig {
    /// Most users kept at once; the least recently touched is evicted past this.
    pub capacity: usize,
    pub ttl: Duration,
    /// Most messages kept per user (a question and its answer are two).
    pub max_turns: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            capacity: 1000,
            ttl: Duration::from_secs(3600),
            max_turns: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Speaker {
    Human,
    Ai,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
}

#[derive(Debug)]
pub struct Conversation {
    turns: VecDeque<Turn>,
    max_turns: usize,
}

impl Conversation {
    fn new(max_turns: usize) -> Self {
        Conversation {
            turns: VecDeque::new(),
            max_turns,
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Records a completed exchange, dropping the oldest messages past the cap.
    pub fn record(&mut self, question: &str, answer: &str) {
        self.turns.push_back(Turn {
            speaker: Speaker::Human,
            text: question.to_string(),
        });
        self.turns.push_back(Turn {
            speaker: Speaker::Ai,
            text: answer.to_string(),
        });
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
    }

    /// Prompt rendering, oldest first.
    pub fn transcript(&self) -> String {
        if self.turns.is_empty() {
            return "(none)".to_string();
        }
        self.turns
            .iter()
            .map(|t| match t.speaker {
                Speaker::Human => format!("Human: {}", t.text),
                Speaker::Ai => format!("AI: {}", t.text),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

struct Slot {
    conversation: Arc<Mutex<Conversation>>,
    last_touched: Instant,
}

impl Slot {
    /// Held by a request, locked or waiting on the lock.
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.conversation) > 1
    }
}

pub struct ChatHistory {
    config: HistoryConfig,
    users: DashMap<String, Slot>,
}

impl ChatHistory {
    pub fn new(config: HistoryConfig) -> Self {
        ChatHistory {
            config,
            users: DashMap::new(),
        }
    }

    /// The conversation of `user_id`, created empty if unknown or expired.
    pub fn conversation(&self, user_id: &str) -> Arc<Mutex<Conversation>> {
        self.evict_expired();

        let now = Instant::now();
        let conversation = {
            let mut slot = self.users.entry(user_id.to_string()).or_insert_with(|| Slot {
                conversation: Arc::new(Mutex::new(Conversation::new(self.config.max_turns))),
                last_touched: now,
            });
            slot.last_touched = now;
            slot.conversation.clone()
        };

        if self.users.len() > self.config.capacity {
            self.evict_oldest(user_id);
        }
        conversation
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    fn evict_expired(&self) {
        let ttl = self.config.ttl;
        let before = self.users.len();
        self.users.retain(|_, slot| slot.last_touched.elapsed() < ttl);
        let evicted = before.saturating_sub(self.users.len());
        if evicted > 0 {
            debug!(evicted, "Expired chat histories");
        }
    }

    fn evict_oldest(&self, keep: &str) {
        while self.users.len() > self.config.capacity {
            let oldest = self
                .users
                .iter()
                .filter(|entry| entry.key() != keep && !entry.value().in_use())
                .min_by_key(|entry| entry.value().last_touched)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(user_id) => {
                    self.users.remove(&user_id);
                    debug!(user_id = %user_id, "Evicted chat history over capacity");
                }
                None => {
                    debug!(users = self.users.len(), "Chat history over capacity, all in use");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_turns_are_capped() {
        let history = ChatHistory::new(HistoryConfig {
            max_turns: 4,
            ..HistoryConfig::default()
        });
        let convo = history.conversation("u1");
        let mut guard = convo.lock().await;
        for i in 0..3 {
            guard.record(&format!("q{}", i), &format!("a{}", i));
        }
        assert_eq!(guard.len(), 4);
        assert_eq!(guard.transcript(), "Human: q1\nAI: a1\nHuman: q2\nAI: a2");
    }

    #[tokio::test]
    async fn test_users_do_not_share_history() {
        let history = ChatHistory::new(HistoryConfig::default());
        history.conversation("alice").lock().await.record("hi", "hello");
        assert!(history.conversation("bob").lock().await.is_empty());
        assert_eq!(history.conversation("alice").lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_touched() {
        let history = ChatHistory::new(HistoryConfig {
            capacity: 2,
            ..HistoryConfig::default()
        });
        history.conversation("a");
        std::thread::sleep(Duration::from_millis(2));
        history.conversation("b");
        std::thread::sleep(Duration::from_millis(2));
        history.conversation("a");
        std::thread::sleep(Duration::from_millis(2));
        history.conversation("c");

        assert_eq!(history.len(), 2);
        assert!(history.users.contains_key("a"));
        assert!(history.users.contains_key("c"));
    }

    #[tokio::test]
    async fn test_capacity_keeps_conversation_in_flight() {
        let history = ChatHistory::new(HistoryConfig {
            capacity: 1,
            ..HistoryConfig::default()
        });
        let first = history.conversation("a");
        let mut guard = first.lock().await;
        std::thread::sleep(Duration::from_millis(2));
        history.conversation("b");

        // "a" is still held, so it survives and the map runs over capacity
        assert!(history.users.contains_key("a"));
        let again = history.conversation("a");
        assert!(Arc::ptr_eq(&first, &again));
        assert!(again.try_lock().is_err());

        guard.record("q", "a");
        drop(guard);
        drop(again);
        drop(first);
        std::thread::sleep(Duration::from_millis(2));
        history.conversation("c");
        assert_eq!(history.len(), 1);
        assert!(history.users.contains_key("c"));
    }

    #[tokio::test]
    async fn test_expired_histories_are_dropped() {
        let history = ChatHistory::new(HistoryConfig {
            ttl: Duration::from_millis(5),
            ..HistoryConfig::default()
        });
        history.conversation("old").lock().await.record("q", "a");
        std::thread::sleep(Duration::from_millis(20));
        assert!(history.conversation("old").lock().await.is_empty());
    }
}
