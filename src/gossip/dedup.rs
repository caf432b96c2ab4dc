//! Message deduplication and the recent-message cache.
//!
//! `SeenCache` is a time-windowed filter bounded both by count (LRU eviction)
//! and by age. `MessageCache` keeps full messages for a few heartbeat windows
//! so `IWant` requests can be answered and `IHave` advertised.

use super::{GossipMessage, MessageId};
use lru::LruCache;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

fn non_zero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN)
}

pub struct SeenCache {
    entries: LruCache<MessageId, Instant>,
    ttl: Duration,
}

impl SeenCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: LruCache::new(non_zero(capacity)),
            ttl,
        }
    }

    /// Returns true if the id was already seen within the TTL; records it otherwise.
    pub fn check_and_insert(&mut self, id: &MessageId) -> bool {
        let now = Instant::now();
        // peek: a hit must not move the entry ahead of newer timestamps
        if let Some(seen_at) = self.entries.peek(id) {
            if now.duration_since(*seen_at) < self.ttl {
                return true;
            }
        }
        self.entries.put(*id, now);
        false
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries
            .peek(id)
            .is_some_and(|seen_at| seen_at.elapsed() < self.ttl)
    }

    /// Drop expired entries. Oldest entries sit at the LRU tail.
    pub fn expire(&mut self) {
        while let Some((_, seen_at)) = self.entries.peek_lru() {
            if seen_at.elapsed() < self.ttl {
                break;
            }
            self.entries.pop_lru();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct MessageCache {
    messages: LruCache<MessageId, GossipMessage>,
    // One window per heartbeat, newest first.
    history: VecDeque<Vec<(MessageId, String)>>,
    history_length: usize,
    gossip_windows: usize,
}

impl MessageCache {
    pub fn new(capacity: usize, history_length: usize, gossip_windows: usize) -> Self {
        let history_length = history_length.max(1);
        let mut history = VecDeque::with_capacity(history_length);
        history.push_front(Vec::new());
        Self {
            messages: LruCache::new(non_zero(capacity)),
            history,
            history_length,
            gossip_windows: gossip_windows.clamp(1, history_length),
        }
    }

    pub fn put(&mut self, message: GossipMessage) {
        let id = message.id();
        if self.messages.contains(&id) {
            return;
        }
        if let Some(window) = self.history.front_mut() {
            window.push((id, message.topic.clone()));
        }
        self.messages.put(id, message);
    }

    pub fn get(&self, id: &MessageId) -> Option<&GossipMessage> {
        self.messages.peek(id)
    }

    /// Ids from the most recent gossip windows for a topic (newest first).
    pub fn recent_ids(&self, topic: &str, limit: usize) -> Vec<MessageId> {
        self.history
            .iter()
            .take(self.gossip_windows)
            .flat_map(|window| window.iter().rev())
            .filter(|(id, t)| t == topic && self.messages.contains(id))
            .map(|(id, _)| *id)
            .take(limit)
            .collect()
    }

    /// Advance one heartbeat window, forgetting the oldest one.
    pub fn shift(&mut self) {
        self.history.push_front(Vec::new());
        while self.history.len() > self.history_length {
            if let Some(window) = self.history.pop_back() {
                for (id, _) in window {
                    self.messages.pop(&id);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
