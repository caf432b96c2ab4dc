//! Per-peer rate limiting for inbound gossip traffic.
//!
//! Protects the node against a single authenticated peer flooding it with
//! publishes or control messages.

use crate::identity::PeerId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    limits: HashMap<&'static str, (Duration, u32)>,
    counters: HashMap<(&'static str, PeerId), (Instant, u32)>,
    last_cleanup: Instant,
}

impl RateLimiter {
    /// `publish_per_second` bounds `Publish` messages; the other buckets are fixed.
    pub fn new(publish_per_second: u32) -> Self {
        Self {
            limits: [
                ("publish", (Duration::from_secs(1), publish_per_second)),
                ("announce", (Duration::from_secs(1), 20)), // 20 announcements/sec
                ("control", (Duration::from_secs(1), 50)),  // 50 graft/prune/sec
                ("ihave", (Duration::from_secs(1), 20)),    // 20 IHave/sec
                ("iwant", (Duration::from_secs(1), 10)),    // 10 IWant/sec
                ("exchange", (Duration::from_secs(1), 100)), // 100 block requests/replies/sec
            ]
            .into(),
            counters: HashMap::new(),
            last_cleanup: Instant::now(),
        }
    }

    /// Returns true when the message is allowed.
    pub fn check(&mut self, key: &'static str, peer: PeerId) -> bool {
        let (window, max) = self
            .limits
            .get(key)
            .copied()
            .unwrap_or((Duration::from_secs(1), 10));

        let now = Instant::now();

        // Cleanup expired entries every 10 seconds (prevents unbounded memory growth)
        if now.duration_since(self.last_cleanup) > Duration::from_secs(10) {
            let max_age = window * 10;
            self.counters
                .retain(|_, (last_reset, _)| now.duration_since(*last_reset) < max_age);
            self.last_cleanup = now;
        }

        let (last_reset, count) = self.counters.entry((key, peer)).or_insert((now, 0));

        if now.duration_since(*last_reset) > window {
            *last_reset = now;
            *count = 0;
        }

        if *count >= max {
            false
        } else {
            *count += 1;
            true
        }
    }

    /// Drop all counters for a peer (called on disconnect).
    pub fn forget(&mut self, peer: &PeerId) {
        self.counters.retain(|(_, p), _| p != peer);
    }
}
