//! Bounded per-peer outbound queue.
//!
//! Publishers never wait: when the queue is full the oldest entry is dropped
//! and the push reports `PublishOverflow`. A single writer task drains it.

use super::GossipError;
use crate::identity::PeerId;
use crate::network::message::WireMessage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

pub struct PeerQueue {
    peer: PeerId,
    capacity: usize,
    inner: Mutex<VecDeque<WireMessage>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl PeerQueue {
    pub fn new(peer: PeerId, capacity: usize) -> Self {
        Self {
            peer,
            capacity: capacity.max(1),
            inner: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn push(&self, message: WireMessage) -> Result<(), GossipError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let overflowed = {
            let mut queue = self.inner.lock();
            let overflowed = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(message);
            overflowed
        };
        self.notify.notify_one();

        if overflowed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(GossipError::PublishOverflow(self.peer.short()));
        }
        Ok(())
    }

    pub fn try_pop(&self) -> Option<WireMessage> {
        self.inner.lock().pop_front()
    }

    /// Wait for the next message. Returns None once the queue is closed and drained.
    pub async fn pop(&self) -> Option<WireMessage> {
        loop {
            if let Some(message) = self.try_pop() {
                return Some(message);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Discard pending messages and wake the writer so it can exit.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.inner.lock().clear();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
