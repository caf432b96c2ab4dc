//! Per-topic state: who announced the topic, which of them form our mesh,
//! and which local handlers receive deliveries.

use super::{MessageHandler, SubscriptionId};
use crate::identity::PeerId;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Default)]
pub struct TopicState {
    /// Remote peers that announced this topic.
    pub subscribers: HashSet<PeerId>,
    /// Subset of subscribers we eagerly forward full messages to.
    pub mesh: HashSet<PeerId>,
    pub handlers: Vec<(SubscriptionId, Arc<dyn MessageHandler>)>,
}

impl TopicState {
    pub fn is_subscribed(&self) -> bool {
        !self.handlers.is_empty()
    }

    /// Topic can be dropped: nobody local or remote cares about it.
    pub fn is_idle(&self) -> bool {
        self.handlers.is_empty() && self.subscribers.is_empty()
    }

    pub fn find_handler(&self, handler: &Arc<dyn MessageHandler>) -> Option<SubscriptionId> {
        self.handlers
            .iter()
            .find(|(_, existing)| same_handler(existing, handler))
            .map(|(id, _)| *id)
    }

    pub fn remove_handler(&mut self, id: SubscriptionId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(existing, _)| *existing != id);
        before != self.handlers.len()
    }

    pub fn handlers(&self) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.subscribers.remove(peer);
        self.mesh.remove(peer);
    }

    /// Add random non-mesh subscribers until the mesh holds `target` peers.
    /// Returns the newly grafted peers.
    pub fn fill_mesh(&mut self, target: usize) -> Vec<PeerId> {
        if self.mesh.len() >= target {
            return Vec::new();
        }
        let mut candidates: Vec<PeerId> = self
            .subscribers
            .iter()
            .filter(|peer| !self.mesh.contains(peer))
            .copied()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(target - self.mesh.len());
        self.mesh.extend(candidates.iter().copied());
        candidates
    }

    /// Randomly drop mesh members until `target` remain. Returns the pruned peers.
    pub fn trim_mesh(&mut self, target: usize) -> Vec<PeerId> {
        if self.mesh.len() <= target {
            return Vec::new();
        }
        let mut members: Vec<PeerId> = self.mesh.iter().copied().collect();
        members.shuffle(&mut rand::thread_rng());
        let pruned = members.split_off(target);
        for peer in &pruned {
            self.mesh.remove(peer);
        }
        pruned
    }

    /// Up to `count` random subscribers outside the mesh, for lazy gossip.
    pub fn gossip_targets(&self, count: usize) -> Vec<PeerId> {
        let mut targets: Vec<PeerId> = self
            .subscribers
            .iter()
            .filter(|peer| !self.mesh.contains(peer))
            .copied()
            .collect();
        targets.shuffle(&mut rand::thread_rng());
        targets.truncate(count);
        targets
    }
}

// Data pointers only: vtable pointers for one type may differ between
// codegen units.
fn same_handler(a: &Arc<dyn MessageHandler>, b: &Arc<dyn MessageHandler>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::GossipMessage;

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn state_with(n: u8) -> TopicState {
        let mut state = TopicState::default();
        for i in 1..=n {
            state.subscribers.insert(peer(i));
        }
        state
    }

    #[test]
    fn test_fill_and_trim() {
        let mut state = state_with(8);
        let grafted = state.fill_mesh(6);
        assert_eq!(grafted.len(), 6);
        assert_eq!(state.mesh.len(), 6);
        assert!(state.fill_mesh(6).is_empty());

        let pruned = state.trim_mesh(4);
        assert_eq!(pruned.len(), 2);
        assert_eq!(state.mesh.len(), 4);
        assert!(state.mesh.is_subset(&state.subscribers));
    }

    #[test]
    fn test_fill_limited_by_subscribers() {
        let mut state = state_with(2);
        assert_eq!(state.fill_mesh(6).len(), 2);
        assert!(state.gossip_targets(6).is_empty());
    }

    #[test]
    fn test_remove_peer() {
        let mut state = state_with(3);
        state.fill_mesh(3);
        state.remove_peer(&peer(2));
        assert!(!state.subscribers.contains(&peer(2)));
        assert!(!state.mesh.contains(&peer(2)));
        assert_eq!(state.mesh.len(), 2);
    }

    #[test]
    fn test_handler_identity() {
        let mut state = TopicState::default();
        let handler: Arc<dyn MessageHandler> = Arc::new(|_: &GossipMessage| {});
        let other: Arc<dyn MessageHandler> = Arc::new(|_: &GossipMessage| {});
        state.handlers.push((SubscriptionId(1), handler.clone()));
        assert_eq!(state.find_handler(&handler), Some(SubscriptionId(1)));
        assert_eq!(state.find_handler(&other), None);
        assert!(state.remove_handler(SubscriptionId(1)));
        assert!(state.is_idle());
    }

    #[test]
    fn test_handler_identity_across_coercions() {
        let mut state = TopicState::default();
        let concrete = Arc::new(|_: &GossipMessage| {});
        let stored: Arc<dyn MessageHandler> = concrete.clone();
        let again: Arc<dyn MessageHandler> = concrete;
        state.handlers.push((SubscriptionId(4), stored));
        assert_eq!(state.find_handler(&again), Some(SubscriptionId(4)));
    }
}
