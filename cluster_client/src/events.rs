use std::collections::VecDeque;

use tokio::sync::broadcast;

use crate::ServerAddress;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopologyEvent {
    ServerAdded(ServerAddress),
    ServerRemoved(ServerAddress),
}

/// Carries membership changes from the probe inspection that discovered them
/// to the registry that applies them.
///
/// Delivery is synchronous and ordered: the registry drains the queue after
/// every probe, before the next one runs. Once applied, events are repeated
/// to outside subscribers; a slow or missing subscriber never holds the
/// topology up.
#[derive(Debug)]
pub struct EventBus {
    pending: VecDeque<TopologyEvent>,
    subscribers: broadcast::Sender<TopologyEvent>,
}

impl EventBus {
    pub fn new(subscribers: broadcast::Sender<TopologyEvent>) -> Self {
        Self {
            pending: VecDeque::new(),
            subscribers,
        }
    }

    pub fn publish(&mut self, event: TopologyEvent) {
        tracing::trace!("Publishing {:?}", &event);
        if !self.pending.contains(&event) {
            self.pending.push_back(event);
        }
    }

    /// Takes the next pending event, in publication order.
    pub fn next_pending(&mut self) -> Option<TopologyEvent> {
        self.pending.pop_front()
    }

    /// Tells outside subscribers about an event that has been applied.
    pub fn announce(&self, event: TopologyEvent) {
        // No receivers is fine.
        let _ = self.subscribers.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.subscribers.subscribe()
    }
}
