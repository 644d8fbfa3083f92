use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};
use tracing::{instrument, Span};
use uuid::Uuid;

use crate::{TopologyMessage, TopologyRegistry, TopologySnapshot};

pub struct TopologyActor {
    registry: TopologyRegistry,
    receiver: mpsc::Receiver<TopologyMessage>,
    /// Readers select from whatever was last published here.
    snapshot_sender: watch::Sender<Arc<TopologySnapshot>>,
    heartbeat_frequency: Duration,
    disable_topology_updates: bool,
}

impl TopologyActor {
    pub fn new(
        registry: TopologyRegistry,
        receiver: mpsc::Receiver<TopologyMessage>,
        snapshot_sender: watch::Sender<Arc<TopologySnapshot>>,
        heartbeat_frequency: Duration,
        disable_topology_updates: bool,
    ) -> Self {
        Self {
            registry,
            receiver,
            snapshot_sender,
            heartbeat_frequency,
            disable_topology_updates,
        }
    }

    /// Message handler for the TopologyActor. Returns false once the actor
    /// should stop.
    #[instrument(
        level = "debug",
        name = "Topology Actor - Handle Message",
        skip(self),
        fields(correlation_id)
    )]
    async fn handle_message(&mut self, msg: TopologyMessage) -> bool {
        // Apply a correlation id to all child spans of this message handler
        Span::current().record("correlation_id", Uuid::new_v4().to_string());
        match msg {
            TopologyMessage::Scan { respond_to } => {
                let result = self.registry.scan().await;
                if result.is_ok() {
                    self.publish_snapshot();
                }
                let _ = respond_to.send(result);
            }
            TopologyMessage::Remove {
                address,
                respond_to,
            } => {
                let result = self.registry.remove(&address).await;
                self.publish_snapshot();
                let _ = respond_to.send(result);
            }
            TopologyMessage::Disconnect {
                address,
                respond_to,
            } => {
                self.registry.disconnect(&address).await;
                let _ = respond_to.send(());
            }
            TopologyMessage::Close { respond_to } => {
                self.registry.close().await;
                let _ = respond_to.send(());
                return false;
            }
        }
        true
    }

    #[instrument(level = "debug", name = "Topology Actor - Heartbeat", skip(self))]
    async fn heartbeat(&mut self) {
        tracing::debug!("Scanning topology via heartbeat.");
        match self.registry.scan().await {
            Ok(()) => self.publish_snapshot(),
            Err(e) => tracing::error!("Heartbeat scan failed. Caused by: {}", e),
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = Arc::new(self.registry.snapshot());
        self.snapshot_sender.send_if_modified(|current| {
            if **current == *snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

#[instrument(level = "debug", name = "Running Topology Actor", skip(actor))]
pub async fn run_topology_actor(mut actor: TopologyActor) {
    let mut heartbeat = tokio::time::interval(actor.heartbeat_frequency);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let heartbeat_enabled = !actor.disable_topology_updates;

    loop {
        tokio::select! {
            _ = heartbeat.tick(), if heartbeat_enabled => {
                actor.heartbeat().await;
            },
            opt_msg = actor.receiver.recv() => {
                let msg = match opt_msg {
                    Some(msg) => msg,
                    None => {
                        tracing::debug!("Every topology handle is gone, closing monitors.");
                        actor.registry.close().await;
                        break;
                    }
                };
                if !actor.handle_message(msg).await {
                    break;
                }
            },
        }
    }
}
