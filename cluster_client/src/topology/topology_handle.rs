use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::instrument;

use crate::{
    connection::Connector, run_topology_actor, Conventions, ServerAddress, TopologyActor,
    TopologyError, TopologyEvent, TopologyMessage, TopologyMode, TopologyRegistry,
    TopologySnapshot,
};

/**
A handle to the topology actor.

Cloning the handle is cheap and never starts a second actor. When the last
handle is dropped, the actor disconnects every monitor and stops.

Reads ([`Topology::snapshot`], [`Topology::next_primary`]) never wait on the
actor: they copy the snapshot published after the last completed scan or
membership change. Writes ([`Topology::scan`], [`Topology::remove`]) are
serialized through the actor.
*/
#[derive(Clone, Debug)]
pub struct Topology {
    sender: mpsc::Sender<TopologyMessage>,
    snapshot: watch::Receiver<Arc<TopologySnapshot>>,
    events: broadcast::Sender<TopologyEvent>,
}

impl Topology {
    /// Validates the seeds against the mode and spawns the actor. Must be
    /// called from within a tokio runtime.
    pub fn new(
        mode: TopologyMode,
        seeds: Vec<ServerAddress>,
        connector: Box<dyn Connector>,
        conventions: &Conventions,
    ) -> Result<Self, TopologyError> {
        if conventions.heartbeat_frequency().is_zero() {
            return Err(TopologyError::Configuration(
                "heartbeat frequency must be greater than zero".to_string(),
            ));
        }
        let (events, _) = broadcast::channel(64);
        let registry = TopologyRegistry::new(mode, seeds, connector, conventions, events.clone())?;
        let (snapshot_sender, snapshot) = watch::channel(Arc::new(registry.snapshot()));

        let (sender, receiver) = mpsc::channel(8);
        let actor = TopologyActor::new(
            registry,
            receiver,
            snapshot_sender,
            conventions.heartbeat_frequency(),
            conventions.disable_topology_updates(),
        );
        tokio::spawn(run_topology_actor(actor));

        Ok(Self {
            sender,
            snapshot,
            events,
        })
    }

    pub fn mode(&self) -> TopologyMode {
        self.snapshot.borrow().mode()
    }

    /// Copy-on-read view of the topology.
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Membership changes, as they are applied.
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    /// Probes every known server and waits for the scan to finish.
    #[instrument(level = "debug", name = "Topology Handle - Scan", skip(self))]
    pub async fn scan(&self) -> Result<(), TopologyError> {
        self.request(|respond_to| TopologyMessage::Scan { respond_to })
            .await?
    }

    pub fn next_primary(&self) -> Result<ServerAddress, TopologyError> {
        self.snapshot().next_primary()
    }

    #[instrument(level = "debug", name = "Topology Handle - Remove", skip(self))]
    pub async fn remove(&self, address: &ServerAddress) -> Result<bool, TopologyError> {
        let address = address.clone();
        self.request(|respond_to| TopologyMessage::Remove {
            address,
            respond_to,
        })
        .await?
    }

    /// Closes the monitoring connection of one server. Membership is left
    /// alone; the next scan reconnects.
    #[instrument(level = "debug", name = "Topology Handle - Disconnect", skip(self))]
    pub async fn disconnect(&self, address: &ServerAddress) -> Result<(), TopologyError> {
        let address = address.clone();
        self.request(|respond_to| TopologyMessage::Disconnect {
            address,
            respond_to,
        })
        .await
    }

    /// Disconnects every monitor and stops the actor. Every clone of this
    /// handle stops working.
    #[instrument(level = "debug", name = "Topology Handle - Close", skip(self))]
    pub async fn close(&self) -> Result<(), TopologyError> {
        self.request(|respond_to| TopologyMessage::Close { respond_to })
            .await
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> TopologyMessage,
    ) -> Result<T, TopologyError> {
        tracing::trace!("Sending message to topology actor");
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(message(tx))
            .await
            .map_err(|_| anyhow::anyhow!("TopologyActor task has been killed"))?;
        Ok(rx.await.context("TopologyActor task has been killed")?)
    }
}
