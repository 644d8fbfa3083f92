use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use tokio::sync::broadcast;
use tracing::instrument;

use crate::{
    connection::Connector, Conventions, EventBus, ServerAddress, ServerDescription,
    ServerMonitor, ServerRole, TopologyError, TopologyEvent, TopologyMode, TopologySnapshot,
};

/// How membership can change.
#[derive(Debug)]
pub enum Membership {
    /// Standalone: the one seed is the whole topology. No events are ever
    /// published.
    Fixed,
    /// Replica sets and sharded clusters learn members from their primaries
    /// and routers through the event bus.
    Discovered(EventBus),
}

#[derive(Debug)]
struct ServerEntry {
    monitor: Option<ServerMonitor>,
    description: ServerDescription,
}

/// The mutable registry of known servers, their monitors and their latest
/// descriptions. Owned by the topology actor, so at most one scan runs at a
/// time and no monitor is ever probed twice concurrently.
#[derive(Debug)]
pub struct TopologyRegistry {
    mode: TopologyMode,
    membership: Membership,
    servers: BTreeMap<ServerAddress, ServerEntry>,
    connector: Box<dyn Connector>,
    connect_timeout: Duration,
}

impl TopologyRegistry {
    pub fn new(
        mode: TopologyMode,
        seeds: impl IntoIterator<Item = ServerAddress>,
        connector: Box<dyn Connector>,
        conventions: &Conventions,
        events: broadcast::Sender<TopologyEvent>,
    ) -> Result<Self, TopologyError> {
        let servers = seeds
            .into_iter()
            .map(|address| {
                let entry = ServerEntry {
                    monitor: None,
                    description: ServerDescription::unknown(address.clone(), Duration::ZERO, None),
                };
                (address, entry)
            })
            .collect::<BTreeMap<_, _>>();

        let membership = match mode {
            TopologyMode::Standalone => Membership::Fixed,
            TopologyMode::ReplicaSet | TopologyMode::Sharded => {
                Membership::Discovered(EventBus::new(events))
            }
        };

        let registry = Self {
            mode,
            membership,
            servers,
            connector,
            connect_timeout: conventions.connect_timeout(),
        };
        registry.check_mode_invariant()?;
        Ok(registry)
    }

    pub fn mode(&self) -> TopologyMode {
        self.mode
    }

    fn check_mode_invariant(&self) -> Result<(), TopologyError> {
        if self.mode == TopologyMode::Standalone && self.servers.len() != 1 {
            tracing::error!(
                "A standalone topology needs exactly one server, found {}",
                self.servers.len()
            );
            return Err(TopologyError::Configuration(format!(
                "only one server expected in a standalone topology, servers: {:?}",
                self.servers.keys().collect::<Vec<_>>()
            )));
        }
        Ok(())
    }

    /// Gives every known server without a monitor a new one. Existing
    /// monitors are kept. Returns how many were created.
    pub fn ensure_monitors(&mut self) -> usize {
        let mut created = 0;
        for (address, entry) in self.servers.iter_mut() {
            if entry.monitor.is_none() {
                tracing::trace!("Starting monitor for {}", address);
                entry.monitor = Some(ServerMonitor::new(
                    address.clone(),
                    self.connector.clone(),
                    self.connect_timeout,
                ));
                created += 1;
            }
        }
        created
    }

    /// Probes every server once, in address order, replacing each
    /// description. Servers discovered along the way are probed in the same
    /// scan.
    #[instrument(level = "debug", skip(self), fields(mode = %self.mode))]
    pub async fn scan(&mut self) -> Result<(), TopologyError> {
        self.check_mode_invariant()?;
        self.ensure_monitors();

        let mut probed = BTreeSet::new();
        while let Some(address) = self
            .servers
            .keys()
            .find(|address| !probed.contains(*address))
            .cloned()
        {
            probed.insert(address.clone());
            self.probe(&address).await?;
        }

        self.check_mode_invariant()?;
        tracing::debug!("Scan complete, {} servers known", self.servers.len());
        Ok(())
    }

    async fn probe(&mut self, address: &ServerAddress) -> Result<(), TopologyError> {
        let entry = match self.servers.get_mut(address) {
            Some(entry) => entry,
            // Removed earlier in this scan.
            None => return Ok(()),
        };
        // `ensure_monitors` and `add_server` give every entry a monitor.
        let monitor = entry.monitor.as_mut().ok_or_else(|| {
            anyhow::anyhow!("{} is tracked without a monitor", address)
        })?;

        let updated = monitor.probe().await?;
        let previous = std::mem::replace(&mut entry.description, updated.clone());

        self.inspect(&previous, &updated);
        self.apply_pending_events().await;
        Ok(())
    }

    /// Publishes the membership changes a new description implies.
    ///
    /// Only primaries and routers add servers. Only a primary removes them,
    /// and only hosts that its own previous description listed, so an
    /// unreachable or flapping server can never evict anybody.
    fn inspect(&mut self, previous: &ServerDescription, updated: &ServerDescription) {
        let bus = match &mut self.membership {
            Membership::Fixed => return,
            Membership::Discovered(bus) => bus,
        };

        if updated.is_authoritative() {
            for host in updated.last_seen_hosts() {
                if !self.servers.contains_key(host) {
                    bus.publish(TopologyEvent::ServerAdded(host.clone()));
                }
            }
        }

        if updated.role() == ServerRole::Primary {
            for host in previous.last_seen_hosts() {
                if host == updated.address() || updated.last_seen_hosts().contains(host) {
                    continue;
                }
                let still_primary = self
                    .servers
                    .get(host)
                    .map(|entry| entry.description.role() == ServerRole::Primary)
                    .unwrap_or(false);
                if !still_primary {
                    bus.publish(TopologyEvent::ServerRemoved(host.clone()));
                }
            }
        }
    }

    async fn apply_pending_events(&mut self) {
        loop {
            let event = match &mut self.membership {
                Membership::Fixed => None,
                Membership::Discovered(bus) => bus.next_pending(),
            };
            let event = match event {
                Some(event) => event,
                None => break,
            };

            let applied = match &event {
                TopologyEvent::ServerAdded(address) => self.add_server(address.clone()),
                TopologyEvent::ServerRemoved(address) => self.remove_server(address).await,
            };
            if applied {
                self.announce(event);
            }
        }
    }

    fn announce(&self, event: TopologyEvent) {
        if let Membership::Discovered(bus) = &self.membership {
            bus.announce(event);
        }
    }

    fn add_server(&mut self, address: ServerAddress) -> bool {
        if self.servers.contains_key(&address) {
            return false;
        }
        tracing::info!("{} being added to the topology", address);
        let monitor = ServerMonitor::new(address.clone(), self.connector.clone(), self.connect_timeout);
        self.servers.insert(
            address.clone(),
            ServerEntry {
                monitor: Some(monitor),
                description: ServerDescription::unknown(address, Duration::ZERO, None),
            },
        );
        true
    }

    async fn remove_server(&mut self, address: &ServerAddress) -> bool {
        match self.servers.remove(address) {
            Some(mut entry) => {
                if let Some(monitor) = entry.monitor.as_mut() {
                    monitor.disconnect().await;
                }
                tracing::info!("{} removed from the topology", address);
                true
            }
            None => false,
        }
    }

    /// Removes a server and disconnects its monitor. Returns whether the
    /// server was known. Standalone topologies refuse.
    pub async fn remove(&mut self, address: &ServerAddress) -> Result<bool, TopologyError> {
        if let Membership::Fixed = self.membership {
            return Err(TopologyError::Configuration(format!(
                "can not remove {} from a standalone topology",
                address
            )));
        }
        let removed = self.remove_server(address).await;
        if removed {
            self.announce(TopologyEvent::ServerRemoved(address.clone()));
        }
        Ok(removed)
    }

    /// Closes the monitoring connection of one server, keeping it in the
    /// topology. The next probe reconnects.
    pub async fn disconnect(&mut self, address: &ServerAddress) {
        if let Some(monitor) = self
            .servers
            .get_mut(address)
            .and_then(|entry| entry.monitor.as_mut())
        {
            monitor.disconnect().await;
        }
    }

    /// Disconnects every monitor.
    pub async fn close(&mut self) {
        for entry in self.servers.values_mut() {
            if let Some(monitor) = entry.monitor.as_mut() {
                monitor.disconnect().await;
            }
        }
    }

    pub fn next_primary(&self) -> Result<ServerAddress, TopologyError> {
        self.snapshot().next_primary()
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot::new(
            self.mode,
            self.servers.values().map(|entry| entry.description.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use serde_json::json;

    use super::*;
    use crate::test_support::{
        hello_arbiter, hello_mongos, hello_primary, hello_secondary, hello_standalone,
        init_tracing, MockCluster,
    };

    fn address(host: &str) -> ServerAddress {
        ServerAddress::new(host, 27017)
    }

    fn registry(mode: TopologyMode, seeds: &[&str], cluster: &MockCluster) -> Result<TopologyRegistry, TopologyError> {
        let (events, _) = broadcast::channel(16);
        TopologyRegistry::new(
            mode,
            seeds.iter().map(|s| address(s)),
            cluster.connector(),
            &Conventions::default(),
            events,
        )
    }

    fn roles(snapshot: &TopologySnapshot) -> Vec<(String, ServerRole)> {
        snapshot
            .descriptions()
            .map(|d| (d.address().host().to_string(), d.role()))
            .collect()
    }

    /// a: primary, b: secondary, c: secondary
    fn replica_set(cluster: &MockCluster) {
        cluster.set_reply(&address("a"), hello_primary("rs0", &["a", "b", "c"]));
        cluster.set_reply(&address("b"), hello_secondary("rs0", &["a", "b", "c"]));
        cluster.set_reply(&address("c"), hello_secondary("rs0", &["a", "b", "c"]));
    }

    #[tokio::test]
    async fn standalone_requires_exactly_one_server() {
        init_tracing();
        let cluster = MockCluster::new();

        assert!(matches!(
            registry(TopologyMode::Standalone, &[], &cluster),
            Err(TopologyError::Configuration(_))
        ));
        assert!(matches!(
            registry(TopologyMode::Standalone, &["a", "b"], &cluster),
            Err(TopologyError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn standalone_scan_succeeds_and_next_primary_is_the_server() {
        // Arrange
        init_tracing();
        let cluster = MockCluster::new();
        cluster.set_reply(&address("solo"), hello_standalone());
        let mut registry = registry(TopologyMode::Standalone, &["solo"], &cluster).unwrap();

        // Act
        registry.scan().await.unwrap();

        // Assert
        assert_eq!(registry.next_primary().unwrap(), address("solo"));
        assert_eq!(roles(&registry.snapshot()), vec![("solo".to_string(), ServerRole::Standalone)]);
    }

    #[tokio::test]
    async fn standalone_never_adopts_hosts_it_hears_about() {
        init_tracing();
        let cluster = MockCluster::new();
        // Seeded directly at a replica set primary without naming the set.
        cluster.set_reply(&address("a"), hello_primary("rs0", &["a", "b", "c"]));
        let mut registry = registry(TopologyMode::Standalone, &["a"], &cluster).unwrap();

        registry.scan().await.unwrap();

        assert_eq!(registry.snapshot().servers(), vec![address("a")]);
        assert!(matches!(
            registry.remove(&address("a")).await,
            Err(TopologyError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn scan_discovers_members_from_the_primary_and_probes_them() {
        init_tracing();
        let cluster = MockCluster::new();
        replica_set(&cluster);
        let mut registry = registry(TopologyMode::ReplicaSet, &["a"], &cluster).unwrap();

        registry.scan().await.unwrap();

        assert_eq!(
            roles(&registry.snapshot()),
            vec![
                ("a".to_string(), ServerRole::Primary),
                ("b".to_string(), ServerRole::Secondary),
                ("c".to_string(), ServerRole::Secondary),
            ]
        );
        assert_eq!(cluster.probes(&address("b")), 1);
        assert_eq!(registry.next_primary().unwrap(), address("a"));
    }

    #[tokio::test]
    async fn secondaries_alone_never_add_members() {
        init_tracing();
        let cluster = MockCluster::new();
        cluster.set_reply(&address("b"), hello_secondary("rs0", &["a", "b", "c"]));
        let mut registry = registry(TopologyMode::ReplicaSet, &["b"], &cluster).unwrap();

        registry.scan().await.unwrap();

        assert_eq!(registry.snapshot().servers(), vec![address("b")]);
        assert!(matches!(registry.next_primary(), Err(TopologyError::NoPrimary)));
    }

    #[tokio::test]
    async fn scan_twice_without_change_is_idempotent() {
        init_tracing();
        let cluster = MockCluster::new();
        replica_set(&cluster);
        cluster.set_reply(&address("d"), hello_arbiter("rs0", &["a", "b", "c"]));
        let mut registry = registry(TopologyMode::ReplicaSet, &["a", "d"], &cluster).unwrap();

        registry.scan().await.unwrap();
        let first = registry.snapshot();
        registry.scan().await.unwrap();
        let second = registry.snapshot();

        assert_eq!(first.servers(), second.servers());
        for (before, after) in first.descriptions().zip(second.descriptions()) {
            assert!(before.same_state_as(after), "{:?} != {:?}", before, after);
        }
        assert_eq!(registry.ensure_monitors(), 0);
        assert_eq!(cluster.connects(&address("a")), 1);
    }

    #[tokio::test]
    async fn flapping_primary_is_never_removed() {
        init_tracing();
        let cluster = MockCluster::new();
        replica_set(&cluster);
        let mut registry = registry(TopologyMode::ReplicaSet, &["a", "b", "c"], &cluster).unwrap();
        registry.scan().await.unwrap();

        // Primary -> Unknown
        cluster.set_down(&address("a"));
        registry.scan().await.unwrap();
        assert!(registry.snapshot().description(&address("a")).unwrap().is_unknown());

        // Unknown -> Primary
        cluster.set_up(&address("a"));
        registry.scan().await.unwrap();

        assert_eq!(
            registry.snapshot().servers(),
            vec![address("a"), address("b"), address("c")]
        );
        assert_eq!(registry.next_primary().unwrap(), address("a"));
    }

    #[tokio::test]
    async fn unreachable_secondary_is_kept_while_primary_still_lists_it() {
        init_tracing();
        let cluster = MockCluster::new();
        replica_set(&cluster);
        let mut registry = registry(TopologyMode::ReplicaSet, &["a"], &cluster).unwrap();
        registry.scan().await.unwrap();

        cluster.set_down(&address("c"));
        registry.scan().await.unwrap();
        registry.scan().await.unwrap();

        assert!(registry.snapshot().contains(&address("c")));
    }

    #[tokio::test]
    async fn non_primaries_can_not_shrink_membership() {
        // Arrange
        init_tracing();
        let cluster = MockCluster::new();
        replica_set(&cluster);
        let mut registry = registry(TopologyMode::ReplicaSet, &["a"], &cluster).unwrap();
        registry.scan().await.unwrap();

        // Act: the primary goes away and a secondary reports a smaller set.
        cluster.set_down(&address("a"));
        cluster.set_reply(&address("b"), hello_secondary("rs0", &["a", "b"]));
        registry.scan().await.unwrap();

        // Assert
        assert_eq!(
            registry.snapshot().servers(),
            vec![address("a"), address("b"), address("c")]
        );
        assert_eq!(cluster.disconnects(&address("c")), 0);
    }

    #[tokio::test]
    async fn routers_can_not_shrink_membership() {
        init_tracing();
        let cluster = MockCluster::new();
        cluster.set_reply(&address("r1"), hello_mongos());
        cluster.set_reply(&address("r2"), hello_mongos());
        let mut registry = registry(TopologyMode::Sharded, &["r1", "r2"], &cluster).unwrap();
        registry.scan().await.unwrap();

        cluster.set_reply(
            &address("r1"),
            json!({ "ok": 1, "ismaster": true, "msg": "isdbgrid", "hosts": ["r1:27017"] }),
        );
        registry.scan().await.unwrap();

        assert_eq!(registry.snapshot().servers(), vec![address("r1"), address("r2")]);
    }

    #[tokio::test]
    async fn ensure_monitors_only_starts_missing_ones() {
        init_tracing();
        let cluster = MockCluster::new();
        let mut registry = registry(TopologyMode::ReplicaSet, &["a", "b", "c"], &cluster).unwrap();

        assert_eq!(registry.ensure_monitors(), 3);
        assert_eq!(registry.ensure_monitors(), 0);
        // Unreachable seeds still get probed through their monitors.
        registry.scan().await.unwrap();
        assert!(registry.snapshot().descriptions().all(|d| d.is_unknown()));
    }

    #[tokio::test]
    async fn member_dropped_from_primary_host_list_is_removed_and_announced() {
        // Arrange
        init_tracing();
        let cluster = MockCluster::new();
        replica_set(&cluster);
        let (events, _) = broadcast::channel(16);
        let mut receiver = events.subscribe();
        let mut registry = TopologyRegistry::new(
            TopologyMode::ReplicaSet,
            [address("a")],
            cluster.connector(),
            &Conventions::default(),
            events,
        )
        .unwrap();
        registry.scan().await.unwrap();

        // Act
        cluster.set_reply(&address("a"), hello_primary("rs0", &["a", "b"]));
        registry.scan().await.unwrap();

        // Assert
        assert_eq!(registry.snapshot().servers(), vec![address("a"), address("b")]);
        assert!(cluster.disconnects(&address("c")) >= 1);
        let mut announced = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            announced.push(event);
        }
        assert_eq!(
            announced,
            vec![
                TopologyEvent::ServerAdded(address("b")),
                TopologyEvent::ServerAdded(address("c")),
                TopologyEvent::ServerRemoved(address("c")),
            ]
        );
    }

    #[tokio::test]
    async fn new_primary_after_election_does_not_evict_old_primary_it_still_lists() {
        init_tracing();
        let cluster = MockCluster::new();
        replica_set(&cluster);
        let mut registry = registry(TopologyMode::ReplicaSet, &["a"], &cluster).unwrap();
        registry.scan().await.unwrap();

        // Election: b takes over, a steps down to secondary.
        cluster.set_reply(&address("a"), hello_secondary("rs0", &["a", "b", "c"]));
        cluster.set_reply(&address("b"), hello_primary("rs0", &["a", "b", "c"]));
        registry.scan().await.unwrap();

        assert_eq!(registry.snapshot().servers().len(), 3);
        assert_eq!(registry.next_primary().unwrap(), address("b"));
    }

    #[tokio::test]
    async fn explicit_remove_disconnects_monitor() {
        init_tracing();
        let cluster = MockCluster::new();
        replica_set(&cluster);
        let mut registry = registry(TopologyMode::ReplicaSet, &["a"], &cluster).unwrap();
        registry.scan().await.unwrap();

        assert!(registry.remove(&address("b")).await.unwrap());
        assert!(!registry.remove(&address("b")).await.unwrap());

        assert!(!registry.snapshot().contains(&address("b")));
        assert_eq!(cluster.disconnects(&address("b")), 1);
    }

    #[tokio::test]
    async fn sharded_topology_routes_through_routers() {
        init_tracing();
        let cluster = MockCluster::new();
        cluster.set_reply(&address("r1"), hello_mongos());
        cluster.set_reply(&address("r2"), hello_mongos());
        let mut registry = registry(TopologyMode::Sharded, &["r2", "r1"], &cluster).unwrap();

        registry.scan().await.unwrap();

        assert_eq!(registry.next_primary().unwrap(), address("r1"));
    }

    #[tokio::test]
    async fn empty_replica_set_scan_is_not_an_error() {
        init_tracing();
        let cluster = MockCluster::new();
        let mut registry = registry(TopologyMode::ReplicaSet, &[], &cluster).unwrap();

        registry.scan().await.unwrap();

        assert!(registry.snapshot().servers().is_empty());
        assert!(matches!(registry.next_primary(), Err(TopologyError::NoPrimary)));
    }
}
