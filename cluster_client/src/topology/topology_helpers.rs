use std::{collections::BTreeMap, fmt};

use tokio::sync::oneshot;

use crate::{ServerAddress, ServerDescription, ServerRole, TopologyError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyMode {
    /// Exactly one server, fixed for the lifetime of the topology.
    #[default]
    Standalone,
    /// Members are discovered from the primary's host list.
    ReplicaSet,
    /// One or more routers.
    Sharded,
}

impl fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TopologyMode::Standalone => "standalone",
            TopologyMode::ReplicaSet => "replica set",
            TopologyMode::Sharded => "sharded",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum TopologyMessage {
    /// Probes every known server once.
    Scan {
        respond_to: oneshot::Sender<Result<(), TopologyError>>,
    },
    /// Removes a server and disconnects its monitor.
    Remove {
        address: ServerAddress,
        respond_to: oneshot::Sender<Result<bool, TopologyError>>,
    },
    /// Closes one monitoring connection without touching membership.
    Disconnect {
        address: ServerAddress,
        respond_to: oneshot::Sender<()>,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

/// A consistent copy of the topology as of the last completed change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologySnapshot {
    mode: TopologyMode,
    servers: BTreeMap<ServerAddress, ServerDescription>,
}

impl TopologySnapshot {
    pub fn new(mode: TopologyMode, descriptions: impl IntoIterator<Item = ServerDescription>) -> Self {
        Self {
            mode,
            servers: descriptions
                .into_iter()
                .map(|d| (d.address().clone(), d))
                .collect(),
        }
    }

    pub fn mode(&self) -> TopologyMode {
        self.mode
    }

    /// Every description, in address order.
    pub fn descriptions(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values()
    }

    pub fn description(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub fn servers(&self) -> Vec<ServerAddress> {
        self.servers.keys().cloned().collect()
    }

    pub fn contains(&self, address: &ServerAddress) -> bool {
        self.servers.contains_key(address)
    }

    pub fn primary(&self) -> Option<&ServerDescription> {
        self.with_role(ServerRole::Primary).next()
    }

    pub fn secondaries(&self) -> Vec<&ServerDescription> {
        self.with_role(ServerRole::Secondary).collect()
    }

    pub fn arbiters(&self) -> Vec<&ServerDescription> {
        self.with_role(ServerRole::Arbiter).collect()
    }

    fn with_role(&self, role: ServerRole) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values().filter(move |d| d.role() == role)
    }

    /// The server writes go to.
    ///
    /// A standalone topology always answers with its only server, reachable
    /// or not. A sharded one answers with its first reachable router.
    pub fn next_primary(&self) -> Result<ServerAddress, TopologyError> {
        let primary = match self.mode {
            TopologyMode::Standalone => {
                if self.servers.len() != 1 {
                    return Err(TopologyError::Configuration(format!(
                        "only one server expected in a standalone topology, found {:?}",
                        self.servers()
                    )));
                }
                self.servers.keys().next()
            }
            TopologyMode::ReplicaSet => self.primary().map(ServerDescription::address),
            TopologyMode::Sharded => self
                .with_role(ServerRole::Mongos)
                .next()
                .map(ServerDescription::address),
        };
        primary.cloned().ok_or(TopologyError::NoPrimary)
    }
}
