use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use crate::{HelloReply, ServerAddress};

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ServerRole {
    #[default]
    Unknown,
    Primary,
    Secondary,
    Arbiter,
    Standalone,
    Mongos,
    Hidden,
}

impl ServerRole {
    /// Roles that accept writes.
    pub fn is_primary_like(&self) -> bool {
        matches!(
            self,
            ServerRole::Primary | ServerRole::Standalone | ServerRole::Mongos
        )
    }
}

/// What one probe observed about one server. A new probe produces a new
/// description; descriptions are never updated in place.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescription {
    address: ServerAddress,
    role: ServerRole,
    round_trip_time: Duration,
    last_seen_hosts: BTreeSet<ServerAddress>,
    tags: BTreeMap<String, String>,
    set_name: Option<String>,
    error: Option<String>,
}

impl ServerDescription {
    /// A description for a server that could not be reached or has not been
    /// probed yet. It never carries a host list.
    pub fn unknown(address: ServerAddress, round_trip_time: Duration, error: Option<String>) -> Self {
        Self {
            address,
            role: ServerRole::Unknown,
            round_trip_time,
            last_seen_hosts: BTreeSet::new(),
            tags: BTreeMap::new(),
            set_name: None,
            error,
        }
    }

    pub fn from_hello(address: ServerAddress, reply: &HelloReply, round_trip_time: Duration) -> Self {
        let role = reply.role();
        if role == ServerRole::Unknown {
            return Self::unknown(
                address,
                round_trip_time,
                Some(format!("server is not usable (ok: {})", reply.ok)),
            );
        }

        Self {
            address,
            role,
            round_trip_time,
            last_seen_hosts: reply.all_hosts().cloned().collect(),
            tags: reply.tags.clone(),
            set_name: reply.set_name.clone(),
            error: None,
        }
    }

    /// Builds a known description directly. Mostly useful for selection
    /// against descriptions obtained elsewhere.
    pub fn new(
        address: ServerAddress,
        role: ServerRole,
        round_trip_time: Duration,
        last_seen_hosts: impl IntoIterator<Item = ServerAddress>,
    ) -> Self {
        if role == ServerRole::Unknown {
            return Self::unknown(address, round_trip_time, None);
        }
        Self {
            address,
            role,
            round_trip_time,
            last_seen_hosts: last_seen_hosts.into_iter().collect(),
            tags: BTreeMap::new(),
            set_name: None,
            error: None,
        }
    }

    pub fn with_tags<K, V>(mut self, tags: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tags = tags
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn role(&self) -> ServerRole {
        self.role
    }

    pub fn round_trip_time(&self) -> Duration {
        self.round_trip_time
    }

    pub fn last_seen_hosts(&self) -> &BTreeSet<ServerAddress> {
        &self.last_seen_hosts
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_unknown(&self) -> bool {
        self.role == ServerRole::Unknown
    }

    /// Whether this description may drive membership changes.
    pub fn is_authoritative(&self) -> bool {
        matches!(self.role, ServerRole::Primary | ServerRole::Mongos)
    }

    /// Equal in everything but round-trip time.
    pub fn same_state_as(&self, other: &ServerDescription) -> bool {
        self.address == other.address
            && self.role == other.role
            && self.last_seen_hosts == other.last_seen_hosts
            && self.tags == other.tags
            && self.set_name == other.set_name
    }
}
