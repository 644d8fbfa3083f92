use std::{collections::BTreeMap, str::FromStr};

use crate::{
    error_chain_fmt, parse_tag_set, AddressError, ReadMode, ReadPreference, SelectionError,
    ServerAddress, TopologyMode,
};

const SCHEME: &str = "mongodb://";

/// A parsed `mongodb://host[:port][,host[:port]...][/[database]][?options]`
/// string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    hosts: Vec<ServerAddress>,
    database: Option<String>,
    replica_set: Option<String>,
    direct: bool,
    read_preference: Option<ReadPreference>,
    /// Options this client does not act on, kept for whoever does.
    options: BTreeMap<String, String>,
}

impl ConnectionString {
    pub fn hosts(&self) -> &[ServerAddress] {
        &self.hosts
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn replica_set(&self) -> Option<&str> {
        self.replica_set.as_deref()
    }

    pub fn read_preference(&self) -> Option<&ReadPreference> {
        self.read_preference.as_ref()
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    /// The mode the options ask for, if any. `connect=direct` wins over
    /// `replicaSet`.
    pub fn mode(&self) -> Option<TopologyMode> {
        if self.direct {
            Some(TopologyMode::Standalone)
        } else if self.replica_set.is_some() {
            Some(TopologyMode::ReplicaSet)
        } else {
            None
        }
    }
}

impl FromStr for ConnectionString {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .trim()
            .strip_prefix(SCHEME)
            .ok_or_else(|| ConnectionStringError::InvalidScheme(s.to_string()))?;

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        let (host_list, database) = match location.split_once('/') {
            Some((hosts, database)) => (hosts, Some(database)),
            None => (location, None),
        };

        if host_list.trim().is_empty() {
            return Err(ConnectionStringError::EmptyHostList);
        }
        let hosts = host_list
            .split(',')
            .map(str::parse::<ServerAddress>)
            .collect::<Result<Vec<_>, _>>()?;

        let mut replica_set = None;
        let mut direct = false;
        let mut mode = None;
        let mut tag_sets = Vec::new();
        let mut options = BTreeMap::new();
        for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "replicaSet" => replica_set = Some(value.into_owned()),
                "connect" => direct = value.eq_ignore_ascii_case("direct"),
                "readPreference" => mode = Some(value.parse::<ReadMode>()?),
                "readPreferenceTags" => tag_sets.push(parse_tag_set(&value)?),
                _ => {
                    tracing::debug!("Ignoring connection string option `{}`", key);
                    options.insert(key.into_owned(), value.into_owned());
                }
            }
        }

        let read_preference = match (mode, tag_sets.is_empty()) {
            (Some(mode), _) => Some(ReadPreference::new(mode, tag_sets)?),
            (None, true) => None,
            (None, false) => return Err(SelectionError::TagSetsWithPrimary.into()),
        };

        Ok(Self {
            hosts,
            database: database.filter(|d| !d.is_empty()).map(str::to_string),
            replica_set,
            direct,
            read_preference,
            options,
        })
    }
}

#[derive(thiserror::Error)]
pub enum ConnectionStringError {
    #[error("Connection string `{0}` does not start with `mongodb://`")]
    InvalidScheme(String),
    #[error("Connection string has no hosts")]
    EmptyHostList,
    #[error(transparent)]
    InvalidHost(#[from] AddressError),
    #[error(transparent)]
    InvalidReadPreference(#[from] SelectionError),
}
impl std::fmt::Debug for ConnectionStringError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
